use crate::bank::dispatcher::Reply;
use crate::bank::types::{FleetStats, Identity, PushEvent, Revision, Stamped, Transaction};
use crate::error::AppError;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPhase {
    #[default]
    Unknown,
    Loading,
    Known,
    /// Data is held but the push channel was lost after it arrived.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    Stale { incoming: Revision, held: Revision },
    Filtered,
}

/// A successful pull reply, already translated into the canonical entities.
#[derive(Debug, Clone, PartialEq)]
pub enum PullUpdate {
    Identified {
        identity: Identity,
        balance: Decimal,
    },
    Balance {
        identity: String,
        balance: Decimal,
    },
    /// Balance returned by a deposit, withdrawal or transfer. Opens the
    /// confirmation grace window.
    MutatedBalance {
        identity: String,
        balance: Decimal,
    },
    History {
        identity: String,
        transactions: Vec<Transaction>,
    },
    Stats {
        stats: FleetStats,
    },
}

impl PullUpdate {
    pub fn from_reply(reply: &Reply) -> Vec<Self> {
        match reply {
            Reply::Identified { identity, balance } => vec![Self::Identified {
                identity: identity.clone(),
                balance: *balance,
            }],
            Reply::Balance { identity, balance } => vec![Self::Balance {
                identity: identity.clone(),
                balance: *balance,
            }],
            Reply::Mutated {
                identity, balance, ..
            } => vec![Self::MutatedBalance {
                identity: identity.clone(),
                balance: *balance,
            }],
            Reply::Transferred {
                from,
                to,
                from_balance,
                to_balance,
                ..
            } => [(from, from_balance), (to, to_balance)]
                .into_iter()
                .filter_map(|(identity, balance)| {
                    balance.map(|balance| Self::MutatedBalance {
                        identity: identity.clone(),
                        balance,
                    })
                })
                .collect(),
            Reply::History {
                identity,
                transactions,
            } => vec![Self::History {
                identity: identity.clone(),
                transactions: transactions.clone(),
            }],
            Reply::Stats { stats } => vec![Self::Stats { stats: *stats }],
            Reply::AccountCreated { .. } | Reply::Simulation { .. } => Vec::new(),
        }
    }
}

/// Read-only copy of one identity's reconciled state.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub identity: String,
    pub profile: Option<Identity>,
    pub balance: Option<Decimal>,
    pub transactions: Option<Vec<Transaction>>,
    pub revision: Revision,
    pub phase: SnapshotPhase,
    pub awaiting_confirmation: bool,
    pub inconsistent: bool,
}

impl AccountView {
    /// History for display, newest first.
    pub fn transactions_newest_first(&self) -> Vec<Transaction> {
        self.transactions
            .as_deref()
            .map(|transactions| transactions.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// The flagged disagreement as an `InconsistentState` error. The snapshot
    /// itself still holds both values.
    pub fn inconsistency(&self) -> Option<AppError> {
        if !self.inconsistent {
            return None;
        }
        let newest = self
            .transactions
            .as_deref()
            .and_then(<[Transaction]>::last)
            .map(|transaction| transaction.resulting_balance);
        Some(inconsistent_state(&self.identity, self.balance, newest))
    }
}

fn inconsistent_state(identity: &str, balance: Option<Decimal>, newest: Option<Decimal>) -> AppError {
    let shown = |value: Option<Decimal>| value.map_or_else(|| "-".to_string(), |v| v.to_string());
    AppError::InconsistentState {
        identity: identity.to_string(),
        detail: format!(
            "balance is {} but the newest transaction leaves {}",
            shown(balance),
            shown(newest)
        ),
    }
}

pub fn same_balance(held: Decimal, incoming: Decimal) -> bool {
    held == incoming
}

pub fn same_transactions(held: &[Transaction], incoming: &[Transaction]) -> bool {
    held.len() == incoming.len()
        && held
            .iter()
            .zip(incoming)
            .all(|(left, right)| left == right)
}

#[derive(Debug, Clone, Copy)]
enum BalanceSource {
    Pull,
    MutatingPull,
    Push,
}

#[derive(Debug, Default)]
struct AccountEntry {
    profile: Option<Identity>,
    balance: Option<Decimal>,
    balance_revision: Revision,
    transactions: Option<Vec<Transaction>>,
    transactions_revision: Revision,
    phase: SnapshotPhase,
    confirmation_deadline: Option<Instant>,
    inconsistent: bool,
}

impl AccountEntry {
    fn view(&self, identity: &str) -> AccountView {
        AccountView {
            identity: identity.to_string(),
            profile: self.profile.clone(),
            balance: self.balance,
            transactions: self.transactions.clone(),
            revision: self.balance_revision.max(self.transactions_revision),
            phase: self.phase,
            awaiting_confirmation: self.confirmation_deadline.is_some(),
            inconsistent: self.inconsistent,
        }
    }

    fn has_data(&self) -> bool {
        self.balance.is_some() || self.transactions.is_some()
    }

    fn apply_balance(
        &mut self,
        revision: Revision,
        balance: Decimal,
        source: BalanceSource,
        deadline: Instant,
    ) -> Result<bool, ApplyOutcome> {
        if self.balance.is_some() && revision <= self.balance_revision {
            return Err(ApplyOutcome::Stale {
                incoming: revision,
                held: self.balance_revision,
            });
        }

        let changed = self
            .balance
            .map_or(true, |held| !same_balance(held, balance));
        self.balance = Some(balance);
        self.balance_revision = revision;
        self.confirmation_deadline = match source {
            BalanceSource::MutatingPull => Some(deadline),
            BalanceSource::Pull | BalanceSource::Push => None,
        };
        Ok(changed)
    }

    fn apply_transactions(
        &mut self,
        revision: Revision,
        transactions: Vec<Transaction>,
    ) -> Result<bool, ApplyOutcome> {
        if self.transactions.is_some() && revision <= self.transactions_revision {
            return Err(ApplyOutcome::Stale {
                incoming: revision,
                held: self.transactions_revision,
            });
        }

        self.transactions_revision = revision;
        let unchanged = self
            .transactions
            .as_deref()
            .is_some_and(|held| same_transactions(held, &transactions));
        if unchanged {
            return Ok(false);
        }
        self.transactions = Some(transactions);
        Ok(true)
    }

    /// Marks the entry known and rechecks that the newest transaction agrees
    /// with the held balance. Returns true when either flag moved.
    fn settle(&mut self, identity: &str) -> bool {
        let prior_phase = self.phase;
        let prior_inconsistent = self.inconsistent;
        self.phase = SnapshotPhase::Known;

        self.inconsistent = match (self.balance, self.transactions.as_deref()) {
            (Some(balance), Some([.., last])) => last.resulting_balance != balance,
            _ => false,
        };
        if self.inconsistent && !prior_inconsistent {
            let newest = self
                .transactions
                .as_deref()
                .and_then(<[Transaction]>::last)
                .map(|transaction| transaction.resulting_balance);
            let error = inconsistent_state(identity, self.balance, newest);
            warn!(%error, "snapshot flagged inconsistent");
        }

        prior_phase != self.phase || prior_inconsistent != self.inconsistent
    }
}

type SnapshotCallback = Arc<dyn Fn(&AccountView) + Send + Sync>;
type StatsCallback = Arc<dyn Fn(&FleetStats) + Send + Sync>;

#[derive(Default)]
struct ObserverLists {
    next_id: u64,
    snapshot: Vec<(u64, String, SnapshotCallback)>,
    stats: Vec<(u64, StatsCallback)>,
}

impl ObserverLists {
    fn allocate(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        self.snapshot.retain(|(candidate, _, _)| *candidate != id);
        self.stats.retain(|(candidate, _)| *candidate != id);
    }
}

/// Removes its observer when dropped or explicitly unsubscribed.
#[must_use = "dropping the handle removes the observer"]
pub struct ObserverHandle {
    id: u64,
    observers: Weak<Mutex<ObserverLists>>,
}

impl ObserverHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.lock().remove(self.id);
        }
    }
}

#[derive(Default)]
struct MergerState {
    accounts: HashMap<String, AccountEntry>,
    stats: Option<Stamped<FleetStats>>,
}

enum Notification {
    Snapshot(AccountView),
    Stats(FleetStats),
}

/// Holds the only copy of reconciled state. Every apply is one
/// read-decide-write step under the lock; observers run after it is released.
#[derive(Clone)]
pub struct Merger {
    state: Arc<Mutex<MergerState>>,
    observers: Arc<Mutex<ObserverLists>>,
    confirmation_grace: Duration,
}

impl Merger {
    pub fn new(confirmation_grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MergerState::default())),
            observers: Arc::new(Mutex::new(ObserverLists::default())),
            confirmation_grace,
        }
    }

    pub fn apply_pull(&self, revision: Revision, update: PullUpdate) -> ApplyOutcome {
        let deadline = Instant::now() + self.confirmation_grace;
        let mut state = self.state.lock();
        let (outcome, notification) = match update {
            PullUpdate::Identified { identity, balance } => {
                let id = identity.id.clone();
                let entry = state.accounts.entry(id.clone()).or_default();
                let profile_changed = entry.profile.as_ref() != Some(&identity);
                entry.profile = Some(identity);
                match entry.apply_balance(revision, balance, BalanceSource::Pull, deadline) {
                    Ok(balance_changed) => {
                        finish_account(entry, &id, profile_changed || balance_changed)
                    }
                    Err(_) if profile_changed => finish_account(entry, &id, true),
                    Err(stale) => (stale, None),
                }
            }
            PullUpdate::Balance { identity, balance } => apply_account_balance(
                &mut state,
                &identity,
                revision,
                balance,
                BalanceSource::Pull,
                deadline,
            ),
            PullUpdate::MutatedBalance { identity, balance } => apply_account_balance(
                &mut state,
                &identity,
                revision,
                balance,
                BalanceSource::MutatingPull,
                deadline,
            ),
            PullUpdate::History {
                identity,
                transactions,
            } => apply_account_transactions(&mut state, &identity, revision, transactions),
            PullUpdate::Stats { stats } => apply_stats(&mut state, revision, stats),
        };
        drop(state);
        self.conclude(outcome, notification)
    }

    pub fn apply_push(&self, event: Stamped<PushEvent>) -> ApplyOutcome {
        let Stamped { revision, value } = event;
        let deadline = Instant::now() + self.confirmation_grace;
        let mut state = self.state.lock();
        let (outcome, notification) = match value {
            PushEvent::BalanceChanged { identity, balance } => apply_account_balance(
                &mut state,
                &identity,
                revision,
                balance,
                BalanceSource::Push,
                deadline,
            ),
            PushEvent::TransactionsChanged {
                identity,
                transactions,
            } => apply_account_transactions(&mut state, &identity, revision, transactions),
            PushEvent::StatsChanged { stats } => apply_stats(&mut state, revision, stats),
        };
        drop(state);
        self.conclude(outcome, notification)
    }

    pub fn begin_load(&self, identity: &str) {
        let notification = {
            let mut state = self.state.lock();
            let entry = state.accounts.entry(identity.to_string()).or_default();
            if entry.phase == SnapshotPhase::Unknown {
                entry.phase = SnapshotPhase::Loading;
                Some(Notification::Snapshot(entry.view(identity)))
            } else {
                None
            }
        };
        self.notify(notification);
    }

    /// A failed load leaves held data alone and only backs out of `Loading`.
    pub fn fail_load(&self, identity: &str) {
        let notification = {
            let mut state = self.state.lock();
            match state.accounts.get_mut(identity) {
                Some(entry) if entry.phase == SnapshotPhase::Loading => {
                    entry.phase = if entry.has_data() {
                        SnapshotPhase::Known
                    } else {
                        SnapshotPhase::Unknown
                    };
                    Some(Notification::Snapshot(entry.view(identity)))
                }
                _ => None,
            }
        };
        self.notify(notification);
    }

    /// Ends every grace window that has elapsed at `now`. Never notifies.
    pub fn expire_confirmations(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let mut expired = 0;
        for (identity, entry) in state.accounts.iter_mut() {
            if entry
                .confirmation_deadline
                .is_some_and(|deadline| deadline <= now)
            {
                entry.confirmation_deadline = None;
                expired += 1;
                debug!(
                    identity = %identity,
                    "no push confirmation inside grace window, keeping pull balance"
                );
            }
        }
        expired
    }

    pub fn mark_stale(&self) {
        let views: Vec<AccountView> = {
            let mut state = self.state.lock();
            state
                .accounts
                .iter_mut()
                .filter(|(_, entry)| entry.phase == SnapshotPhase::Known)
                .map(|(identity, entry)| {
                    entry.phase = SnapshotPhase::Stale;
                    entry.view(identity)
                })
                .collect()
        };
        for view in views {
            self.notify(Some(Notification::Snapshot(view)));
        }
    }

    pub fn forget(&self, identity: &str) -> bool {
        self.state.lock().accounts.remove(identity).is_some()
    }

    pub fn snapshot(&self, identity: &str) -> AccountView {
        let state = self.state.lock();
        match state.accounts.get(identity) {
            Some(entry) => entry.view(identity),
            None => AccountEntry::default().view(identity),
        }
    }

    pub fn stats(&self) -> Option<FleetStats> {
        self.state.lock().stats.as_ref().map(|stamped| stamped.value)
    }

    pub fn on_snapshot_changed<F>(&self, identity: &str, callback: F) -> ObserverHandle
    where
        F: Fn(&AccountView) + Send + Sync + 'static,
    {
        let mut observers = self.observers.lock();
        let id = observers.allocate();
        observers
            .snapshot
            .push((id, identity.to_string(), Arc::new(callback)));
        ObserverHandle {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn on_stats_changed<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&FleetStats) + Send + Sync + 'static,
    {
        let mut observers = self.observers.lock();
        let id = observers.allocate();
        observers.stats.push((id, Arc::new(callback)));
        ObserverHandle {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    fn conclude(
        &self,
        outcome: ApplyOutcome,
        notification: Option<Notification>,
    ) -> ApplyOutcome {
        if let ApplyOutcome::Stale { incoming, held } = &outcome {
            warn!(incoming = incoming.0, held = held.0, "discarded stale update");
        }
        self.notify(notification);
        outcome
    }

    fn notify(&self, notification: Option<Notification>) {
        match notification {
            Some(Notification::Snapshot(view)) => {
                let callbacks: Vec<SnapshotCallback> = self
                    .observers
                    .lock()
                    .snapshot
                    .iter()
                    .filter(|(_, identity, _)| *identity == view.identity)
                    .map(|(_, _, callback)| Arc::clone(callback))
                    .collect();
                for callback in callbacks {
                    callback(&view);
                }
            }
            Some(Notification::Stats(stats)) => {
                let callbacks: Vec<StatsCallback> = self
                    .observers
                    .lock()
                    .stats
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect();
                for callback in callbacks {
                    callback(&stats);
                }
            }
            None => {}
        }
    }
}

fn finish_account(
    entry: &mut AccountEntry,
    identity: &str,
    value_changed: bool,
) -> (ApplyOutcome, Option<Notification>) {
    let flags_changed = entry.settle(identity);
    if value_changed || flags_changed {
        (
            ApplyOutcome::Applied,
            Some(Notification::Snapshot(entry.view(identity))),
        )
    } else {
        (ApplyOutcome::Unchanged, None)
    }
}

fn apply_account_balance(
    state: &mut MergerState,
    identity: &str,
    revision: Revision,
    balance: Decimal,
    source: BalanceSource,
    deadline: Instant,
) -> (ApplyOutcome, Option<Notification>) {
    let entry = state.accounts.entry(identity.to_string()).or_default();
    match entry.apply_balance(revision, balance, source, deadline) {
        Ok(changed) => finish_account(entry, identity, changed),
        Err(stale) => (stale, None),
    }
}

fn apply_account_transactions(
    state: &mut MergerState,
    identity: &str,
    revision: Revision,
    transactions: Vec<Transaction>,
) -> (ApplyOutcome, Option<Notification>) {
    let entry = state.accounts.entry(identity.to_string()).or_default();
    match entry.apply_transactions(revision, transactions) {
        Ok(changed) => finish_account(entry, identity, changed),
        Err(stale) => (stale, None),
    }
}

fn apply_stats(
    state: &mut MergerState,
    revision: Revision,
    stats: FleetStats,
) -> (ApplyOutcome, Option<Notification>) {
    if let Some(held) = &state.stats {
        if revision <= held.revision {
            return (
                ApplyOutcome::Stale {
                    incoming: revision,
                    held: held.revision,
                },
                None,
            );
        }
    }
    state.stats = Some(Stamped {
        revision,
        value: stats,
    });
    (ApplyOutcome::Applied, Some(Notification::Stats(stats)))
}
