use crate::bank::merger::{ApplyOutcome, Merger};
use crate::bank::types::{PushEvent, Stamped};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Where subscription requests go. The push channel handle implements this;
/// tests substitute a recorder.
pub trait SubscriptionSink {
    fn is_connected(&self) -> bool;
    /// Returns false when the request could not be handed to a live connection.
    fn issue(&self, identity: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Issued,
    AlreadyIssued,
    Queued,
}

#[derive(Debug, Default)]
struct RegistryState {
    interested: BTreeSet<String>,
    issued: HashSet<String>,
}

/// Identities the session wants push updates for, plus which of them have
/// been issued on the current connection.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, identity: &str, sink: &dyn SubscriptionSink) -> SubscribeOutcome {
        let mut state = self.state.lock();
        state.interested.insert(identity.to_string());
        if state.issued.contains(identity) {
            return SubscribeOutcome::AlreadyIssued;
        }
        if sink.is_connected() && sink.issue(identity) {
            state.issued.insert(identity.to_string());
            debug!(identity, "subscription issued");
            return SubscribeOutcome::Issued;
        }
        debug!(identity, "subscription queued until the push channel connects");
        SubscribeOutcome::Queued
    }

    /// Local only; the server keeps pushing and delivery filters it out.
    pub fn unsubscribe(&self, identity: &str) -> bool {
        let mut state = self.state.lock();
        state.issued.remove(identity);
        state.interested.remove(identity)
    }

    /// Issues every recorded identity once on a fresh connection. Identities
    /// already sent on this connection are skipped.
    pub fn on_connected(&self, sink: &dyn SubscriptionSink) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<String> = state
            .interested
            .iter()
            .filter(|identity| !state.issued.contains(*identity))
            .cloned()
            .collect();
        for identity in pending {
            if sink.issue(&identity) {
                state.issued.insert(identity);
            }
        }
        debug!(count = state.issued.len(), "subscriptions reissued after connect");
        state.issued.len()
    }

    /// Subscriptions die with the connection.
    pub fn on_disconnected(&self) {
        self.state.lock().issued.clear();
    }

    pub fn is_subscribed(&self, identity: &str) -> bool {
        self.state.lock().interested.contains(identity)
    }

    /// Hands a push event to the merger unless it belongs to an identity the
    /// session no longer follows. Fleet stats are never filtered.
    pub fn deliver(&self, merger: &Merger, event: Stamped<PushEvent>) -> ApplyOutcome {
        if let Some(identity) = event.value.identity() {
            if !self.is_subscribed(identity) {
                debug!(
                    identity,
                    event = event.value.event_name(),
                    "dropping push for unsubscribed identity"
                );
                return ApplyOutcome::Filtered;
            }
        }
        merger.apply_push(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::types::{FleetStats, RevisionClock};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        connected: AtomicBool,
        issued: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn issued(&self) -> Vec<String> {
            self.issued.lock().clone()
        }
    }

    impl SubscriptionSink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn issue(&self, identity: &str) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.issued.lock().push(identity.to_string());
            true
        }
    }

    #[test]
    fn repeated_subscribe_before_connect_issues_once() {
        let registry = Registry::new();
        let sink = RecordingSink::default();

        for _ in 0..4 {
            assert_eq!(registry.subscribe("0000000001", &sink), SubscribeOutcome::Queued);
        }
        sink.set_connected(true);
        registry.on_connected(&sink);

        assert_eq!(sink.issued(), vec!["0000000001".to_string()]);
    }

    #[test]
    fn subscribe_while_connected_is_immediate_and_idempotent() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        sink.set_connected(true);

        assert_eq!(registry.subscribe("0000000001", &sink), SubscribeOutcome::Issued);
        assert_eq!(
            registry.subscribe("0000000001", &sink),
            SubscribeOutcome::AlreadyIssued
        );
        assert_eq!(sink.issued().len(), 1);
    }

    #[test]
    fn every_reconnect_reissues_all_identities() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        sink.set_connected(true);
        registry.subscribe("0000000001", &sink);
        registry.subscribe("0000000002", &sink);

        sink.set_connected(false);
        registry.on_disconnected();
        sink.set_connected(true);
        assert_eq!(registry.on_connected(&sink), 2);

        assert_eq!(sink.issued().len(), 4);
    }

    #[test]
    fn subscription_issued_just_before_connect_event_is_not_repeated() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        sink.set_connected(true);

        registry.subscribe("0000000001", &sink);
        assert_eq!(registry.on_connected(&sink), 1);

        assert_eq!(sink.issued(), vec!["0000000001".to_string()]);
    }

    #[test]
    fn unsubscribed_identity_is_filtered_at_delivery() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        let merger = Merger::new(Duration::from_millis(3_000));
        let clock = RevisionClock::new();
        registry.subscribe("0000000001", &sink);
        assert!(registry.unsubscribe("0000000001"));

        let outcome = registry.deliver(
            &merger,
            clock.stamp_value(PushEvent::BalanceChanged {
                identity: "0000000001".to_string(),
                balance: dec!(10.00),
            }),
        );
        assert_eq!(outcome, ApplyOutcome::Filtered);
        assert_eq!(merger.snapshot("0000000001").balance, None);

        let stats = registry.deliver(
            &merger,
            clock.stamp_value(PushEvent::StatsChanged {
                stats: FleetStats::default(),
            }),
        );
        assert_eq!(stats, ApplyOutcome::Applied);
    }
}
