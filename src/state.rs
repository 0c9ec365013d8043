use crate::bank::dispatcher::{Dispatcher, Reply};
use crate::bank::merger::{ApplyOutcome, Merger, PullUpdate};
use crate::bank::registry::{Registry, SubscribeOutcome, SubscriptionSink};
use crate::bank::transport::{spawn_push_channel, PushChannel, PushChannelTask, TransportEvent};
use crate::bank::types::{ClientConfig, ConnectionStatus, RevisionClock};
use crate::error::AppError;
use parking_lot::RwLock;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_EXPIRY_TICK_MS: u64 = 25;

/// The push channel currently owned by the session, if any. Subscriptions
/// offered while it is absent are treated as disconnected.
#[derive(Debug, Clone, Default)]
pub struct CurrentPushChannel {
    slot: Arc<RwLock<Option<PushChannel>>>,
}

impl CurrentPushChannel {
    pub fn replace(&self, channel: Option<PushChannel>) {
        *self.slot.write() = channel;
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.slot.read().as_ref() {
            Some(channel) => channel.status(),
            None => ConnectionStatus::idle(Some("push channel idle".to_string())),
        }
    }
}

impl SubscriptionSink for CurrentPushChannel {
    fn is_connected(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(|channel| channel.is_connected())
    }

    fn issue(&self, identity: &str) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(|channel| channel.issue(identity))
    }
}

struct BackgroundTasks {
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Service object owned by the top-level application. Construct it with
/// [`AppState::init`] inside a Tokio runtime and release it with
/// [`AppState::shutdown`].
pub struct AppState {
    pub started_at: Instant,
    pub config: ClientConfig,
    pub clock: RevisionClock,
    pub dispatcher: Dispatcher,
    pub registry: Arc<Registry>,
    pub merger: Merger,
    pub push_channel: CurrentPushChannel,
    push_task: Mutex<Option<PushChannelTask>>,
    push_events: mpsc::UnboundedSender<TransportEvent>,
    background: Mutex<Option<BackgroundTasks>>,
}

impl AppState {
    pub async fn init(config: ClientConfig) -> Result<Self, AppError> {
        let http_client = Client::builder().build()?;
        let clock = RevisionClock::new();
        let registry = Arc::new(Registry::new());
        let merger = Merger::new(Duration::from_millis(config.confirmation_grace_ms));
        let push_channel = CurrentPushChannel::default();
        let (push_events, events_rx) = mpsc::unbounded_channel();

        let cancellation_token = CancellationToken::new();
        let pump = tokio::spawn(run_event_pump(
            events_rx,
            Arc::clone(&registry),
            merger.clone(),
            push_channel.clone(),
            cancellation_token.clone(),
        ));
        let ticker = tokio::spawn(run_confirmation_ticker(
            merger.clone(),
            expiry_tick(config.confirmation_grace_ms),
            cancellation_token.clone(),
        ));

        info!(
            api = %config.api_base_url,
            push = %config.push_url,
            "bank client state initialized"
        );

        Ok(Self {
            started_at: Instant::now(),
            dispatcher: Dispatcher::new(http_client, &config),
            config,
            clock,
            registry,
            merger,
            push_channel,
            push_task: Mutex::new(None),
            push_events,
            background: Mutex::new(Some(BackgroundTasks {
                cancellation_token,
                handles: vec![pump, ticker],
            })),
        })
    }

    /// Stamps a successful pull reply and hands it to the merger.
    pub fn apply_reply(&self, reply: &Reply) -> Vec<ApplyOutcome> {
        let revision = self.clock.stamp();
        PullUpdate::from_reply(reply)
            .into_iter()
            .map(|update| self.merger.apply_pull(revision, update))
            .collect()
    }

    pub fn subscribe(&self, identity: &str) -> SubscribeOutcome {
        self.registry.subscribe(identity, &self.push_channel)
    }

    /// Replaces any running push channel with a fresh one. Subscriptions made
    /// on the old connection are reissued once the new one is up.
    pub async fn start_push_channel(&self) -> ConnectionStatus {
        let mut slot = self.push_task.lock().await;
        if let Some(existing) = slot.take() {
            self.push_channel.replace(None);
            existing.stop().await;
            self.connection_lost();
        }

        let (channel, task) =
            spawn_push_channel(&self.config, self.clock.clone(), self.push_events.clone());
        let status = channel.status();
        self.push_channel.replace(Some(channel));
        *slot = Some(task);
        status
    }

    pub async fn stop_push_channel(&self) -> bool {
        let existing = self.push_task.lock().await.take();
        self.push_channel.replace(None);
        match existing {
            Some(task) => {
                task.stop().await;
                self.connection_lost();
                true
            }
            None => {
                self.registry.on_disconnected();
                false
            }
        }
    }

    fn connection_lost(&self) {
        self.registry.on_disconnected();
        self.merger.mark_stale();
    }

    pub async fn shutdown(&self) {
        self.stop_push_channel().await;
        let background = self.background.lock().await.take();
        if let Some(tasks) = background {
            tasks.cancellation_token.cancel();
            for handle in tasks.handles {
                if let Err(error) = handle.await {
                    warn!(%error, "background task ended abnormally");
                }
            }
        }
        info!("bank client state shut down");
    }
}

fn expiry_tick(confirmation_grace_ms: u64) -> Duration {
    Duration::from_millis((confirmation_grace_ms / 4).max(MIN_EXPIRY_TICK_MS))
}

pub fn handle_transport_event(
    event: TransportEvent,
    registry: &Registry,
    merger: &Merger,
    sink: &dyn SubscriptionSink,
) -> Option<ApplyOutcome> {
    match event {
        TransportEvent::Connected => {
            let reissued = registry.on_connected(sink);
            info!(reissued, "push channel ready");
            None
        }
        TransportEvent::Disconnected { reason, gave_up } => {
            registry.on_disconnected();
            merger.mark_stale();
            if gave_up {
                warn!(%reason, "push channel disconnected permanently");
            } else {
                debug!(%reason, "push channel disconnected");
            }
            None
        }
        TransportEvent::Data(event) => Some(registry.deliver(merger, event)),
    }
}

async fn run_event_pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    registry: Arc<Registry>,
    merger: Merger,
    sink: CurrentPushChannel,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next_event = events.recv() => next_event,
        };
        let Some(event) = event else {
            break;
        };
        handle_transport_event(event, &registry, &merger, &sink);
    }
}

async fn run_confirmation_ticker(merger: Merger, period: Duration, cancel_token: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = interval.tick() => {
                merger.expire_confirmations(Instant::now());
            }
        }
    }
}
