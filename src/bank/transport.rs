use crate::bank::registry::SubscriptionSink;
use crate::bank::types::{
    encode_outbound_frame, now_unix_ms, parse_push_payload, ClientConfig, ConnectionState,
    ConnectionStatus, OutboundFrame, PushEvent, RevisionClock, Stamped,
};
use crate::error::AppError;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type PushWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected {
        reason: String,
        gave_up: bool,
    },
    Data(Stamped<PushEvent>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.reconnect_delay_ms),
            max_attempts: config.reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `failed + 1`, or `None` once `failed`
    /// consecutive reconnect attempts have been spent.
    pub fn next_delay(&self, failed: u32) -> Option<Duration> {
        (failed < self.max_attempts).then_some(self.delay)
    }
}

/// Sending side of a running push channel. Frames offered while the channel
/// is not connected are dropped.
#[derive(Debug, Clone)]
pub struct PushChannel {
    status: watch::Receiver<ConnectionStatus>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl PushChannel {
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn send(&self, frame: OutboundFrame) -> bool {
        if !self.status.borrow().is_connected() {
            debug!(?frame, "push channel not connected, dropping outbound frame");
            return false;
        }
        self.outbound.send(frame).is_ok()
    }
}

impl SubscriptionSink for PushChannel {
    fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    fn issue(&self, identity: &str) -> bool {
        self.send(OutboundFrame::SubscribeBalance {
            cedula: identity.to_string(),
        })
    }
}

pub struct PushChannelTask {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

impl PushChannelTask {
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        if let Err(error) = self.join_handle.await {
            warn!(%error, "push channel task ended abnormally");
        }
    }
}

/// Spawns the connection task. Its lifecycle and data events go to `events`,
/// which outlives any single task so a restart keeps the same consumer.
pub fn spawn_push_channel(
    config: &ClientConfig,
    clock: RevisionClock,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> (PushChannel, PushChannelTask) {
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::idle(Some(
        "push channel starting".to_string(),
    )));
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let cancellation_token = CancellationToken::new();

    let runtime = PushRuntime {
        url: config.push_url.clone(),
        policy: ReconnectPolicy::from_config(config),
        clock,
        events,
        status: status_tx,
        outbound: outbound_rx,
        cancel_token: cancellation_token.clone(),
    };
    let join_handle = tokio::spawn(runtime.run());

    (
        PushChannel {
            status: status_rx,
            outbound: outbound_tx,
        },
        PushChannelTask {
            cancellation_token,
            join_handle,
        },
    )
}

pub async fn connect_push_stream(url: &str) -> Result<PushWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

enum SessionEnd {
    Cancelled,
    Lost(AppError),
}

fn closed_by_server() -> AppError {
    AppError::PushChannel("connection closed by server".to_string())
}

struct PushRuntime {
    url: String,
    policy: ReconnectPolicy,
    clock: RevisionClock,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: watch::Sender<ConnectionStatus>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    cancel_token: CancellationToken,
}

impl PushRuntime {
    async fn run(mut self) {
        // Reconnect attempts since the last successful connection; 0 is the
        // initial connect.
        let mut attempt = 0_u32;
        while !self.cancel_token.is_cancelled() {
            let reason = if attempt == 0 {
                "opening push channel".to_string()
            } else {
                format!("reconnect attempt {attempt}")
            };
            self.publish_status(ConnectionState::Connecting, attempt, false, Some(reason));

            let connected = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                result = connect_push_stream(&self.url) => result,
            };

            let loss = match connected {
                Ok(stream) => {
                    attempt = 0;
                    while self.outbound.try_recv().is_ok() {}
                    self.publish_status(
                        ConnectionState::Connected,
                        0,
                        false,
                        Some("push channel connected".to_string()),
                    );
                    info!(url = %self.url, "push channel connected");
                    self.emit(TransportEvent::Connected);

                    match self.run_session(stream).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(error) => error.to_string(),
                    }
                }
                Err(error) => format!("connect failed: {error}"),
            };

            let Some(delay) = self.policy.next_delay(attempt) else {
                warn!(attempts = attempt, %loss, "push channel giving up after reconnect attempts");
                self.publish_status(ConnectionState::Disconnected, attempt, true, Some(loss.clone()));
                self.emit(TransportEvent::Disconnected {
                    reason: loss,
                    gave_up: true,
                });
                return;
            };

            warn!(attempt, %loss, "push channel lost");
            self.publish_status(ConnectionState::Disconnected, attempt, false, Some(loss.clone()));
            self.emit(TransportEvent::Disconnected {
                reason: loss,
                gave_up: false,
            });

            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.publish_status(
            ConnectionState::Disconnected,
            0,
            false,
            Some("push channel stopped".to_string()),
        );
        info!("push channel stopped");
    }

    async fn run_session(&mut self, mut stream: PushWsStream) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    if let Err(error) = stream.close(None).await {
                        debug!(%error, "push channel close handshake failed");
                    }
                    return SessionEnd::Cancelled;
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Cancelled;
                    };
                    let encoded = match encode_outbound_frame(&frame) {
                        Ok(encoded) => encoded,
                        Err(error) => {
                            warn!(%error, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if let Err(error) = stream.send(Message::Text(encoded)).await {
                        return SessionEnd::Lost(error.into());
                    }
                }
                next_message = stream.next() => {
                    let Some(message) = next_message else {
                        return SessionEnd::Lost(closed_by_server());
                    };
                    match message {
                        Ok(Message::Text(text)) => self.handle_payload(text.into_bytes()),
                        Ok(Message::Binary(payload)) => self.handle_payload(payload),
                        Ok(Message::Ping(payload)) => {
                            if let Err(error) = stream.send(Message::Pong(payload)).await {
                                return SessionEnd::Lost(error.into());
                            }
                        }
                        Ok(Message::Close(_)) => {
                            return SessionEnd::Lost(closed_by_server());
                        }
                        Ok(_) => {}
                        Err(error) => {
                            return SessionEnd::Lost(error.into());
                        }
                    }
                }
            }
        }
    }

    fn handle_payload(&self, mut payload: Vec<u8>) {
        let revision = self.clock.stamp();
        match parse_push_payload(payload.as_mut_slice()) {
            Ok(Some(event)) => {
                debug!(event = event.event_name(), revision = revision.0, "push event received");
                self.emit(TransportEvent::Data(Stamped {
                    revision,
                    value: event,
                }));
            }
            Ok(None) => debug!("push channel greeting received"),
            Err(error) => warn!(%error, "dropping malformed push payload"),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("push event consumer is gone");
        }
    }

    fn publish_status(
        &self,
        state: ConnectionState,
        attempt: u32,
        gave_up: bool,
        reason: Option<String>,
    ) {
        self.status.send_replace(ConnectionStatus {
            state,
            since_unix_ms: now_unix_ms(),
            attempt,
            gave_up,
            reason,
        });
    }
}
