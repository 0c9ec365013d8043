pub mod bank;
pub mod commands;
pub mod error;
pub mod state;

pub use bank::dispatcher::{Dispatcher, Operation, Reply};
pub use bank::merger::{AccountView, ApplyOutcome, Merger, ObserverHandle, PullUpdate, SnapshotPhase};
pub use bank::registry::{Registry, SubscribeOutcome, SubscriptionSink};
pub use bank::types::{ClientArgs, ClientConfig, ConnectionState, ConnectionStatus};
pub use error::{AppError, ErrorKind, ErrorReport};
pub use state::AppState;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "bank_client_lib=info,bank_client=info";

/// Installs the fmt subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
