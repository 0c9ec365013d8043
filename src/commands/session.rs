use crate::bank::dispatcher::{validate_identity, Operation};
use crate::bank::merger::AccountView;
use crate::bank::registry::SubscribeOutcome;
use crate::error::AppError;
use crate::state::AppState;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub view: AccountView,
    pub subscription: &'static str,
}

fn subscription_label(outcome: SubscribeOutcome) -> &'static str {
    match outcome {
        SubscribeOutcome::Issued => "issued",
        SubscribeOutcome::AlreadyIssued => "already_issued",
        SubscribeOutcome::Queued => "queued",
    }
}

/// Identify, establish the snapshot, follow the identity on the push channel,
/// then load its history. A history failure does not undo the login.
pub async fn login(state: &AppState, identity: &str) -> Result<LoginResult, AppError> {
    let identity = validate_identity(identity, "identity")?;
    state.merger.begin_load(&identity);

    let reply = match state
        .dispatcher
        .dispatch(Operation::Identify {
            identity: identity.clone(),
        })
        .await
    {
        Ok(reply) => reply,
        Err(error) => {
            state.merger.fail_load(&identity);
            return Err(error);
        }
    };
    state.apply_reply(&reply);

    let subscription = subscription_label(state.subscribe(&identity));

    match state
        .dispatcher
        .dispatch(Operation::FetchHistory {
            identity: identity.clone(),
        })
        .await
    {
        Ok(history) => {
            state.apply_reply(&history);
        }
        Err(error) => warn!(identity = %identity, %error, "history load failed after login"),
    }

    info!(identity = %identity, subscription, "session logged in");
    Ok(LoginResult {
        view: state.merger.snapshot(&identity),
        subscription,
    })
}

pub fn logout(state: &AppState, identity: &str) -> bool {
    let identity = identity.trim();
    let was_subscribed = state.registry.unsubscribe(identity);
    let had_snapshot = state.merger.forget(identity);
    info!(identity, "session logged out");
    was_subscribed || had_snapshot
}

pub fn subscribe(state: &AppState, identity: &str) -> Result<&'static str, AppError> {
    let identity = validate_identity(identity, "identity")?;
    Ok(subscription_label(state.subscribe(&identity)))
}

pub fn snapshot(state: &AppState, identity: &str) -> AccountView {
    state.merger.snapshot(identity.trim())
}
