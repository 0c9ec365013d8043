use crate::bank::dispatcher::{Operation, Reply};
use crate::bank::types::{FleetStats, SimulationBatch};
use crate::error::AppError;
use crate::state::AppState;

fn require_privileged(state: &AppState, identity: &str) -> Result<(), AppError> {
    if state.config.is_privileged(identity.trim()) {
        Ok(())
    } else {
        Err(AppError::Validation(
            "this operation requires a privileged identity".to_string(),
        ))
    }
}

pub async fn fetch_stats(state: &AppState, requested_by: &str) -> Result<FleetStats, AppError> {
    require_privileged(state, requested_by)?;
    let reply = state.dispatcher.dispatch(Operation::FetchStats).await?;
    state.apply_reply(&reply);
    match reply {
        Reply::Stats { stats } => Ok(stats),
        _ => Err(AppError::Decode(
            "fetch_stats returned an unexpected reply".to_string(),
        )),
    }
}

/// Simulation batches are one-shot and never enter the merger.
pub async fn run_simulation(
    state: &AppState,
    requested_by: &str,
) -> Result<SimulationBatch, AppError> {
    require_privileged(state, requested_by)?;
    match state.dispatcher.dispatch(Operation::RunSimulation).await? {
        Reply::Simulation { batch } => Ok(batch),
        _ => Err(AppError::Decode(
            "run_simulation returned an unexpected reply".to_string(),
        )),
    }
}
