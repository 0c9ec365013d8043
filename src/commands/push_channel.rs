use crate::bank::types::ConnectionStatus;
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChannelStopResult {
    pub stopped: bool,
}

pub async fn start_push_channel(state: &AppState) -> ConnectionStatus {
    state.start_push_channel().await
}

pub async fn stop_push_channel(state: &AppState) -> PushChannelStopResult {
    PushChannelStopResult {
        stopped: state.stop_push_channel().await,
    }
}

pub fn push_channel_status(state: &AppState) -> ConnectionStatus {
    state.push_channel.status()
}
