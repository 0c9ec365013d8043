use crate::bank::api::fetch_bridge_health;
use crate::bank::types::{BridgeHealthWire, ConnectionStatus};
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub bridge: &'static str,
    pub bridge_detail: Option<BridgeHealthWire>,
    pub push: ConnectionStatus,
}

pub fn build_health_response(
    started_at: Instant,
    bridge: Option<BridgeHealthWire>,
    push: ConnectionStatus,
) -> HealthResponse {
    let bridge_status = match &bridge {
        Some(detail) if detail.status == "ok" => "ok",
        Some(_) => "degraded",
        None => "error",
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        bridge: bridge_status,
        bridge_detail: bridge,
        push,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let bridge = fetch_bridge_health(
        state.dispatcher.client(),
        state.dispatcher.api_base_url(),
        state.dispatcher.timeout(),
    )
    .await
    .ok();
    build_health_response(state.started_at, bridge, state.push_channel.status())
}
