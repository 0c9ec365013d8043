use crate::error::AppError;
use crate::bank::types::{BridgeHealthWire, ReplyWire};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub const IDENTIFY_PATH: &str = "/consulta";
pub const DEPOSIT_PATH: &str = "/deposito";
pub const WITHDRAW_PATH: &str = "/retiro";
pub const TRANSFER_PATH: &str = "/transferir";
pub const CREATE_ACCOUNT_PATH: &str = "/cliente";
pub const HISTORY_PATH: &str = "/historial";
pub const STATS_PATH: &str = "/stats";
pub const SIMULATE_PATH: &str = "/simulate";
const HEALTH_PATH: &str = "/health";
const API_PREFIX: &str = "/api";

pub fn endpoint(api_base_url: &str, path: &str) -> String {
    format!("{}{path}", api_base_url.trim_end_matches('/'))
}

/// The identity travels as one percent-encoded path segment.
pub fn history_endpoint(api_base_url: &str, identity: &str) -> Result<String, AppError> {
    let mut url = Url::parse(&endpoint(api_base_url, HISTORY_PATH))
        .map_err(|error| AppError::Validation(format!("invalid api base url: {error}")))?;
    url.path_segments_mut()
        .map_err(|()| AppError::Validation("api base url cannot carry a path".to_string()))?
        .push(identity);
    Ok(url.to_string())
}

/// The bridge serves `/health` at its origin, outside the `/api` prefix.
pub fn health_endpoint(api_base_url: &str) -> String {
    let trimmed = api_base_url.trim_end_matches('/');
    let origin = trimmed.strip_suffix(API_PREFIX).unwrap_or(trimmed);
    format!("{origin}{HEALTH_PATH}")
}

fn with_timeout(request: RequestBuilder, timeout: Option<Duration>) -> RequestBuilder {
    match timeout {
        Some(value) => request.timeout(value),
        None => request,
    }
}

async fn decode_reply<T: DeserializeOwned>(response: Response) -> Result<ReplyWire<T>, AppError> {
    let status = response.status();
    match response.json::<ReplyWire<T>>().await {
        Ok(reply) => Ok(reply),
        Err(error) if !status.is_success() => Err(AppError::Transport(format!(
            "bridge answered HTTP {status} with an unreadable body: {error}"
        ))),
        Err(error) => Err(error.into()),
    }
}

pub async fn post_json<B, T>(
    client: &Client,
    url: &str,
    body: Option<&B>,
    timeout: Option<Duration>,
) -> Result<ReplyWire<T>, AppError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let mut request = with_timeout(client.post(url), timeout);
    if let Some(payload) = body {
        request = request.json(payload);
    }
    let response = request.send().await?;
    decode_reply(response).await
}

pub async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    timeout: Option<Duration>,
) -> Result<ReplyWire<T>, AppError> {
    let response = with_timeout(client.get(url), timeout).send().await?;
    decode_reply(response).await
}

pub async fn fetch_bridge_health(
    client: &Client,
    api_base_url: &str,
    timeout: Option<Duration>,
) -> Result<BridgeHealthWire, AppError> {
    let url = health_endpoint(api_base_url);
    let response = with_timeout(client.get(url), timeout)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json::<BridgeHealthWire>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_and_path() {
        assert_eq!(
            endpoint("http://localhost:5001/api/", DEPOSIT_PATH),
            "http://localhost:5001/api/deposito"
        );
    }

    #[test]
    fn history_endpoint_embeds_identity() {
        let url = history_endpoint("http://localhost:5001/api", "0000000001")
            .expect("base url should parse");
        assert_eq!(url, "http://localhost:5001/api/historial/0000000001");
    }

    #[test]
    fn history_endpoint_encodes_reserved_characters() {
        let url = history_endpoint("http://localhost:5001/api/", "00/../stats?x#y")
            .expect("base url should parse");
        assert_eq!(
            url,
            "http://localhost:5001/api/historial/00%2F..%2Fstats%3Fx%23y"
        );
    }

    #[test]
    fn health_endpoint_lives_at_origin() {
        assert_eq!(
            health_endpoint("http://localhost:5001/api"),
            "http://localhost:5001/health"
        );
        assert_eq!(
            health_endpoint("https://bank.example/"),
            "https://bank.example/health"
        );
    }
}
