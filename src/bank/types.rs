use crate::bank::{BALANCE_UPDATED_EVENT, STATS_UPDATED_EVENT, TRANSACTIONS_UPDATED_EVENT};
use crate::error::AppError;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5001/api";
pub const DEFAULT_PUSH_URL: &str = "ws://localhost:5001/ws";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONFIRMATION_GRACE_MS: u64 = 3_000;
pub const DEFAULT_PRIVILEGED_IDENTITY: &str = "1350509525";
pub const DEFAULT_ACCOUNT_ID_PREFIX: char = '0';
pub const MIN_RECONNECT_DELAY_MS: u64 = 10;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const MIN_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 100;
pub const MIN_CONFIRMATION_GRACE_MS: u64 = 100;
pub const MAX_CONFIRMATION_GRACE_MS: u64 = 60_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;
pub const MONEY_SCALE: u32 = 2;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Local arrival-order marker. Pull replies and push events draw from the
/// same clock, so the larger revision is always the later arrival.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

#[derive(Debug, Clone, Default)]
pub struct RevisionClock {
    next: Arc<AtomicU64>,
}

impl RevisionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self) -> Revision {
        Revision(self.next.fetch_add(1, Ordering::Relaxed).saturating_add(1))
    }

    pub fn stamp_value<T>(&self, value: T) -> Stamped<T> {
        Stamped {
            revision: self.stamp(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub revision: Revision,
    pub value: T,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub given_names: String,
    pub family_names: String,
    pub privileged: bool,
}

impl Identity {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.given_names, self.family_names)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_lowercase().as_str() {
            "deposito" | "depósito" | "deposit" | "aumentar" => Ok(Self::Deposit),
            "retiro" | "withdrawal" | "withdraw" | "disminuir" => Ok(Self::Withdrawal),
            other => Err(AppError::Decode(format!(
                "unknown transaction kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub timestamp: NaiveDateTime,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub resulting_balance: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub active_clients: u32,
    pub concurrent_ops: u32,
    pub active_connections: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub since_unix_ms: i64,
    pub attempt: u32,
    pub gave_up: bool,
    pub reason: Option<String>,
}

impl ConnectionStatus {
    pub fn idle(reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            since_unix_ms: now_unix_ms(),
            attempt: 0,
            gave_up: false,
            reason,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub total: u32,
    pub deposits: u32,
    pub withdrawals: u32,
    pub errors: u32,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedOperation {
    pub thread: String,
    pub identity: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub duration_ms: f64,
    pub timestamp: String,
    pub status: String,
    pub message: Option<String>,
    pub resulting_balance: Option<Decimal>,
}

impl SimulatedOperation {
    pub fn is_error(&self) -> bool {
        !matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "ok" | "success" | "exito" | "éxito"
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SimulationBatch {
    pub summary: SimulationSummary,
    pub recent_operations: Vec<SimulatedOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientArgs {
    pub api_base_url: Option<String>,
    pub push_url: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub confirmation_grace_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub privileged_identities: Option<Vec<String>>,
    pub account_id_prefix: Option<char>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub push_url: String,
    pub reconnect_delay_ms: u64,
    pub reconnect_attempts: u32,
    pub confirmation_grace_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub privileged_identities: Vec<String>,
    pub account_id_prefix: char,
}

impl ClientArgs {
    pub fn normalize(self) -> Result<ClientConfig, AppError> {
        let api_base_url = self
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(AppError::Validation(
                "apiBaseUrl must be an http:// or https:// URL".to_string(),
            ));
        }

        let push_url = self
            .push_url
            .unwrap_or_else(|| DEFAULT_PUSH_URL.to_string())
            .trim()
            .to_string();
        if !(push_url.starts_with("ws://") || push_url.starts_with("wss://")) {
            return Err(AppError::Validation(
                "pushUrl must be a ws:// or wss:// URL".to_string(),
            ));
        }

        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::Validation(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let reconnect_attempts = self
            .reconnect_attempts
            .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS);
        if !(MIN_RECONNECT_ATTEMPTS..=MAX_RECONNECT_ATTEMPTS).contains(&reconnect_attempts) {
            return Err(AppError::Validation(format!(
                "reconnectAttempts must be between {MIN_RECONNECT_ATTEMPTS} and {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let confirmation_grace_ms = self
            .confirmation_grace_ms
            .unwrap_or(DEFAULT_CONFIRMATION_GRACE_MS);
        if !(MIN_CONFIRMATION_GRACE_MS..=MAX_CONFIRMATION_GRACE_MS)
            .contains(&confirmation_grace_ms)
        {
            return Err(AppError::Validation(format!(
                "confirmationGraceMs must be between {MIN_CONFIRMATION_GRACE_MS} and {MAX_CONFIRMATION_GRACE_MS}"
            )));
        }

        if let Some(timeout_ms) = self.request_timeout_ms {
            if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&timeout_ms) {
                return Err(AppError::Validation(format!(
                    "requestTimeoutMs must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
                )));
            }
        }

        let privileged_identities: Vec<String> = self
            .privileged_identities
            .unwrap_or_else(|| vec![DEFAULT_PRIVILEGED_IDENTITY.to_string()])
            .into_iter()
            .map(|identity| identity.trim().to_string())
            .filter(|identity| !identity.is_empty())
            .collect();

        let account_id_prefix = self.account_id_prefix.unwrap_or(DEFAULT_ACCOUNT_ID_PREFIX);
        if !account_id_prefix.is_ascii_digit() {
            return Err(AppError::Validation(
                "accountIdPrefix must be a single ASCII digit".to_string(),
            ));
        }

        Ok(ClientConfig {
            api_base_url,
            push_url,
            reconnect_delay_ms,
            reconnect_attempts,
            confirmation_grace_ms,
            request_timeout_ms: self.request_timeout_ms,
            privileged_identities,
            account_id_prefix,
        })
    }
}

impl ClientConfig {
    pub fn is_privileged(&self, identity: &str) -> bool {
        self.privileged_identities
            .iter()
            .any(|candidate| candidate == identity)
    }
}

pub fn normalize_money(value: Decimal) -> Decimal {
    value.round_dp(MONEY_SCALE)
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, AppError> {
    let trimmed = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| AppError::Decode(format!("unrecognized timestamp '{trimmed}'")))
}

pub fn now_unix_ms() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

// ---- pull channel wire ----

#[derive(Debug, Deserialize)]
pub struct ReplyWire<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub message: Option<String>,
    pub detalles: Option<String>,
    pub estadisticas: Option<FleetStatsWire>,
}

impl<T> ReplyWire<T> {
    /// A `success:false` reply becomes `Rejected` carrying the server text.
    pub fn into_data(self) -> Result<Option<T>, AppError> {
        if !self.success {
            return Err(AppError::Rejected {
                message: self
                    .error
                    .or(self.message)
                    .unwrap_or_else(|| "operation rejected by server".to_string()),
                details: self.detalles,
            });
        }
        Ok(self.data)
    }

    pub fn into_required_data(self, operation: &str) -> Result<T, AppError> {
        self.into_data()?.ok_or_else(|| {
            AppError::Decode(format!("{operation} reply is missing its data payload"))
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientInfoWire {
    pub nombres: String,
    pub apellidos: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub saldo: Decimal,
}

/// Account creation echoes the submitted names and an opening balance. Every
/// field is optional; only `success` decides the outcome.
#[derive(Debug, Deserialize, Default)]
pub struct CreatedAccountWire {
    #[serde(default)]
    pub mensaje: Option<String>,
    #[serde(default)]
    pub nombres: Option<String>,
    #[serde(default)]
    pub apellidos: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub saldo_inicial: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct MutationWire {
    #[serde(with = "rust_decimal::serde::float")]
    pub nuevo_saldo: Decimal,
    pub mensaje: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TransferWire {
    pub mensaje: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub saldo_origen: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub saldo_destino: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryWire {
    #[serde(default)]
    pub transacciones: Vec<TransactionWire>,
}

#[derive(Debug, Deserialize)]
pub struct StatsDataWire {
    pub estadisticas: Option<FleetStatsWire>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionWire {
    pub fecha: String,
    pub tipo: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub monto: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub saldo_final: Decimal,
}

impl TryFrom<TransactionWire> for Transaction {
    type Error = AppError;

    fn try_from(value: TransactionWire) -> Result<Self, Self::Error> {
        let amount = normalize_money(value.monto);
        let resulting_balance = normalize_money(value.saldo_final);
        if amount <= Decimal::ZERO || resulting_balance < Decimal::ZERO {
            return Err(AppError::Decode(
                "transaction amount must be positive and resulting balance non-negative"
                    .to_string(),
            ));
        }

        Ok(Self {
            timestamp: parse_timestamp(&value.fecha)?,
            kind: TransactionKind::parse_str(&value.tipo)?,
            amount,
            resulting_balance,
        })
    }
}

/// Translates a server list (newest first) into the canonical oldest-first
/// order. The stable sort only moves entries whose timestamps disagree with
/// the reversed server order.
pub fn canonical_transactions(wire: Vec<TransactionWire>) -> Result<Vec<Transaction>, AppError> {
    let mut transactions = wire
        .into_iter()
        .rev()
        .map(Transaction::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    transactions.sort_by_key(|transaction| transaction.timestamp);
    Ok(transactions)
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct FleetStatsWire {
    #[serde(default)]
    pub clientes_activos: u32,
    #[serde(default)]
    pub operaciones_simultaneas: u32,
    #[serde(default)]
    pub conexiones_activas: u32,
}

impl From<FleetStatsWire> for FleetStats {
    fn from(value: FleetStatsWire) -> Self {
        Self {
            active_clients: value.clientes_activos,
            concurrent_ops: value.operaciones_simultaneas,
            active_connections: value.conexiones_activas,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SimulationWire {
    pub summary: Option<SimulationSummaryWire>,
    #[serde(default)]
    pub operations: Vec<SimulatedOperationWire>,
}

#[derive(Debug, Deserialize)]
pub struct SimulationSummaryWire {
    pub total: u32,
    #[serde(default)]
    pub deposits: u32,
    #[serde(default)]
    pub withdrawals: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default, alias = "avgMs")]
    pub avg_ms: f64,
    #[serde(default, alias = "minMs")]
    pub min_ms: f64,
    #[serde(default, alias = "maxMs")]
    pub max_ms: f64,
}

impl From<SimulationSummaryWire> for SimulationSummary {
    fn from(value: SimulationSummaryWire) -> Self {
        Self {
            total: value.total,
            deposits: value.deposits,
            withdrawals: value.withdrawals,
            errors: value.errors,
            avg_ms: value.avg_ms,
            min_ms: value.min_ms,
            max_ms: value.max_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SimulatedOperationWire {
    pub thread: String,
    #[serde(alias = "cedula")]
    pub identity: String,
    #[serde(alias = "operacion", alias = "kind")]
    pub tipo: String,
    #[serde(alias = "monto", with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(alias = "duracion_ms", alias = "durationMs")]
    pub duration_ms: f64,
    pub timestamp: String,
    #[serde(default = "default_operation_status")]
    pub status: String,
    #[serde(alias = "respuesta")]
    pub message: Option<String>,
    #[serde(
        default,
        alias = "resultingBalance",
        alias = "saldo_final",
        with = "rust_decimal::serde::float_option"
    )]
    pub resulting_balance: Option<Decimal>,
}

fn default_operation_status() -> String {
    "ok".to_string()
}

impl TryFrom<SimulatedOperationWire> for SimulatedOperation {
    type Error = AppError;

    fn try_from(value: SimulatedOperationWire) -> Result<Self, Self::Error> {
        if !value.duration_ms.is_finite() || value.duration_ms < 0.0 {
            return Err(AppError::Decode(
                "operation duration must be finite and non-negative".to_string(),
            ));
        }
        Ok(Self {
            thread: value.thread,
            identity: value.identity,
            kind: TransactionKind::parse_str(&value.tipo)?,
            amount: normalize_money(value.amount),
            duration_ms: value.duration_ms,
            timestamp: value.timestamp,
            status: value.status,
            message: value.message,
            resulting_balance: value.resulting_balance.map(normalize_money),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct IdentityRequest<'a> {
    pub cedula: &'a str,
}

#[derive(Debug, Serialize)]
pub struct MutationRequest<'a> {
    pub cedula: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    pub monto: Decimal,
}

#[derive(Debug, Serialize)]
pub struct TransferRequest<'a> {
    pub cedula_origen: &'a str,
    pub cedula_destino: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    pub monto: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CreateAccountRequest<'a> {
    pub cedula: &'a str,
    pub nombres: &'a str,
    pub apellidos: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    pub saldo: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BridgeHealthWire {
    pub status: String,
    pub service: Option<String>,
    pub timestamp: Option<String>,
}

// ---- push channel wire ----

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    BalanceChanged {
        identity: String,
        balance: Decimal,
    },
    TransactionsChanged {
        identity: String,
        transactions: Vec<Transaction>,
    },
    StatsChanged {
        stats: FleetStats,
    },
}

impl PushEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::BalanceChanged { .. } => BALANCE_UPDATED_EVENT,
            Self::TransactionsChanged { .. } => TRANSACTIONS_UPDATED_EVENT,
            Self::StatsChanged { .. } => STATS_UPDATED_EVENT,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::BalanceChanged { identity, .. } | Self::TransactionsChanged { identity, .. } => {
                Some(identity.as_str())
            }
            Self::StatsChanged { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushFrameWire {
    #[serde(rename = "connected")]
    Connected(GreetingWire),
    #[serde(rename = "balance_updated")]
    BalanceUpdated(BalanceUpdatedWire),
    #[serde(rename = "transactions_updated")]
    TransactionsUpdated(TransactionsUpdatedWire),
    #[serde(rename = "stats_updated")]
    StatsUpdated(StatsUpdatedWire),
}

#[derive(Debug, Deserialize)]
pub struct GreetingWire {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceUpdatedWire {
    pub cedula: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsUpdatedWire {
    pub cedula: String,
    #[serde(default)]
    pub transactions: Vec<TransactionWire>,
}

#[derive(Debug, Deserialize)]
pub struct StatsUpdatedWire {
    pub estadisticas: FleetStatsWire,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundFrame {
    #[serde(rename = "subscribe_balance")]
    SubscribeBalance { cedula: String },
}

impl PushFrameWire {
    pub fn into_event(self) -> Result<Option<PushEvent>, AppError> {
        let event = match self {
            PushFrameWire::Connected(_) => return Ok(None),
            PushFrameWire::BalanceUpdated(wire) => {
                let balance = normalize_money(wire.balance);
                if wire.cedula.trim().is_empty() || balance < Decimal::ZERO {
                    return Err(AppError::Decode(
                        "balance_updated requires an identity and a non-negative balance"
                            .to_string(),
                    ));
                }
                PushEvent::BalanceChanged {
                    identity: wire.cedula,
                    balance,
                }
            }
            PushFrameWire::TransactionsUpdated(wire) => {
                if wire.cedula.trim().is_empty() {
                    return Err(AppError::Decode(
                        "transactions_updated requires an identity".to_string(),
                    ));
                }
                PushEvent::TransactionsChanged {
                    identity: wire.cedula,
                    transactions: canonical_transactions(wire.transactions)?,
                }
            }
            PushFrameWire::StatsUpdated(wire) => PushEvent::StatsChanged {
                stats: wire.estadisticas.into(),
            },
        };
        Ok(Some(event))
    }
}

/// Decodes one push frame; `Ok(None)` means a frame with no state content.
pub fn parse_push_payload(payload: &mut [u8]) -> Result<Option<PushEvent>, AppError> {
    let wire: PushFrameWire = simd_json::serde::from_slice(payload)?;
    wire.into_event()
}

pub fn encode_outbound_frame(frame: &OutboundFrame) -> Result<String, AppError> {
    Ok(simd_json::serde::to_string(frame)?)
}
