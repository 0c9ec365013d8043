use crate::bank::api::{
    endpoint, get_json, history_endpoint, post_json, CREATE_ACCOUNT_PATH, DEPOSIT_PATH,
    IDENTIFY_PATH, SIMULATE_PATH, STATS_PATH, TRANSFER_PATH, WITHDRAW_PATH,
};
use crate::bank::stats::summarize_batch;
use crate::bank::types::{
    canonical_transactions, normalize_money, ClientConfig, ClientInfoWire, CreateAccountRequest,
    CreatedAccountWire, FleetStats, HistoryWire, Identity, IdentityRequest, MutationRequest,
    MutationWire,
    SimulationBatch, SimulationWire, StatsDataWire, Transaction, TransactionKind,
    TransferRequest, TransferWire,
};
use crate::error::AppError;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Identify,
    CheckBalance,
    Deposit,
    Withdraw,
    Transfer,
    CreateAccount,
    FetchHistory,
    FetchStats,
    RunSimulation,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::CheckBalance => "check_balance",
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Transfer => "transfer",
            Self::CreateAccount => "create_account",
            Self::FetchHistory => "fetch_history",
            Self::FetchStats => "fetch_stats",
            Self::RunSimulation => "run_simulation",
        }
    }
}

/// One logical pull-channel call. Amounts arrive as entered by the user and
/// are validated into 2-place decimals before anything leaves the process.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Identify {
        identity: String,
    },
    CheckBalance {
        identity: String,
    },
    Deposit {
        identity: String,
        amount: f64,
    },
    Withdraw {
        identity: String,
        amount: f64,
    },
    Transfer {
        from: String,
        to: String,
        amount: f64,
    },
    CreateAccount {
        identity: String,
        given_names: String,
        family_names: String,
    },
    FetchHistory {
        identity: String,
    },
    FetchStats,
    RunSimulation,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Identify { .. } => OperationKind::Identify,
            Self::CheckBalance { .. } => OperationKind::CheckBalance,
            Self::Deposit { .. } => OperationKind::Deposit,
            Self::Withdraw { .. } => OperationKind::Withdraw,
            Self::Transfer { .. } => OperationKind::Transfer,
            Self::CreateAccount { .. } => OperationKind::CreateAccount,
            Self::FetchHistory { .. } => OperationKind::FetchHistory,
            Self::FetchStats => OperationKind::FetchStats,
            Self::RunSimulation => OperationKind::RunSimulation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ValidatedOperation {
    Identify {
        identity: String,
    },
    CheckBalance {
        identity: String,
    },
    Mutate {
        identity: String,
        kind: TransactionKind,
        amount: Decimal,
    },
    Transfer {
        from: String,
        to: String,
        amount: Decimal,
    },
    CreateAccount {
        identity: String,
        given_names: String,
        family_names: String,
    },
    FetchHistory {
        identity: String,
    },
    FetchStats,
    RunSimulation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Identified {
        identity: Identity,
        balance: Decimal,
    },
    Balance {
        identity: String,
        balance: Decimal,
    },
    Mutated {
        identity: String,
        kind: TransactionKind,
        balance: Decimal,
        message: Option<String>,
    },
    Transferred {
        from: String,
        to: String,
        from_balance: Option<Decimal>,
        to_balance: Option<Decimal>,
        message: Option<String>,
    },
    AccountCreated {
        identity: Identity,
    },
    History {
        identity: String,
        transactions: Vec<Transaction>,
    },
    Stats {
        stats: FleetStats,
    },
    Simulation {
        batch: SimulationBatch,
    },
}

pub fn validate_identity(identity: &str, field: &str) -> Result<String, AppError> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub fn validate_amount(amount: f64) -> Result<Decimal, AppError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::Validation(
            "amount must be a finite number greater than zero".to_string(),
        ));
    }
    let value = Decimal::from_f64(amount)
        .map(normalize_money)
        .ok_or_else(|| AppError::Validation("amount is out of range".to_string()))?;
    if value <= Decimal::ZERO {
        return Err(AppError::Validation(
            "amount must be at least 0.01".to_string(),
        ));
    }
    Ok(value)
}

pub fn validate_new_account_id(identity: &str, prefix: char) -> Result<String, AppError> {
    let identity = validate_identity(identity, "identity")?;
    if !identity.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(AppError::Validation(
            "identity must contain only digits".to_string(),
        ));
    }
    if !identity.starts_with(prefix) {
        return Err(AppError::Validation(format!(
            "identity for a new account must begin with {prefix}"
        )));
    }
    Ok(identity)
}

/// Stateless pull-channel front: one outbound call per invocation, no retry,
/// no queuing, no deduplication.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    api_base_url: String,
    timeout: Option<Duration>,
    privileged_identities: Vec<String>,
    account_id_prefix: char,
}

impl Dispatcher {
    pub fn new(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            api_base_url: config.api_base_url.clone(),
            timeout: config.request_timeout_ms.map(Duration::from_millis),
            privileged_identities: config.privileged_identities.clone(),
            account_id_prefix: config.account_id_prefix,
        }
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn validate(&self, operation: Operation) -> Result<ValidatedOperation, AppError> {
        Ok(match operation {
            Operation::Identify { identity } => ValidatedOperation::Identify {
                identity: validate_identity(&identity, "identity")?,
            },
            Operation::CheckBalance { identity } => ValidatedOperation::CheckBalance {
                identity: validate_identity(&identity, "identity")?,
            },
            Operation::Deposit { identity, amount } => ValidatedOperation::Mutate {
                identity: validate_identity(&identity, "identity")?,
                kind: TransactionKind::Deposit,
                amount: validate_amount(amount)?,
            },
            Operation::Withdraw { identity, amount } => ValidatedOperation::Mutate {
                identity: validate_identity(&identity, "identity")?,
                kind: TransactionKind::Withdrawal,
                amount: validate_amount(amount)?,
            },
            Operation::Transfer { from, to, amount } => {
                let from = validate_identity(&from, "origin identity")?;
                let to = validate_identity(&to, "destination identity")?;
                if from == to {
                    return Err(AppError::Validation(
                        "origin and destination accounts must differ".to_string(),
                    ));
                }
                ValidatedOperation::Transfer {
                    from,
                    to,
                    amount: validate_amount(amount)?,
                }
            }
            Operation::CreateAccount {
                identity,
                given_names,
                family_names,
            } => {
                let identity = validate_new_account_id(&identity, self.account_id_prefix)?;
                let given_names = given_names.trim().to_string();
                if given_names.is_empty() {
                    return Err(AppError::Validation(
                        "given names must not be empty".to_string(),
                    ));
                }
                ValidatedOperation::CreateAccount {
                    identity,
                    given_names,
                    family_names: family_names.trim().to_string(),
                }
            }
            Operation::FetchHistory { identity } => ValidatedOperation::FetchHistory {
                identity: validate_identity(&identity, "identity")?,
            },
            Operation::FetchStats => ValidatedOperation::FetchStats,
            Operation::RunSimulation => ValidatedOperation::RunSimulation,
        })
    }

    pub async fn dispatch(&self, operation: Operation) -> Result<Reply, AppError> {
        let kind = operation.kind();
        let validated = self.validate(operation).inspect_err(|error| {
            debug!(operation = kind.as_str(), %error, "operation failed validation");
        })?;

        debug!(operation = kind.as_str(), "dispatching pull call");
        let result = self.send(validated).await;
        match &result {
            Ok(_) => debug!(operation = kind.as_str(), "pull call succeeded"),
            Err(AppError::Rejected { message, .. }) => {
                info!(operation = kind.as_str(), %message, "server rejected operation")
            }
            Err(error) => warn!(operation = kind.as_str(), %error, "pull call failed"),
        }
        result
    }

    fn is_privileged(&self, identity: &str) -> bool {
        self.privileged_identities
            .iter()
            .any(|candidate| candidate == identity)
    }

    async fn send(&self, operation: ValidatedOperation) -> Result<Reply, AppError> {
        match operation {
            ValidatedOperation::Identify { identity } => {
                let info = self.fetch_client_info(&identity).await?;
                let privileged = self.is_privileged(&identity);
                Ok(Reply::Identified {
                    balance: normalize_money(info.saldo),
                    identity: Identity {
                        id: identity,
                        given_names: info.nombres,
                        family_names: info.apellidos,
                        privileged,
                    },
                })
            }
            ValidatedOperation::CheckBalance { identity } => {
                let info = self.fetch_client_info(&identity).await?;
                Ok(Reply::Balance {
                    identity,
                    balance: normalize_money(info.saldo),
                })
            }
            ValidatedOperation::Mutate {
                identity,
                kind,
                amount,
            } => {
                let path = match kind {
                    TransactionKind::Deposit => DEPOSIT_PATH,
                    TransactionKind::Withdrawal => WITHDRAW_PATH,
                };
                let body = MutationRequest {
                    cedula: &identity,
                    monto: amount,
                };
                let wire = post_json::<_, MutationWire>(
                    &self.client,
                    &endpoint(&self.api_base_url, path),
                    Some(&body),
                    self.timeout,
                )
                .await?
                .into_required_data(kind_label(kind))?;
                let balance = normalize_money(wire.nuevo_saldo);
                if balance < Decimal::ZERO {
                    return Err(AppError::Decode(
                        "server reported a negative balance".to_string(),
                    ));
                }
                Ok(Reply::Mutated {
                    identity,
                    kind,
                    balance,
                    message: wire.mensaje,
                })
            }
            ValidatedOperation::Transfer { from, to, amount } => {
                let body = TransferRequest {
                    cedula_origen: &from,
                    cedula_destino: &to,
                    monto: amount,
                };
                let wire = post_json::<_, TransferWire>(
                    &self.client,
                    &endpoint(&self.api_base_url, TRANSFER_PATH),
                    Some(&body),
                    self.timeout,
                )
                .await?
                .into_data()?
                .unwrap_or_default();
                Ok(Reply::Transferred {
                    from,
                    to,
                    from_balance: wire.saldo_origen.map(normalize_money),
                    to_balance: wire.saldo_destino.map(normalize_money),
                    message: wire.mensaje,
                })
            }
            ValidatedOperation::CreateAccount {
                identity,
                given_names,
                family_names,
            } => {
                let body = CreateAccountRequest {
                    cedula: &identity,
                    nombres: &given_names,
                    apellidos: &family_names,
                    saldo: Decimal::ZERO,
                };
                let created = post_json::<_, CreatedAccountWire>(
                    &self.client,
                    &endpoint(&self.api_base_url, CREATE_ACCOUNT_PATH),
                    Some(&body),
                    self.timeout,
                )
                .await?
                .into_data()?
                .unwrap_or_default();
                debug!(
                    identity = %identity,
                    message = ?created.mensaje,
                    opening_balance = ?created.saldo_inicial,
                    "account created"
                );
                let privileged = self.is_privileged(&identity);
                Ok(Reply::AccountCreated {
                    identity: Identity {
                        id: identity,
                        given_names,
                        family_names,
                        privileged,
                    },
                })
            }
            ValidatedOperation::FetchHistory { identity } => {
                let wire = get_json::<HistoryWire>(
                    &self.client,
                    &history_endpoint(&self.api_base_url, &identity)?,
                    self.timeout,
                )
                .await?
                .into_data()?;
                let transactions = match wire {
                    Some(history) => canonical_transactions(history.transacciones)?,
                    None => Vec::new(),
                };
                Ok(Reply::History {
                    identity,
                    transactions,
                })
            }
            ValidatedOperation::FetchStats => {
                let reply = get_json::<StatsDataWire>(
                    &self.client,
                    &endpoint(&self.api_base_url, STATS_PATH),
                    self.timeout,
                )
                .await?;
                let top_level = reply.estadisticas;
                let nested = reply.into_data()?.and_then(|data| data.estadisticas);
                let wire = top_level.or(nested).ok_or_else(|| {
                    AppError::Decode("stats reply is missing estadisticas".to_string())
                })?;
                Ok(Reply::Stats { stats: wire.into() })
            }
            ValidatedOperation::RunSimulation => {
                let wire = post_json::<(), SimulationWire>(
                    &self.client,
                    &endpoint(&self.api_base_url, SIMULATE_PATH),
                    None,
                    self.timeout,
                )
                .await?
                .into_data()?
                .unwrap_or_default();
                Ok(Reply::Simulation {
                    batch: summarize_batch(wire)?,
                })
            }
        }
    }

    async fn fetch_client_info(&self, identity: &str) -> Result<ClientInfoWire, AppError> {
        let body = IdentityRequest { cedula: identity };
        post_json::<_, ClientInfoWire>(
            &self.client,
            &endpoint(&self.api_base_url, IDENTIFY_PATH),
            Some(&body),
            self.timeout,
        )
        .await?
        .into_required_data("consulta")
    }
}

fn kind_label(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Deposit => "deposito",
        TransactionKind::Withdrawal => "retiro",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::types::ClientArgs;
    use rust_decimal_macros::dec;

    fn unreachable_dispatcher() -> Dispatcher {
        // Port 9 (discard) on loopback is closed in test environments, so any
        // call that reached the network would fail with a transport error.
        let config = ClientArgs {
            api_base_url: Some("http://127.0.0.1:9/api".to_string()),
            ..ClientArgs::default()
        }
        .normalize()
        .expect("test config should be valid");
        Dispatcher::new(Client::new(), &config)
    }

    #[test]
    fn validates_amount_precision_and_sign() {
        assert_eq!(validate_amount(50.0).expect("valid amount"), dec!(50.00));
        assert_eq!(validate_amount(10.456).expect("valid amount"), dec!(10.46));
        assert!(validate_amount(0.0).is_err());
        assert!(validate_amount(-5.0).is_err());
        assert!(validate_amount(f64::NAN).is_err());
        assert!(validate_amount(f64::INFINITY).is_err());
        assert!(validate_amount(0.001).is_err());
    }

    #[test]
    fn new_account_ids_need_the_prefix_digit() {
        assert!(validate_new_account_id("0123456789", '0').is_ok());
        assert!(validate_new_account_id("1234567890", '0').is_err());
        assert!(validate_new_account_id("01234abc", '0').is_err());
        assert!(validate_new_account_id("   ", '0').is_err());
    }

    #[tokio::test]
    async fn negative_deposit_never_reaches_the_network() {
        let dispatcher = unreachable_dispatcher();
        let result = dispatcher
            .dispatch(Operation::Deposit {
                identity: "0000000001".to_string(),
                amount: -5.0,
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn malformed_creation_id_is_a_validation_error() {
        let dispatcher = unreachable_dispatcher();
        let result = dispatcher
            .dispatch(Operation::CreateAccount {
                identity: "1234567890".to_string(),
                given_names: "Juan".to_string(),
                family_names: "Pérez".to_string(),
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn self_transfer_is_rejected_locally() {
        let dispatcher = unreachable_dispatcher();
        let result = dispatcher
            .dispatch(Operation::Transfer {
                from: "0000000001".to_string(),
                to: " 0000000001 ".to_string(),
                amount: 10.0,
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn unreachable_bridge_is_a_transport_error() {
        let dispatcher = unreachable_dispatcher();
        let result = dispatcher.dispatch(Operation::FetchStats).await;

        let error = result.expect_err("closed port should fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Transport);
    }

    #[test]
    fn operation_kind_labels_are_stable() {
        let operation = Operation::FetchHistory {
            identity: "0000000001".to_string(),
        };
        assert_eq!(operation.kind(), OperationKind::FetchHistory);
        assert_eq!(operation.kind().as_str(), "fetch_history");
    }
}
