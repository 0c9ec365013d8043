use crate::bank::dispatcher::{Operation, Reply};
use crate::bank::merger::AccountView;
use crate::bank::types::Identity;
use crate::error::AppError;
use crate::state::AppState;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReceipt {
    pub message: Option<String>,
    pub view: AccountView,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub message: Option<String>,
    pub origin: AccountView,
    pub destination_balance: Option<Decimal>,
}

async fn dispatch_and_apply(state: &AppState, operation: Operation) -> Result<Reply, AppError> {
    let reply = state.dispatcher.dispatch(operation).await?;
    state.apply_reply(&reply);
    Ok(reply)
}

fn unexpected_reply(operation: &str) -> AppError {
    AppError::Decode(format!("{operation} returned an unexpected reply"))
}

pub async fn check_balance(state: &AppState, identity: &str) -> Result<AccountView, AppError> {
    match dispatch_and_apply(
        state,
        Operation::CheckBalance {
            identity: identity.to_string(),
        },
    )
    .await?
    {
        Reply::Balance { identity, .. } => Ok(state.merger.snapshot(&identity)),
        _ => Err(unexpected_reply("check_balance")),
    }
}

pub async fn deposit(
    state: &AppState,
    identity: &str,
    amount: f64,
) -> Result<OperationReceipt, AppError> {
    mutate(
        state,
        Operation::Deposit {
            identity: identity.to_string(),
            amount,
        },
    )
    .await
}

pub async fn withdraw(
    state: &AppState,
    identity: &str,
    amount: f64,
) -> Result<OperationReceipt, AppError> {
    mutate(
        state,
        Operation::Withdraw {
            identity: identity.to_string(),
            amount,
        },
    )
    .await
}

async fn mutate(state: &AppState, operation: Operation) -> Result<OperationReceipt, AppError> {
    let label = operation.kind().as_str();
    match dispatch_and_apply(state, operation).await? {
        Reply::Mutated {
            identity, message, ..
        } => Ok(OperationReceipt {
            message,
            view: state.merger.snapshot(&identity),
        }),
        _ => Err(unexpected_reply(label)),
    }
}

pub async fn transfer(
    state: &AppState,
    from: &str,
    to: &str,
    amount: f64,
) -> Result<TransferReceipt, AppError> {
    let operation = Operation::Transfer {
        from: from.to_string(),
        to: to.to_string(),
        amount,
    };
    match dispatch_and_apply(state, operation).await? {
        Reply::Transferred {
            from,
            to_balance,
            message,
            ..
        } => Ok(TransferReceipt {
            message,
            origin: state.merger.snapshot(&from),
            destination_balance: to_balance,
        }),
        _ => Err(unexpected_reply("transfer")),
    }
}

pub async fn create_account(
    state: &AppState,
    identity: &str,
    given_names: &str,
    family_names: &str,
) -> Result<Identity, AppError> {
    let operation = Operation::CreateAccount {
        identity: identity.to_string(),
        given_names: given_names.to_string(),
        family_names: family_names.to_string(),
    };
    match dispatch_and_apply(state, operation).await? {
        Reply::AccountCreated { identity } => Ok(identity),
        _ => Err(unexpected_reply("create_account")),
    }
}

pub async fn refresh_history(state: &AppState, identity: &str) -> Result<AccountView, AppError> {
    match dispatch_and_apply(
        state,
        Operation::FetchHistory {
            identity: identity.to_string(),
        },
    )
    .await?
    {
        Reply::History { identity, .. } => Ok(state.merger.snapshot(&identity)),
        _ => Err(unexpected_reply("fetch_history")),
    }
}
