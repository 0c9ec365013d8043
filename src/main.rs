use bank_client_lib::bank::merger::AccountView;
use bank_client_lib::commands::{account, admin, health, push_channel, session};
use bank_client_lib::{init_tracing, AppError, AppState, ClientArgs, ErrorReport};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bank-client")]
#[command(about = "Terminal front end for the bank account reconciliation client")]
struct Cli {
    /// Account identity (cedula) to log in as
    #[arg(long, env = "BANK_IDENTITY")]
    identity: String,

    /// Pull channel base URL
    #[arg(long, env = "BANK_API_BASE_URL")]
    api_base_url: Option<String>,

    /// Push channel WebSocket URL
    #[arg(long, env = "BANK_PUSH_URL")]
    push_url: Option<String>,

    #[arg(long, env = "BANK_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: Option<u64>,

    #[arg(long, env = "BANK_RECONNECT_ATTEMPTS")]
    reconnect_attempts: Option<u32>,

    /// Grace window for push confirmation of a mutating reply
    #[arg(long, env = "BANK_CONFIRMATION_GRACE_MS")]
    confirmation_grace_ms: Option<u64>,

    #[arg(long, env = "BANK_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Privileged identities (comma-separated)
    #[arg(long, env = "BANK_PRIVILEGED_IDENTITIES", value_delimiter = ',')]
    privileged_identities: Option<Vec<String>>,

    #[arg(long, env = "BANK_ACCOUNT_ID_PREFIX")]
    account_id_prefix: Option<char>,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Follow the account and print every snapshot change until Ctrl-C
    Watch,
    Deposit {
        #[arg(long)]
        amount: f64,
    },
    Withdraw {
        #[arg(long)]
        amount: f64,
    },
    Transfer {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: f64,
    },
    History,
    CreateAccount {
        #[arg(long = "new-identity")]
        new_identity: String,
        #[arg(long)]
        given_names: String,
        #[arg(long, default_value = "")]
        family_names: String,
    },
    Stats,
    Simulate,
    Health,
}

impl Cli {
    fn client_args(&self) -> ClientArgs {
        ClientArgs {
            api_base_url: self.api_base_url.clone(),
            push_url: self.push_url.clone(),
            reconnect_delay_ms: self.reconnect_delay_ms,
            reconnect_attempts: self.reconnect_attempts,
            confirmation_grace_ms: self.confirmation_grace_ms,
            request_timeout_ms: self.request_timeout_ms,
            privileged_identities: self.privileged_identities.clone(),
            account_id_prefix: self.account_id_prefix,
        }
    }
}

fn print_view(view: &AccountView) {
    let name = view
        .profile
        .as_ref()
        .map(|profile| profile.display_name())
        .unwrap_or_default();
    let balance = view
        .balance
        .map(|balance| balance.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "[{:?}] {} {} balance={} awaiting_confirmation={} inconsistent={}",
        view.phase, view.identity, name, balance, view.awaiting_confirmation, view.inconsistent
    );
    if let Some(error) = view.inconsistency() {
        println!("    warning: {}", error.user_message());
    }
    for transaction in view.transactions_newest_first() {
        println!(
            "    {} {:?} {} -> {}",
            transaction.timestamp, transaction.kind, transaction.amount, transaction.resulting_balance
        );
    }
}

async fn run(cli: Cli, state: &AppState) -> Result<(), AppError> {
    push_channel::start_push_channel(state).await;
    let login = session::login(state, &cli.identity).await?;
    let identity = login.view.identity.clone();
    print_view(&login.view);

    match cli.action.unwrap_or(Action::Watch) {
        Action::Watch => {
            let _snapshots = state.merger.on_snapshot_changed(&identity, print_view);
            let _stats = state.merger.on_stats_changed(|stats| {
                println!(
                    "[stats] clients={} concurrent_ops={} connections={}",
                    stats.active_clients, stats.concurrent_ops, stats.active_connections
                );
            });
            info!(identity = %identity, "watching account, press Ctrl-C to exit");
            tokio::signal::ctrl_c().await?;
            session::logout(state, &identity);
        }
        Action::Deposit { amount } => {
            let receipt = account::deposit(state, &identity, amount).await?;
            print_view(&receipt.view);
        }
        Action::Withdraw { amount } => {
            let receipt = account::withdraw(state, &identity, amount).await?;
            print_view(&receipt.view);
        }
        Action::Transfer { to, amount } => {
            let receipt = account::transfer(state, &identity, &to, amount).await?;
            print_view(&receipt.origin);
        }
        Action::History => {
            let view = account::refresh_history(state, &identity).await?;
            print_view(&view);
        }
        Action::CreateAccount {
            new_identity,
            given_names,
            family_names,
        } => {
            let created =
                account::create_account(state, &new_identity, &given_names, &family_names).await?;
            println!("created {} ({})", created.id, created.display_name());
        }
        Action::Stats => {
            let stats = admin::fetch_stats(state, &identity).await?;
            println!(
                "clients={} concurrent_ops={} connections={}",
                stats.active_clients, stats.concurrent_ops, stats.active_connections
            );
        }
        Action::Simulate => {
            let batch = admin::run_simulation(state, &identity).await?;
            let summary = &batch.summary;
            println!(
                "total={} deposits={} withdrawals={} errors={} avg={:.1}ms min={:.1}ms max={:.1}ms",
                summary.total,
                summary.deposits,
                summary.withdrawals,
                summary.errors,
                summary.avg_ms,
                summary.min_ms,
                summary.max_ms
            );
            for operation in &batch.recent_operations {
                println!(
                    "    {} {} {:?} {} {:.1}ms {}",
                    operation.thread,
                    operation.identity,
                    operation.kind,
                    operation.amount,
                    operation.duration_ms,
                    operation.status
                );
            }
        }
        Action::Health => {
            let response = health::health(state).await;
            println!(
                "status={} bridge={} push={:?} uptime_ms={}",
                response.status, response.bridge, response.push.state, response.uptime_ms
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.client_args().normalize() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::init(config).await {
        Ok(state) => state,
        Err(error) => {
            error!(%error, "failed to initialize client");
            return ExitCode::FAILURE;
        }
    };

    let result = run(cli, &state).await;
    state.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let report = ErrorReport::from(&error);
            error!(kind = ?report.kind, %error, "command failed");
            eprintln!("{}", report.message);
            ExitCode::FAILURE
        }
    }
}
