pub mod api;
pub mod dispatcher;
pub mod merger;
pub mod registry;
pub mod stats;
pub mod transport;
pub mod types;

pub const BALANCE_UPDATED_EVENT: &str = "balance_updated";
pub const TRANSACTIONS_UPDATED_EVENT: &str = "transactions_updated";
pub const STATS_UPDATED_EVENT: &str = "stats_updated";
pub const SUBSCRIBE_BALANCE_EVENT: &str = "subscribe_balance";
