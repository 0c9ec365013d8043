pub mod account;
pub mod admin;
pub mod health;
pub mod push_channel;
pub mod session;
