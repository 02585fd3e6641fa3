pub mod auth;
pub mod config;
pub mod engine;
pub mod idempotency;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod tenant;
pub mod wal;
pub mod wire;
