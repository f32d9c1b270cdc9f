pub mod app;
pub mod broadcaster;
pub mod cli;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod host;
pub mod protocol;
pub mod redact;
pub mod sidecar;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use broadcaster::{BroadcastStatus, Broadcaster};
pub use config::BroadcastConfig;
