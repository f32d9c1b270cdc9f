use std::io;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("relay address is required; pass --relay or set BEACH_CAST_RELAY")]
    MissingRelay,
    #[error("room is required; pass --room or set BEACH_CAST_ROOM")]
    MissingRoom,
    #[error("invalid relay address '{value}': {reason}")]
    InvalidRelay { value: String, reason: String },
    #[error("invalid ignore pattern '{pattern}': {reason}")]
    InvalidIgnorePattern { pattern: String, reason: String },
}

/// Failures reported by host collaborators. The engine logs these and degrades; none reach the host.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("resource not available: {0}")]
    ResourceUnavailable(String),
    #[error("highlight provider failed: {0}")]
    Highlights(String),
    #[error("host request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("invalid host event on line {line}: {reason}")]
    InvalidHostEvent { line: usize, reason: String },
}
