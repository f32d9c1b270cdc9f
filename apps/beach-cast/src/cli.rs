use clap::{Args, Parser};
use std::path::PathBuf;

use crate::config::{BroadcastConfig, RELAY_ENV, ROOM_ENV, TOKEN_ENV};
use crate::error::ConfigError;
use crate::protocol::Metadata;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-cast",
    about = "Broadcast the active editor and terminals to a relay room",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        env = RELAY_ENV,
        value_name = "URL",
        help = "Relay address (host:port, http(s):// or ws(s)://)"
    )]
    pub relay: Option<String>,

    #[arg(long, env = ROOM_ENV, value_name = "ROOM", help = "Room to broadcast into")]
    pub room: Option<String>,

    #[arg(
        long,
        env = TOKEN_ENV,
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Authentication token passed to the relay"
    )]
    pub token: Option<String>,

    #[command(flatten)]
    pub stream: StreamArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct StreamArgs {
    #[arg(long, help = "Title shown to viewers")]
    pub title: Option<String>,

    #[arg(long, help = "Description shown to viewers")]
    pub description: Option<String>,

    #[arg(long = "tag", value_name = "TAG", help = "Tag for the stream (repeatable)")]
    pub tags: Vec<String>,

    #[arg(
        long = "ignore",
        value_name = "GLOB",
        help = "Hide files matching this glob from viewers (repeatable)"
    )]
    pub ignore: Vec<String>,

    #[arg(
        long = "workspace-folder",
        value_name = "PATH",
        help = "Workspace root used to label terminal directories (repeatable)"
    )]
    pub workspace_folders: Vec<PathBuf>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Connect without going live; a `start` event from stdin begins streaming"
    )]
    pub paused: bool,
}

impl StreamArgs {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            title: self.title.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            live: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BEACH_CAST_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BEACH_CAST_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn to_config(&self) -> Result<BroadcastConfig, ConfigError> {
        let relay = self.relay.as_deref().ok_or(ConfigError::MissingRelay)?;
        let room = self.room.clone().ok_or(ConfigError::MissingRoom)?;
        Ok(BroadcastConfig::new(relay, room)?
            .with_auth_token(self.token.clone())
            .with_metadata(self.stream.metadata()))
    }
}
