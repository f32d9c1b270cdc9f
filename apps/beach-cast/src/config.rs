use std::env;

use url::Url;

use crate::error::ConfigError;
use crate::protocol::Metadata;

pub const RELAY_ENV: &str = "BEACH_CAST_RELAY";
pub const ROOM_ENV: &str = "BEACH_CAST_ROOM";
pub const TOKEN_ENV: &str = "BEACH_CAST_TOKEN";

pub const BROADCASTER_ROLE: &str = "broadcaster";

/// Everything needed to reach the relay and describe the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    pub relay: Url,
    pub room: String,
    pub role: String,
    pub auth_token: Option<String>,
    pub metadata: Metadata,
}

impl BroadcastConfig {
    pub fn new(relay: &str, room: impl Into<String>) -> Result<Self, ConfigError> {
        let room = room.into();
        if room.trim().is_empty() {
            return Err(ConfigError::MissingRoom);
        }
        Ok(Self {
            relay: normalize_relay(relay)?,
            room,
            role: BROADCASTER_ROLE.to_string(),
            auth_token: None,
            metadata: Metadata::default(),
        })
    }

    /// Load relay, room and token from `BEACH_CAST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let relay = non_empty_var(RELAY_ENV).ok_or(ConfigError::MissingRelay)?;
        let room = non_empty_var(ROOM_ENV).ok_or(ConfigError::MissingRoom)?;
        let mut config = Self::new(&relay, room)?;
        config.auth_token = non_empty_var(TOKEN_ENV);
        Ok(config)
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|token| !token.is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// `{relay}/ws/{room}?role=..[&token=..][&reconnect=..]`
    pub fn connection_url(&self, reconnect_token: Option<&str>) -> Url {
        let mut url = self.relay.clone();
        let pushed = match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty().push("ws").push(&self.room);
                true
            }
            Err(()) => false,
        };
        if !pushed {
            let path = format!("{}/ws/{}", self.relay.path().trim_end_matches('/'), self.room);
            url.set_path(&path);
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("role", &self.role);
            if let Some(token) = self.auth_token.as_deref() {
                query.append_pair("token", token);
            }
            if let Some(reconnect) = reconnect_token {
                query.append_pair("reconnect", reconnect);
            }
        }
        url
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Accepts `host:port`, `http(s)://` or `ws(s)://` forms and returns a websocket url.
pub fn normalize_relay(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::MissingRelay);
    }
    let invalid = |reason: String| ConfigError::InvalidRelay {
        value: raw.to_string(),
        reason,
    };

    let with_scheme = match trimmed.split_once("://") {
        Some(("http", rest)) => format!("ws://{rest}"),
        Some(("https", rest)) => format!("wss://{rest}"),
        Some(("ws" | "wss", _)) => trimmed.to_string(),
        Some((scheme, _)) => return Err(invalid(format!("unsupported scheme '{scheme}'"))),
        None if is_loopback(trimmed) => format!("ws://{trimmed}"),
        None => format!("wss://{trimmed}"),
    };

    let mut url = Url::parse(&with_scheme).map_err(|err| invalid(err.to_string()))?;
    if url.host_str() == Some("localhost") {
        // Avoid the IPv6 (::1) preference some resolvers apply to localhost.
        url.set_host(Some("127.0.0.1"))
            .map_err(|err| invalid(err.to_string()))?;
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

fn is_loopback(address: &str) -> bool {
    let host = address.split([':', '/']).next().unwrap_or_default();
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "0.0.0.0")
}
