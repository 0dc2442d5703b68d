use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// STUN/relay server entry handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Public STUN servers used when nothing is configured.
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long `Calling`/`Incoming` may wait for the other party.
    pub ring_timeout_secs: u64,
    /// Bound on every single media or negotiation step.
    pub operation_timeout_secs: u64,
    /// Buffer size of the notification broadcast channel.
    pub notification_capacity: usize,
    /// Messages held per call that arrive before its `call-request`.
    pub early_buffer_limit: usize,
    /// Calls with early messages held at once. Held messages also expire
    /// after the ring timeout.
    pub early_buffer_calls: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            ring_timeout_secs: 45,
            operation_timeout_secs: 30,
            notification_capacity: 100,
            early_buffer_limit: 32,
            early_buffer_calls: 16,
        }
    }
}

impl CallConfig {
    pub const ENV_RING_TIMEOUT: &'static str = "PEER_CALL_RING_TIMEOUT_SECS";
    pub const ENV_OPERATION_TIMEOUT: &'static str = "PEER_CALL_OPERATION_TIMEOUT_SECS";

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Override timeouts from `PEER_CALL_*` environment variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let parse = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Env { key, value }),
                None => Ok(None),
            }
        };
        if let Some(secs) = parse(Self::ENV_RING_TIMEOUT)? {
            self.ring_timeout_secs = secs;
        }
        if let Some(secs) = parse(Self::ENV_OPERATION_TIMEOUT)? {
            self.operation_timeout_secs = secs;
        }
        Ok(self)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}
