//! Server and client configuration

use peercall_protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Largest accepted request / emitted response envelope, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Largest emitted request / accepted response envelope, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Give up on a remote call after this long. `None` waits until the
    /// response arrives or the connection fails.
    #[serde(default, with = "optional_millis", rename = "call_timeout_ms")]
    pub call_timeout: Option<Duration>,
}

/// Both halves, as loaded from a config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_max_frame_bytes() -> usize { DEFAULT_MAX_FRAME_BYTES }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            call_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

impl RpcConfig {
    /// Parse a TOML document with optional `[server]` and `[client]` tables
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

mod optional_millis {
    use serde::{ser, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => {
                let millis = u64::try_from(d.as_millis()).map_err(ser::Error::custom)?;
                s.serialize_some(&millis)
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
