//! # Configuration Management
//!
//! Centralized configuration for the transport core.
//!
//! This module provides structured configuration for a client connection:
//! endpoint, timeouts, keepalive cadence and pre-key bootstrap parameters.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - The protocol name and connection header are pinned; they participate in
//!   the handshake transcript and must match the server exactly
//! - The certificate issuer serial is pinned and checked on every handshake

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Noise protocol name mixed into the handshake transcript. Exactly 32 bytes,
/// so it is used as the initial transcript hash without hashing.
pub const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

/// Fixed magic + version header sent once per connection before the first
/// frame, and mixed into the handshake transcript.
pub const CONN_HEADER: [u8; 4] = [0x4D, 0x57, 6, 2];

/// Marker bytes of the multiplexing intro used when routing info is
/// configured: `"ED" | version | frame type`.
pub const EDGE_HEADER: [u8; 4] = [b'E', b'D', 0, 1];

/// Pinned issuer serial of the intermediate server certificate.
pub const CERT_ISSUER_SERIAL: u32 = 0;

/// Largest payload expressible in the 24-bit length prefix.
pub const FRAME_MAX_LEN: usize = (1 << 24) - 1;

/// Address of the server in node `to` attributes.
pub const SERVER_JID: &str = "s.msgwire.net";

/// Default gateway endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://gateway.msgwire.net/ws";

/// Client version string; hashed into the registration payload so the
/// server can identify the software revision.
pub const CLIENT_VERSION: &str = "0.3.0";

const fn default_connect_timeout_ms() -> u64 {
    20_000
}

const fn default_keepalive_interval_ms() -> u64 {
    30_000
}

const fn default_query_timeout_ms() -> u64 {
    60_000
}

const fn default_pre_key_upload_count() -> u32 {
    50
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

/// Connection configuration for a single client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// WebSocket endpoint to connect to.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// How long to wait for the socket to open and the handshake to finish.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Keepalive ping cadence. The watchdog declares the connection lost if
    /// no traffic is observed for this interval plus a 5 second grace.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Default deadline for `query` when the caller does not pass one.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// How many one-time pre-keys to upload in a batch after authentication.
    #[serde(default = "default_pre_key_upload_count")]
    pub pre_key_upload_count: u32,

    /// Optional edge-routing payload, sent once inside the connection intro.
    #[serde(default)]
    pub routing_info: Option<Vec<u8>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            pre_key_upload_count: default_pre_key_upload_count(),
            routing_info: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ClientError::Config(format!("failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ClientError::Config(format!("failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ClientError::Config(format!("failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ClientError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ClientError::Config(
                "keepalive_interval_ms must be non-zero".into(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(ClientError::Config(
                "query_timeout_ms must be non-zero".into(),
            ));
        }
        if let Some(routing) = &self.routing_info {
            if routing.len() > FRAME_MAX_LEN {
                return Err(ClientError::Config("routing_info too large".into()));
            }
        }
        Ok(())
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keepalive interval as a `Duration`.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Default query deadline as a `Duration`.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
