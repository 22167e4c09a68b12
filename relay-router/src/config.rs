//! Configuration loading for the router.
//!
//! Configuration is loaded from a TOML file (default: `router.toml`). Every
//! field has a default, and [`Config::validated`] clamps values into the
//! ranges the router supports.

use relay_core::{SpamConfig, BUFFER_CHUNKS, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the router.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Listener and identity.
    #[serde(default)]
    pub server: ServerConfig,
    /// Relayed transfer tuning.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Sweep loop thresholds.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Spam guard thresholds.
    #[serde(default)]
    pub spam: SpamSection,
    /// Rate limiting.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Feature switches.
    #[serde(default)]
    pub features: FeaturesConfig,
    /// HTTP endpoints.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the relay listener (default: 0.0.0.0:4433).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Display name reported by `Info`.
    #[serde(default = "default_name")]
    pub name: String,
    /// Message of the day sent to joining clients.
    #[serde(default)]
    pub motd: Option<String>,
    /// Seconds a session may take to complete its handshake (3-60).
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    /// Maximum concurrent sessions (default: 10000).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Chunk size handed to uploaders (1 KiB - 32 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Router-side buffer per transfer. Defaults to 16 chunks.
    #[serde(default)]
    pub chunk_buffer: Option<u64>,
    /// Maximum spread of in-flight offsets, 0 disables.
    #[serde(default)]
    pub chunk_drift: u64,
    /// Maximum live transfers (default: 1024).
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
}

/// Sweep loop thresholds, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Idle time before a client is evicted (180-900).
    #[serde(default = "default_client_secs")]
    pub client_secs: u64,
    /// Grace period for a transfer that has not moved bytes (180-3600).
    #[serde(default = "default_queue_secs")]
    pub queue_secs: u64,
    /// Lifetime of a spam record (60-3600).
    #[serde(default = "default_spam_secs")]
    pub spam_secs: u64,
    /// Idle time before a moving transfer is evicted (180-900).
    #[serde(default = "default_transfer_secs")]
    pub transfer_secs: u64,
    /// Seconds between sweeps (at least 1).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Spam guard thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct SpamSection {
    /// Events per window before a client is marked as spamming.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Window for consecutive requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Window for repeated identical payloads.
    #[serde(default = "default_dupe_timeout_ms")]
    pub dupe_timeout_ms: u64,
    /// Window for any requests.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Connection attempts per IP address per minute (default: 60).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Requests per session per minute (default: 600).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Requests per second across all sessions (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// Feature switches.
#[derive(Debug, Clone, Deserialize)]
pub struct FeaturesConfig {
    /// Relay chat between members.
    #[serde(default = "default_true")]
    pub message_router: bool,
    /// Relay file transfers between members.
    #[serde(default = "default_true")]
    pub transfer_router: bool,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Serve `/health` and `/metrics` (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:4433".to_string()
}

fn default_name() -> String {
    "shroud router".to_string()
}

fn default_socket_timeout_secs() -> u64 {
    15
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_chunk_size() -> u64 {
    relay_core::DEFAULT_CHUNK_SIZE
}

fn default_max_transfers() -> usize {
    1024
}

fn default_client_secs() -> u64 {
    300 // 5 minutes
}

fn default_queue_secs() -> u64 {
    1800 // 30 minutes
}

fn default_spam_secs() -> u64 {
    300
}

fn default_transfer_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_items() -> usize {
    3
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_dupe_timeout_ms() -> u64 {
    30_000
}

fn default_max_timeout_ms() -> u64 {
    30_000
}

fn default_connections_per_minute() -> u32 {
    60
}

fn default_messages_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            name: default_name(),
            motd: None,
            socket_timeout_secs: default_socket_timeout_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_buffer: None,
            chunk_drift: 0,
            max_transfers: default_max_transfers(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            client_secs: default_client_secs(),
            queue_secs: default_queue_secs(),
            spam_secs: default_spam_secs(),
            transfer_secs: default_transfer_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for SpamSection {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            request_timeout_ms: default_request_timeout_ms(),
            dupe_timeout_ms: default_dupe_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            messages_per_minute: default_messages_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            message_router: true,
            transfer_router: true,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Clamp every value into its supported range.
    pub fn validated(mut self) -> Self {
        let server = &mut self.server;
        server.socket_timeout_secs = server.socket_timeout_secs.clamp(3, 60);
        server.max_sessions = server.max_sessions.max(1);

        let transfer = &mut self.transfer;
        transfer.chunk_size = transfer.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        let buffer = transfer
            .chunk_buffer
            .unwrap_or(transfer.chunk_size * BUFFER_CHUNKS);
        transfer.chunk_buffer = Some(buffer.clamp(
            MIN_CHUNK_SIZE * BUFFER_CHUNKS,
            MAX_CHUNK_SIZE * BUFFER_CHUNKS,
        ));
        transfer.chunk_drift = transfer.chunk_drift.min(MAX_CHUNK_SIZE);
        transfer.max_transfers = transfer.max_transfers.max(1);

        let timeouts = &mut self.timeouts;
        timeouts.client_secs = timeouts.client_secs.clamp(180, 900);
        timeouts.queue_secs = timeouts.queue_secs.clamp(180, 3600);
        timeouts.spam_secs = timeouts.spam_secs.clamp(60, 3600);
        timeouts.transfer_secs = timeouts.transfer_secs.clamp(180, 900);
        timeouts.sweep_interval_secs = timeouts.sweep_interval_secs.max(1);

        self.spam.max_items = self.spam.max_items.max(1);

        let limits = &mut self.limits;
        limits.connections_per_minute = limits.connections_per_minute.max(1);
        limits.messages_per_minute = limits.messages_per_minute.max(1);
        limits.global_requests_per_second = limits.global_requests_per_second.max(1);

        self
    }

    /// Buffer each transfer may hold on the router.
    pub fn chunk_buffer(&self) -> u64 {
        self.transfer
            .chunk_buffer
            .unwrap_or(self.transfer.chunk_size * BUFFER_CHUNKS)
    }

    /// How long a session may take to handshake.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.server.socket_timeout_secs)
    }

    /// Idle time before a client is evicted.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.client_secs)
    }

    /// Grace period for a transfer with an empty window.
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.queue_secs)
    }

    /// Lifetime of a spam record.
    pub fn spam_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.spam_secs)
    }

    /// Idle time before a transfer is evicted.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.transfer_secs)
    }

    /// Time between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.sweep_interval_secs)
    }

    /// Spam guard thresholds for new clients.
    pub fn spam_config(&self) -> SpamConfig {
        SpamConfig {
            max_items: self.spam.max_items,
            request_timeout: Duration::from_millis(self.spam.request_timeout_ms),
            dupe_timeout: Duration::from_millis(self.spam.dupe_timeout_ms),
            max_timeout: Duration::from_millis(self.spam.max_timeout_ms),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
