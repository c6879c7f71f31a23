//! Configuration system for the RoomLink CLI.

use roomlink_core::TransferConfig;
use roomlink_core::transfer::MAX_CHUNK_SIZE;
use roomlink_relay::{MIN_ROOM_ID_BYTES, RelayConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// RoomLink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Room lifecycle configuration
    #[serde(default)]
    pub rooms: RoomsConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// `Access-Control-Allow-Origin` for the HTTP endpoints
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
}

/// Room lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Room lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum live rooms
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,
    /// Random bytes per room id
    #[serde(default = "default_room_id_bytes")]
    pub room_id_bytes: usize,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Buffered bytes above which sending pauses
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Backpressure poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Longest backpressure pause in seconds
    #[serde(default = "default_max_stall_secs")]
    pub max_stall_secs: u64,
    /// Largest accepted batch in bytes
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", roomlink_relay::DEFAULT_RELAY_PORT)
}

fn default_allowed_origin() -> String {
    "*".to_string()
}

fn default_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_room_id_bytes() -> usize {
    roomlink_relay::DEFAULT_ROOM_ID_BYTES
}

fn default_chunk_size() -> usize {
    roomlink_core::transfer::DEFAULT_CHUNK_SIZE
}

fn default_high_watermark() -> usize {
    roomlink_core::transfer::DEFAULT_HIGH_WATERMARK
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_max_stall_secs() -> u64 {
    30
}

fn default_max_batch_bytes() -> u64 {
    roomlink_core::transfer::DEFAULT_MAX_BATCH_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_origin: default_allowed_origin(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_rooms: default_max_rooms(),
            room_id_bytes: default_room_id_bytes(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            high_watermark: default_high_watermark(),
            poll_interval_ms: default_poll_interval_ms(),
            max_stall_secs: default_max_stall_secs(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Read and parse a TOML file
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or not valid configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Write as TOML, creating parent directories
    ///
    /// # Errors
    ///
    /// Fails when the directory or file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating config directory {}", dir.display()))?;
        }
        fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing config {}", path.display()))
    }

    /// `<config dir>/roomlink/config.toml`
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("roomlink")
            .join("config.toml")
    }

    /// Load [`default_path`](Self::default_path), writing the defaults there first
    /// if the file is missing
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, parsed or created.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            Self::default().save(&path)?;
        }
        Self::load(&path)
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.server.listen_addr))
    }

    /// Relay settings from the `[rooms]` section
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            room_ttl: Duration::from_secs(self.rooms.ttl_secs),
            sweep_interval: Duration::from_secs(self.rooms.sweep_interval_secs),
            max_rooms: self.rooms.max_rooms,
            room_id_bytes: self.rooms.room_id_bytes,
        }
    }

    /// Transfer settings from the `[transfer]` section
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            high_watermark: self.transfer.high_watermark,
            poll_interval: Duration::from_millis(self.transfer.poll_interval_ms),
            max_stall: Duration::from_secs(self.transfer.max_stall_secs),
            max_batch_bytes: self.transfer.max_batch_bytes,
        }
    }

    /// Check every section for values the relay or sender cannot run with
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        if self.rooms.ttl_secs == 0 {
            anyhow::bail!("Room TTL must be at least 1 second");
        }
        if self.rooms.sweep_interval_secs == 0 {
            anyhow::bail!("Sweep interval must be at least 1 second");
        }
        if self.rooms.max_rooms == 0 {
            anyhow::bail!("Max rooms must be at least 1");
        }
        if self.rooms.room_id_bytes < MIN_ROOM_ID_BYTES {
            anyhow::bail!(
                "Room id length must be at least {} bytes, got {}",
                MIN_ROOM_ID_BYTES,
                self.rooms.room_id_bytes
            );
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }
        if self.transfer.high_watermark < self.transfer.chunk_size {
            anyhow::bail!(
                "High watermark ({}) must be at least one chunk ({})",
                self.transfer.high_watermark,
                self.transfer.chunk_size
            );
        }

        if self.logging.level.parse::<tracing::Level>().is_err() {
            anyhow::bail!(
                "Invalid log level: {} (expected trace, debug, info, warn or error)",
                self.logging.level
            );
        }

        Ok(())
    }
}
