//! Configuration options.
//!
//! The node reads one TOML file for runtime options: queue geometry, the
//! server socket, peer-link tuning. The two line-based rule files (access
//! control, pattern-action) are separate and have their own parsers. The
//! queue path, pattern-action file, and log destination may also be
//! overridden through the `STRATUS_QUEUE`, `STRATUS_PQACT`, and
//! `STRATUS_LOG` environment variables.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::{DEFAULT_CAPACITY, DEFAULT_SLOTS};

/// Environment override for the queue path.
pub const ENV_QUEUE: &str = "STRATUS_QUEUE";
/// Environment override for the pattern-action file.
pub const ENV_PQACT: &str = "STRATUS_PQACT";
/// Environment override for the log destination.
pub const ENV_LOG: &str = "STRATUS_LOG";

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let text = fs::read_to_string(path.as_ref())
        .with_context(|| format!("cannot read config {}", path.as_ref().display()))?;
    let config: RuntimeConfig = toml::from_str(&text)
        .with_context(|| format!("invalid config {}", path.as_ref().display()))?;
    Ok(config)
}

/// A default configuration for demonstration and tests.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Hostname stamped as the origin on locally inserted products.
    /// Defaults to the system hostname.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Path to the access-control file.
    #[serde(default = "default_access_file")]
    pub access_file: PathBuf,

    /// Product-queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Peer server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Peer link tuning.
    #[serde(default)]
    pub peer: PeerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            hostname: default_hostname(),
            access_file: default_access_file(),
            queue: QueueConfig::default(),
            server: ServerConfig::default(),
            peer: PeerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// The queue path after applying the environment override.
    pub fn queue_path(&self) -> PathBuf {
        match std::env::var_os(ENV_QUEUE) {
            Some(path) => PathBuf::from(path),
            None => self.queue.path.clone(),
        }
    }
}

fn default_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_access_file() -> PathBuf {
    PathBuf::from("etc/stratus.conf")
}

/* --------------------------------------------------------------------------------- */

/// Product-queue settings.
///
/// ## Example
/// ```toml
/// [queue]
///     path = "/var/queues/stratus.pq"
///     slots = 8192
///     capacity = 1_073_741_824
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct QueueConfig {
    /// Queue file path. Defaults to `var/queues/stratus.pq`.
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,

    /// Slot count: the maximum number of resident products. Defaults to
    /// `4096`.
    #[serde(default = "default_queue_slots")]
    pub slots: usize,

    /// Data-region capacity in bytes. Defaults to 500 MiB.
    #[serde(default = "default_queue_capacity")]
    pub capacity: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            path: default_queue_path(),
            slots: default_queue_slots(),
            capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("var/queues/stratus.pq")
}

fn default_queue_slots() -> usize {
    DEFAULT_SLOTS
}

fn default_queue_capacity() -> u64 {
    DEFAULT_CAPACITY
}

/* --------------------------------------------------------------------------------- */

/// Peer server settings.
///
/// ## Example
/// ```toml
/// [server]
///     bind = "0.0.0.0:388"
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for downstream peers. Defaults to `0.0.0.0:388`.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:388".to_string()
}

/* --------------------------------------------------------------------------------- */

/// Peer link tuning.
///
/// ## Example
/// ```toml
/// [peer]
///     suspend_secs = 30
///     connect_timeout_ms = 10_000
///     backoff_base_ms = 1_000
///     backoff_cap_ms = 60_000
///     blkdata_chunk = 16_384
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PeerConfig {
    /// How long a sender sleeps on an empty queue before re-polling, in
    /// seconds. Defaults to `30`.
    #[serde(default = "default_suspend_secs")]
    pub suspend_secs: u64,

    /// Connect timeout for outgoing links, in milliseconds. Defaults to
    /// `10_000`.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay, in milliseconds. Defaults to `1_000`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect delay cap, in milliseconds. Defaults to `60_000`.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Block size for alternate-mode payload transfer. Defaults to
    /// `16_384`.
    #[serde(default = "default_blkdata_chunk")]
    pub blkdata_chunk: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            suspend_secs: default_suspend_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            blkdata_chunk: default_blkdata_chunk(),
        }
    }
}

fn default_suspend_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_blkdata_chunk() -> usize {
    16_384
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_sections() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.queue.slots, DEFAULT_SLOTS);
        assert_eq!(config.server.bind, "0.0.0.0:388");
        assert_eq!(config.peer.suspend_secs, 30);
    }

    #[test]
    fn config_partial_override() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [queue]
            path = "/tmp/test.pq"
            capacity = 1048576

            [peer]
            backoff_cap_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.path, PathBuf::from("/tmp/test.pq"));
        assert_eq!(config.queue.capacity, 1_048_576);
        assert_eq!(config.queue.slots, DEFAULT_SLOTS);
        assert_eq!(config.peer.backoff_cap_ms, 5000);
        assert_eq!(config.peer.backoff_base_ms, 1000);
    }
}
