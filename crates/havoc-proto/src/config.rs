//! Runtime configuration, loaded from a YAML file.
//!
//! Plugin sections (`snapshot`, `restart`) keep their bodies as raw YAML
//! values; each plugin re-deserialises its own config with
//! [`plugin_config`], so new plugin types need no changes here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for a chaos run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Log every worker action and client request.
    pub verbose: bool,

    /// Port the control-bus WebSocket server listens on.
    pub ws_port: u16,

    /// The intercepting proxy sitting between homeservers.
    pub mitm_proxy: MitmProxyConfig,

    /// The homeservers under test.
    pub homeservers: Vec<HomeserverConfig>,

    /// Workload and fault schedule.
    pub test: TestConfig,
}

/// Where to reach the intercepting proxy, and where it can reach us back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmProxyConfig {
    /// Proxy URL as seen from this process, e.g. `http://localhost:8080`.
    pub container_url: String,

    /// Hostname the proxy can use to reach this process's callback server.
    pub host_domain: String,
}

/// One homeserver: where to reach it and how to restart/sample it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeserverConfig {
    /// Client API base URL, e.g. `https://hs1.localhost:443`.
    #[serde(rename = "url")]
    pub base_url: String,

    /// Server name / federation domain, e.g. `hs1`.
    pub domain: String,

    /// Resource sampling plugin. Empty `type` disables sampling.
    pub snapshot: PluginConfig,

    /// Restart plugin. Empty `type` disables restarts for this server.
    pub restart: PluginConfig,
}

/// A plugin selection: a registry type tag plus plugin-specific config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub config: serde_yaml::Value,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            config: serde_yaml::Value::Null,
        }
    }
}

/// Workload shape and fault schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Seed for the deterministic workload generator.
    pub seed: i64,

    /// Number of test users (and therefore workers).
    pub num_users: usize,

    /// Number of rooms, created round-robin across homeservers.
    pub num_rooms: usize,

    /// User actions generated per tick.
    pub ops_per_tick: usize,

    /// Room version passed to createRoom. Empty uses the server default.
    pub room_version: String,

    /// Percent probability that a joined user leaves instead of sending.
    pub send_to_leave_probability: u64,

    /// Parallelism for room creation and user registration during prepare.
    pub init_concurrency: usize,

    /// Netsplit schedule.
    pub netsplits: NetsplitSchedule,

    /// Restart schedule.
    pub restarts: RestartSchedule,

    /// Convergence check schedule and timing.
    pub convergence: ConvergenceSchedule,

    /// Path of the sqlite file resource snapshots are appended to.
    pub snapshot_db: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            num_users: 0,
            num_rooms: 0,
            ops_per_tick: 0,
            room_version: String::new(),
            send_to_leave_probability: 10,
            init_concurrency: 4,
            netsplits: NetsplitSchedule::default(),
            restarts: RestartSchedule::default(),
            convergence: ConvergenceSchedule::default(),
            snapshot_db: "havoc-snapshots.db".to_string(),
        }
    }
}

/// Periodic netsplits: `free_secs` of healthy federation, then
/// `duration_secs` of partition, repeating. Zero duration disables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetsplitSchedule {
    pub duration_secs: u64,
    pub free_secs: u64,
}

/// Periodic restarts cycling through `round_robin` domains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSchedule {
    pub interval_secs: u64,
    pub round_robin: Vec<String>,
}

/// Convergence checks: how often to request one and how long to let
/// federation settle before diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceSchedule {
    pub enabled: bool,
    pub interval_secs: u64,
    pub buffer_secs: u64,
    pub sync_timeout_secs: u64,
    /// How membership is read back: `members` (per-room /members) or
    /// `sync` (one full-state /sync).
    pub mechanism: String,
}

impl Default for ConvergenceSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 0,
            buffer_secs: 5,
            sync_timeout_secs: 30,
            mechanism: "members".to_string(),
        }
    }
}

impl ChaosConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Re-deserialise a raw plugin config value into the plugin's typed config.
pub fn plugin_config<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<T, ConfigError> {
    serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}
