//! Environment and tuning configuration
//!
//! Directory locations are resolved once, when a task is created, and then
//! passed around as a plain value. Each directory follows the same order:
//! explicit override, then environment variable, then the first conventional
//! path that exists on this host, then a hard default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Read an environment variable, treating blank values as unset
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// One directory's resolution rule
#[derive(Debug, Clone)]
pub struct DirRule {
    /// Environment variable consulted after the explicit override
    pub env_key: &'static str,
    /// Conventional locations, first existing one wins
    pub conventional: Vec<PathBuf>,
    /// Used when nothing else matched
    pub default: PathBuf,
}

impl DirRule {
    fn new(env_key: &'static str, conventional: &[&str], default: &str) -> Self {
        Self {
            env_key,
            conventional: conventional.iter().map(PathBuf::from).collect(),
            default: PathBuf::from(default),
        }
    }

    /// Apply the resolution order. `lookup` stands in for the process environment.
    pub fn resolve<F>(&self, explicit: Option<&Path>, lookup: &F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(value) = lookup(self.env_key) {
            return PathBuf::from(value);
        }
        self.conventional
            .iter()
            .find(|candidate| candidate.is_dir())
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Explicit values that take precedence over everything else
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentOverrides {
    pub data_root: Option<PathBuf>,
    pub backup_root: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
    pub process_user: Option<String>,
}

/// Locations of the external executables the engine drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// Key-value command line client, used for `--pipe` imports
    pub cli: PathBuf,
    /// AOF filter for the cache engine
    pub cache_log_reader: PathBuf,
    /// Binlog reader for the SSD engine
    pub ssd_log_reader: PathBuf,
    /// Binlog reader for the multi-shard engine
    pub multishard_log_reader: PathBuf,
    /// Restores an SSD backup directory into a data directory
    pub ssd_restore: PathBuf,
    /// Verifies an SSD backup directory
    pub ssd_verify: PathBuf,
    /// Decoder for the proprietary block-compressed stream
    pub block_decompressor: PathBuf,
    /// `start-redis.sh <port>`
    pub start_script: PathBuf,
    /// `stop-redis.sh <port>`
    pub stop_script: PathBuf,
}

impl ToolPaths {
    /// Conventional executable names under one tools directory
    pub fn under(dir: &Path) -> Self {
        Self {
            cli: dir.join("redis-cli"),
            cache_log_reader: dir.join("redis-aof-filter"),
            ssd_log_reader: dir.join("tredisbinlog"),
            multishard_log_reader: dir.join("tendisplus_binlog_tool"),
            ssd_restore: dir.join("tredisrestore"),
            ssd_verify: dir.join("tredisverify"),
            block_decompressor: dir.join("tendis-unblock"),
            start_script: dir.join("start-redis.sh"),
            stop_script: dir.join("stop-redis.sh"),
        }
    }
}

/// Host-level directories and tools, resolved once per task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Parent of every instance's `{port}/data` directory
    pub data_root: PathBuf,
    /// Where backup artifacts land before staging
    pub backup_root: PathBuf,
    /// Holds destination lease files
    pub lock_dir: PathBuf,
    /// Directory of engine executables
    pub tools_dir: PathBuf,
    /// OS user the engine processes run as
    pub process_user: String,
    /// Executables derived from `tools_dir`
    pub tools: ToolPaths,
}

impl EnvironmentConfig {
    /// Resolve against the real process environment
    pub fn resolve(overrides: &EnvironmentOverrides) -> Self {
        Self::resolve_with(overrides, &env_var)
    }

    /// Resolve with a custom environment lookup
    pub fn resolve_with<F>(overrides: &EnvironmentOverrides, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_root = Self::data_root_rule().resolve(overrides.data_root.as_deref(), lookup);
        let backup_root =
            Self::backup_root_rule().resolve(overrides.backup_root.as_deref(), lookup);
        let lock_dir = Self::lock_dir_rule().resolve(overrides.lock_dir.as_deref(), lookup);
        let tools_dir = Self::tools_dir_rule().resolve(overrides.tools_dir.as_deref(), lookup);
        let process_user = overrides
            .process_user
            .clone()
            .or_else(|| lookup("PITR_PROCESS_USER"))
            .unwrap_or_else(|| "mysql".to_string());

        let config = Self {
            tools: ToolPaths::under(&tools_dir),
            data_root,
            backup_root,
            lock_dir,
            tools_dir,
            process_user,
        };

        debug!(
            data_root = %config.data_root.display(),
            backup_root = %config.backup_root.display(),
            lock_dir = %config.lock_dir.display(),
            tools_dir = %config.tools_dir.display(),
            process_user = %config.process_user,
            "Resolved environment configuration"
        );

        config
    }

    pub fn data_root_rule() -> DirRule {
        DirRule::new("PITR_DATA_ROOT", &["/data1/redis", "/data/redis"], "/data/redis")
    }

    pub fn backup_root_rule() -> DirRule {
        DirRule::new("PITR_BACKUP_ROOT", &["/data1/dbbak", "/data/dbbak"], "/data/dbbak")
    }

    pub fn lock_dir_rule() -> DirRule {
        DirRule::new("PITR_LOCK_DIR", &["/run/lock", "/var/lock"], "/tmp")
    }

    pub fn tools_dir_rule() -> DirRule {
        DirRule::new(
            "PITR_TOOLS_DIR",
            &["/usr/local/redis/bin"],
            "/usr/local/redis/bin",
        )
    }

    /// `{data_root}/{port}`
    pub fn instance_dir(&self, port: u16) -> PathBuf {
        self.data_root.join(port.to_string())
    }

    /// `{data_root}/{port}/data`
    pub fn instance_data_dir(&self, port: u16) -> PathBuf {
        self.instance_dir(port).join("data")
    }

    /// `{data_root}/{port}/redis.conf`
    pub fn instance_config_file(&self, port: u16) -> PathBuf {
        self.instance_dir(port).join("redis.conf")
    }
}

/// Timeouts, polling cadence and tolerances for one recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    /// Sleep between polling attempts
    pub poll_interval_ms: u64,

    /// Log polling progress on every Nth attempt
    pub progress_log_every: u32,

    /// Ping attempts after a load before giving up
    pub ping_max_attempts: u32,

    /// Attempts for the wipe step to converge to a single-node topology
    pub wipe_max_attempts: u32,

    /// First backoff delay of the wipe retry
    pub wipe_initial_delay_ms: u64,

    /// Attempts for a replica to see the new primary, and again to flip role
    pub topology_max_attempts: u32,

    /// Fixed delay between topology convergence checks
    pub topology_delay_ms: u64,

    /// Duration of the client traffic sniff
    pub traffic_sniff_ms: u64,

    /// Commands tolerated during the sniff, covering its own INFO calls
    pub traffic_allowance: u64,

    /// Accepted heartbeat deviation in either direction
    pub heartbeat_tolerance_secs: i64,

    /// Timeout for metadata and admin commands
    pub metadata_timeout_secs: u64,

    /// Timeout for log reader, import and verification tools
    pub tool_timeout_secs: u64,

    /// Timeout for loading a full backup
    pub full_load_timeout_secs: u64,

    /// Added to the recovery target to form the replay end bound
    pub window_epsilon_secs: i64,

    /// How long to wait for the destination lease
    pub lease_timeout_secs: u64,

    /// Upper bound on concurrent shard workers
    pub max_shard_workers: usize,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            progress_log_every: 12,
            ping_max_attempts: 120,
            wipe_max_attempts: 5,
            wipe_initial_delay_ms: 1_000,
            topology_max_attempts: 10,
            topology_delay_ms: 5_000,
            traffic_sniff_ms: 10_000,
            traffic_allowance: 3,
            heartbeat_tolerance_secs: 600,
            metadata_timeout_secs: 30,
            tool_timeout_secs: 3_600,
            full_load_timeout_secs: 6 * 3_600,
            window_epsilon_secs: 1,
            lease_timeout_secs: 30,
            max_shard_workers: num_cpus::get(),
        }
    }
}

impl RecoveryOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wipe_initial_delay(&self) -> Duration {
        Duration::from_millis(self.wipe_initial_delay_ms)
    }

    pub fn topology_delay(&self) -> Duration {
        Duration::from_millis(self.topology_delay_ms)
    }

    pub fn traffic_sniff(&self) -> Duration {
        Duration::from_millis(self.traffic_sniff_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn full_load_timeout(&self) -> Duration {
        Duration::from_secs(self.full_load_timeout_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn window_epsilon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_epsilon_secs)
    }

    pub fn heartbeat_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_tolerance_secs)
    }
}
