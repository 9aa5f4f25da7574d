//! Engine types and their per-operation dispatch tables
//!
//! Every behavior that differs between engines is looked up here, once per
//! operation, instead of branching on the engine at each call site.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ToolPaths;

/// Unknown engine name
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown engine type '{0}'")]
pub struct UnknownEngine(pub String);

/// The engines this toolkit can recover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Redis-compatible cache, single RDB/AOF image
    Cache,
    /// Clustered SSD-backed engine, one store per instance
    Ssd,
    /// Clustered engine with several RocksDB stores per instance
    #[serde(alias = "multi_shard")]
    MultiShard,
}

/// How a staged full backup gets into the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Engine's own restore-from-backup command pointed at the staged directory
    NativeRestoreCommand,
    /// Stop, run the restore tool into the data directory, start
    RestoreToolThenStart,
    /// Stop, move the staged RDB/AOF image into place, rewrite persistence mode, start
    ReplaceImageThenStart,
}

/// What "structurally complete" means for a decompressed full backup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletenessRule {
    /// Manifest plus one metadata file per shard
    ManifestWithShardMeta,
    /// Manifest plus a clean run of the verification tool
    ManifestWithVerifyTool,
    /// A single non-empty image file
    SingleImage,
}

/// How replay positions the log reader at the start of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStart {
    /// Byte/record offset taken from the full backup's own metadata
    BinlogPosition,
    /// The full backup's anchor time, for engines whose images carry no position
    AnchorTime,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Cache, EngineKind::Ssd, EngineKind::MultiShard];

    /// Token used in backup file names
    pub fn file_label(self) -> &'static str {
        match self {
            EngineKind::Cache => "REDIS",
            EngineKind::Ssd => "TENDISSSD",
            EngineKind::MultiShard => "TENDISPLUS",
        }
    }

    /// Clustered engines own slots and carry replication topology
    pub fn is_clustered(self) -> bool {
        !matches!(self, EngineKind::Cache)
    }

    /// Whether incrementals are kept per store
    pub fn has_sharded_binlogs(self) -> bool {
        matches!(self, EngineKind::MultiShard)
    }

    /// Shard indices whose chains must be resolved and replayed
    pub fn shard_indices(self, shard_count: u32) -> Vec<i32> {
        if self.has_sharded_binlogs() {
            (0..shard_count as i32).collect()
        } else {
            vec![-1]
        }
    }

    pub fn load_strategy(self) -> LoadStrategy {
        match self {
            EngineKind::Cache => LoadStrategy::ReplaceImageThenStart,
            EngineKind::Ssd => LoadStrategy::RestoreToolThenStart,
            EngineKind::MultiShard => LoadStrategy::NativeRestoreCommand,
        }
    }

    pub fn completeness_rule(self) -> CompletenessRule {
        match self {
            EngineKind::Cache => CompletenessRule::SingleImage,
            EngineKind::Ssd => CompletenessRule::ManifestWithVerifyTool,
            EngineKind::MultiShard => CompletenessRule::ManifestWithShardMeta,
        }
    }

    pub fn replay_start(self) -> ReplayStart {
        match self {
            EngineKind::Cache => ReplayStart::AnchorTime,
            EngineKind::Ssd | EngineKind::MultiShard => ReplayStart::BinlogPosition,
        }
    }

    /// The log reader that filters this engine's incrementals
    pub fn log_reader(self, tools: &ToolPaths) -> &Path {
        match self {
            EngineKind::Cache => &tools.cache_log_reader,
            EngineKind::Ssd => &tools.ssd_log_reader,
            EngineKind::MultiShard => &tools.multishard_log_reader,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Cache => "cache",
            EngineKind::Ssd => "ssd",
            EngineKind::MultiShard => "multishard",
        };
        f.write_str(name)
    }
}

impl FromStr for EngineKind {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cache" | "redis" | "tendiscache" => Ok(EngineKind::Cache),
            "ssd" | "tendisssd" => Ok(EngineKind::Ssd),
            "multishard" | "multi_shard" | "tendisplus" => Ok(EngineKind::MultiShard),
            _ => Err(UnknownEngine(s.to_string())),
        }
    }
}
