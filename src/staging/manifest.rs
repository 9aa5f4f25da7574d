//! Metadata files written into a full backup by the backup-taking side

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StagingError;
use crate::client::topology::{parse_slot_ranges, SlotRange};

pub const MANIFEST_FILE: &str = "backup.manifest";

/// `backup_meta.{i}`
pub fn shard_meta_file(shard_index: u32) -> String {
    format!("backup_meta.{shard_index}")
}

/// Contents of `backup.manifest`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Number of stores in the backup, one for single-store engines
    pub kvstore_count: u32,
    /// Slots the source owned, in `CLUSTER NODES` notation (`0-5460 5462`)
    #[serde(default)]
    pub slots: String,
    /// Per-store binlog positions, when the engine records them here
    #[serde(default)]
    pub binlog_positions: Option<Vec<u64>>,
}

impl BackupManifest {
    pub fn slot_ranges(&self) -> Result<Vec<SlotRange>, String> {
        parse_slot_ranges(&self.slots)
    }
}

/// Contents of `backup_meta.{i}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardBackupMeta {
    pub binlogpos: u64,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: PathBuf) -> Result<T, StagingError> {
    let bytes = std::fs::read(&path).map_err(|e| StagingError::Manifest {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| StagingError::Manifest {
        path,
        reason: e.to_string(),
    })
}

pub fn read_manifest(backup_dir: &Path) -> Result<BackupManifest, StagingError> {
    read_json(backup_dir.join(MANIFEST_FILE))
}

pub fn read_shard_meta(backup_dir: &Path, shard_index: u32) -> Result<ShardBackupMeta, StagingError> {
    read_json(backup_dir.join(shard_meta_file(shard_index)))
}

/// The directory holding `backup.manifest`: `dir` itself or one level below
pub fn locate_backup_root(dir: &Path) -> Option<PathBuf> {
    if dir.join(MANIFEST_FILE).is_file() {
        return Some(dir.to_path_buf());
    }
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .find(|p| p.join(MANIFEST_FILE).is_file())
}

/// Replay start offset for one shard
///
/// Per-store metadata wins over the manifest's position list. Single-store
/// engines (`shard_index < 0`) use the first manifest position.
pub fn chain_start_position(
    backup_dir: &Path,
    manifest: &BackupManifest,
    shard_index: i32,
) -> Result<u64, StagingError> {
    if shard_index >= 0 {
        let meta_path = backup_dir.join(shard_meta_file(shard_index as u32));
        if meta_path.is_file() {
            return Ok(read_shard_meta(backup_dir, shard_index as u32)?.binlogpos);
        }
    }
    let slot = shard_index.max(0) as usize;
    manifest
        .binlog_positions
        .as_ref()
        .and_then(|positions| positions.get(slot).copied())
        .ok_or_else(|| StagingError::Manifest {
            path: backup_dir.join(MANIFEST_FILE),
            reason: format!("no binlog position recorded for store {slot}"),
        })
}
