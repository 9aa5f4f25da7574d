//! Full backup resolution

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ResolveError;
use crate::catalog::{BackupFileDescriptor, BackupKind};

/// Where a full backup stands on local disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompressionState {
    NotStarted,
    Decompressed,
    Verified,
}

/// The resolved full backup for one source instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullBackupSet {
    /// Split parts in `sequence_index` order, a single element when unsplit
    pub parts: Vec<BackupFileDescriptor>,
    /// The backup's creation time, lower bound of incremental replay
    pub anchor_timestamp: NaiveDateTime,
    /// Decompressed directory, once staged
    pub staging_dir: Option<PathBuf>,
    pub state: DecompressionState,
}

impl FullBackupSet {
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size_bytes).sum()
    }

    pub fn is_split(&self) -> bool {
        self.parts.len() > 1
    }

    /// The part every other part shares its naming with
    pub fn head(&self) -> &BackupFileDescriptor {
        &self.parts[0]
    }

    pub fn file_names(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.file_name.clone()).collect()
    }
}

/// Pick the newest full backup created at or before `target`
///
/// Every descriptor sharing the winner's creation time is a split part of it.
/// Parts are ordered by `sequence_index`, never by name.
pub fn resolve_nearest_full(
    descriptors: &[BackupFileDescriptor],
    target: NaiveDateTime,
) -> Result<FullBackupSet, ResolveError> {
    let anchor = descriptors
        .iter()
        .filter(|d| d.kind == BackupKind::Full && d.creation_timestamp <= target)
        .map(|d| d.creation_timestamp)
        .max()
        .ok_or(ResolveError::NoFullBackupBefore { target })?;

    let mut parts: Vec<BackupFileDescriptor> = descriptors
        .iter()
        .filter(|d| d.kind == BackupKind::Full && d.creation_timestamp == anchor)
        .cloned()
        .collect();
    parts.sort_by_key(|p| p.sequence_index);

    validate_split_set(&parts)?;

    info!(
        anchor = %anchor,
        target = %target,
        parts = parts.len(),
        file = %parts[0].file_name,
        "Resolved nearest full backup"
    );

    Ok(FullBackupSet {
        parts,
        anchor_timestamp: anchor,
        staging_dir: None,
        state: DecompressionState::NotStarted,
    })
}

/// Check that split parts form one consecutive run sharing one creation time
///
/// `parts` must already be sorted by `sequence_index`.
pub fn validate_split_set(parts: &[BackupFileDescriptor]) -> Result<(), ResolveError> {
    if parts.len() <= 1 {
        return Ok(());
    }

    let mut by_index: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for part in parts {
        by_index
            .entry(part.sequence_index)
            .or_default()
            .push(part.file_name.clone());
    }
    if let Some((index, files)) = by_index.iter().find(|(_, files)| files.len() > 1) {
        return Err(ResolveError::DuplicateSplit {
            index: *index,
            files: files.clone(),
        });
    }

    let first = parts[0].sequence_index;
    let last = parts[parts.len() - 1].sequence_index;
    let missing: Vec<u64> = (first..=last).filter(|i| !by_index.contains_key(i)).collect();
    if !missing.is_empty() {
        return Err(ResolveError::SplitGap {
            first,
            last,
            missing,
        });
    }

    let expected = parts[0].creation_timestamp;
    if let Some(odd) = parts.iter().find(|p| p.creation_timestamp != expected) {
        return Err(ResolveError::SplitTimestampMismatch {
            file: odd.file_name.clone(),
            expected,
            found: odd.creation_timestamp,
        });
    }

    debug!(first, last, "Split set is contiguous");
    Ok(())
}
