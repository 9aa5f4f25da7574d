//! Incremental binlog chain resolution
//!
//! A chain must bound the window on both ends: its first binlog is the one in
//! force at the window start, its last one was uploaded after the window end.
//! Anything short of an exact, gap-free run is rejected. There is no partial
//! acceptance here.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{shard_label, ResolveError};
use crate::catalog::{BackupFileDescriptor, BackupKind};

/// Which end of a chain a boundary check concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainEnd {
    Head,
    Tail,
}

impl fmt::Display for ChainEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainEnd::Head => f.write_str("head"),
            ChainEnd::Tail => f.write_str("tail"),
        }
    }
}

/// Timestamps a chain must cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainWindow {
    /// Full backup anchor time
    pub start: NaiveDateTime,
    /// Recovery target plus epsilon
    pub end: NaiveDateTime,
}

impl ChainWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for ChainWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// The resolved binlog sequence for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalChain {
    /// -1 for engines with a single store
    pub shard_index: i32,
    /// Binlogs in strictly increasing `sequence_index` order
    pub members: Vec<BackupFileDescriptor>,
    /// Offset the first binlog is replayed from, taken from the full backup
    pub chain_start_position: u64,
    pub window: ChainWindow,
}

impl IncrementalChain {
    pub fn with_start_position(mut self, position: u64) -> Self {
        self.chain_start_position = position;
        self
    }

    pub fn first_index(&self) -> Option<u64> {
        self.members.first().map(|m| m.sequence_index)
    }

    pub fn last_index(&self) -> Option<u64> {
        self.members.last().map(|m| m.sequence_index)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.file_name.clone()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.members.iter().map(|m| m.size_bytes).sum()
    }
}

/// Resolve the minimal binlog chain of one shard covering `window`
#[instrument(skip(descriptors), fields(shard = %shard_label(shard_index), window = %window))]
pub fn resolve_chain(
    descriptors: &[BackupFileDescriptor],
    shard_index: i32,
    window: ChainWindow,
) -> Result<IncrementalChain, ResolveError> {
    let shard: Vec<&BackupFileDescriptor> = descriptors
        .iter()
        .filter(|d| d.kind == BackupKind::Incremental && d.shard_index == shard_index)
        .collect();

    // Several binlogs can share a second under heavy writes; the lowest index
    // is the true predecessor of the window start.
    let before = shard
        .iter()
        .filter(|d| d.creation_timestamp <= window.start)
        .max_by(|a, b| {
            a.creation_timestamp
                .cmp(&b.creation_timestamp)
                .then(b.sequence_index.cmp(&a.sequence_index))
        })
        .ok_or(ResolveError::NoBinlogBefore {
            shard: shard_index,
            window_start: window.start,
        })?;

    let after = shard
        .iter()
        .filter(|d| d.upload_completed_at() >= window.end)
        .min_by(|a, b| {
            a.upload_completed_at()
                .cmp(&b.upload_completed_at())
                .then(b.sequence_index.cmp(&a.sequence_index))
        })
        .ok_or(ResolveError::NoBinlogAfter {
            shard: shard_index,
            window_start: window.start,
            window_end: window.end,
        })?;

    debug!(
        before = %before.file_name,
        after = %after.file_name,
        "Found window bounding binlogs"
    );

    let first_day = before.creation_timestamp.date();
    let last_day = after
        .creation_timestamp
        .date()
        .max(after.upload_completed_at().date());
    let days = day_span(first_day, last_day);

    let mut members: Vec<BackupFileDescriptor> = shard
        .iter()
        .filter(|d| days.contains(&d.creation_timestamp.date()))
        .filter(|d| {
            d.creation_timestamp >= before.creation_timestamp
                && d.creation_timestamp <= after.creation_timestamp
        })
        .map(|d| (*d).clone())
        .collect();
    members.sort_by_key(|m| m.sequence_index);

    validate_chain(&members, shard_index, window)?;

    info!(
        first = members[0].sequence_index,
        last = members[members.len() - 1].sequence_index,
        files = members.len(),
        "Resolved binlog chain"
    );

    Ok(IncrementalChain {
        shard_index,
        members,
        chain_start_position: 0,
        window,
    })
}

fn day_span(first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    first.iter_days().take_while(|d| *d <= last).collect()
}

/// Check a candidate chain against every continuity and boundary rule
///
/// Checks run in a fixed order: length, duplicates, gaps, head, tail.
pub fn validate_chain(
    members: &[BackupFileDescriptor],
    shard_index: i32,
    window: ChainWindow,
) -> Result<(), ResolveError> {
    if members.len() < 2 {
        return Err(ResolveError::ChainTooShort {
            shard: shard_index,
            len: members.len(),
        });
    }

    let mut sorted: Vec<&BackupFileDescriptor> = members.iter().collect();
    sorted.sort_by_key(|m| m.sequence_index);

    let mut by_index: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for member in &sorted {
        by_index
            .entry(member.sequence_index)
            .or_default()
            .push(member.file_name.clone());
    }
    if let Some((index, files)) = by_index.iter().find(|(_, files)| files.len() > 1) {
        return Err(ResolveError::DuplicateSequence {
            shard: shard_index,
            index: *index,
            files: files.clone(),
        });
    }

    let first = sorted[0];
    let last = sorted[sorted.len() - 1];
    let missing: Vec<u64> = (first.sequence_index..=last.sequence_index)
        .filter(|i| !by_index.contains_key(i))
        .collect();
    if !missing.is_empty() {
        return Err(ResolveError::SequenceGap {
            shard: shard_index,
            first: first.sequence_index,
            last: last.sequence_index,
            missing,
        });
    }

    check_head(&sorted, shard_index, window)?;
    check_tail(&sorted, shard_index, window)?;
    Ok(())
}

fn check_head(
    sorted: &[&BackupFileDescriptor],
    shard_index: i32,
    window: ChainWindow,
) -> Result<(), ResolveError> {
    let first = sorted[0];
    if first.creation_timestamp > window.start {
        let by = (first.creation_timestamp - window.start).num_seconds();
        return Err(ResolveError::Boundary {
            shard: shard_index,
            end: ChainEnd::Head,
            file: first.file_name.clone(),
            detail: format!(
                "first binlog created at {} follows window start {} by {}s",
                first.creation_timestamp, window.start, by
            ),
        });
    }

    let next = sorted
        .iter()
        .skip(1)
        .find(|m| m.creation_timestamp != first.creation_timestamp);
    if let Some(next) = next {
        if next.creation_timestamp <= window.start {
            let by = (window.start - next.creation_timestamp).num_seconds();
            return Err(ResolveError::Boundary {
                shard: shard_index,
                end: ChainEnd::Head,
                file: next.file_name.clone(),
                detail: format!(
                    "binlog created at {} is still at or before window start {} (by {}s), chain starts too early",
                    next.creation_timestamp, window.start, by
                ),
            });
        }
    }
    Ok(())
}

fn check_tail(
    sorted: &[&BackupFileDescriptor],
    shard_index: i32,
    window: ChainWindow,
) -> Result<(), ResolveError> {
    let last = sorted[sorted.len() - 1];
    if last.upload_completed_at() < window.end {
        let by = (window.end - last.upload_completed_at()).num_seconds();
        return Err(ResolveError::Boundary {
            shard: shard_index,
            end: ChainEnd::Tail,
            file: last.file_name.clone(),
            detail: format!(
                "last binlog precedes window end {} by {}s: {} uploaded at {}",
                window.end,
                by,
                last.file_name,
                last.upload_completed_at()
            ),
        });
    }

    let previous = sorted
        .iter()
        .rev()
        .skip(1)
        .find(|m| m.creation_timestamp != last.creation_timestamp);
    if let Some(previous) = previous {
        if previous.creation_timestamp >= window.end {
            let by = (previous.creation_timestamp - window.end).num_seconds();
            return Err(ResolveError::Boundary {
                shard: shard_index,
                end: ChainEnd::Tail,
                file: previous.file_name.clone(),
                detail: format!(
                    "binlog created at {} is already past window end {} (by {}s), chain ends too late",
                    previous.creation_timestamp, window.end, by
                ),
            });
        }
    }
    Ok(())
}
