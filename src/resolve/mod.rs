//! Selection of the artifacts a point-in-time recovery needs
//!
//! [`full`] picks the nearest preceding full backup and checks its split set.
//! [`chain`] picks, per shard, the binlog window that bridges that backup to
//! the recovery target. Both are pure functions over parsed catalog listings.

pub mod chain;
pub mod full;

use chrono::NaiveDateTime;
use thiserror::Error;

pub use chain::{resolve_chain, validate_chain, ChainEnd, ChainWindow, IncrementalChain};
pub use full::{resolve_nearest_full, validate_split_set, DecompressionState, FullBackupSet};

/// Render a shard index the way log lines and errors show it
pub fn shard_label(shard_index: i32) -> String {
    if shard_index < 0 {
        "all".to_string()
    } else {
        shard_index.to_string()
    }
}

/// Errors raised while resolving full backups and binlog chains
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("no full backup before requested time {target}")]
    NoFullBackupBefore { target: NaiveDateTime },

    #[error("full backup split index {index} appears more than once: {files:?}")]
    DuplicateSplit { index: u64, files: Vec<String> },

    #[error("full backup split set {first}..={last} is missing indices {missing:?}")]
    SplitGap { first: u64, last: u64, missing: Vec<u64> },

    #[error("full backup split {file} was created at {found}, expected {expected}")]
    SplitTimestampMismatch {
        file: String,
        expected: NaiveDateTime,
        found: NaiveDateTime,
    },

    #[error("shard {}: no binlog found before window start {window_start}", shard_label(*.shard))]
    NoBinlogBefore { shard: i32, window_start: NaiveDateTime },

    #[error("shard {}: no binlog found after window end {window_end} (window starts {window_start})", shard_label(*.shard))]
    NoBinlogAfter {
        shard: i32,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
    },

    #[error("shard {}: chain of {len} binlog(s) cannot bound both ends of the window", shard_label(*.shard))]
    ChainTooShort { shard: i32, len: usize },

    #[error("shard {}: binlog index {index} appears more than once: {files:?}", shard_label(*.shard))]
    DuplicateSequence {
        shard: i32,
        index: u64,
        files: Vec<String>,
    },

    #[error("shard {}: binlog chain {first}..={last} is missing indices {missing:?}", shard_label(*.shard))]
    SequenceGap {
        shard: i32,
        first: u64,
        last: u64,
        missing: Vec<u64>,
    },

    #[error("shard {}: {end} of chain violated by {file}: {detail}", shard_label(*.shard))]
    Boundary {
        shard: i32,
        end: ChainEnd,
        file: String,
        detail: String,
    },
}

impl ResolveError {
    /// Missing artifacts may appear later; everything else means the catalog
    /// cannot produce a consistent image.
    pub fn is_not_yet_available(&self) -> bool {
        matches!(
            self,
            ResolveError::NoFullBackupBefore { .. }
                | ResolveError::NoBinlogBefore { .. }
                | ResolveError::NoBinlogAfter { .. }
        )
    }
}
