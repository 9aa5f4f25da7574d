//! Backup catalog records and their parsed form
//!
//! The catalog itself is an external service. This module only defines the
//! record shape it returns, a trait to list records for a source instance, and
//! the conversion from raw records into [`BackupFileDescriptor`]s.

pub mod grammar;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine_kind::EngineKind;
use crate::node::NodeAddr;

pub use grammar::{parse, ParseError, ParsedName};

/// Format of `RawCatalogRecord::file_last_mtime`
pub const CATALOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised by a catalog source
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog has no listing for {source_addr} yet: {reason}")]
    Unavailable { source_addr: String, reason: String },

    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog listing is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Full backup or incremental binlog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

/// Container or compression wrapping of a backup file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Plain,
    Tar,
    TarGz,
    Zstd,
    Gzip,
    /// Proprietary block-compressed stream, decoded by an external tool
    Block,
}

impl ContainerFormat {
    const SUFFIXES: [(&'static str, ContainerFormat); 5] = [
        (".tar.gz", ContainerFormat::TarGz),
        (".tar", ContainerFormat::Tar),
        (".zst", ContainerFormat::Zstd),
        (".gz", ContainerFormat::Gzip),
        (".blz", ContainerFormat::Block),
    ];

    /// Detect the format from a file name, returning it with the suffix removed
    pub fn from_file_name(name: &str) -> (Self, &str) {
        for (suffix, format) in Self::SUFFIXES {
            if let Some(stem) = name.strip_suffix(suffix) {
                return (format, stem);
            }
        }
        (ContainerFormat::Plain, name)
    }

    /// Tar containers unpack to a directory, everything else to one file
    pub fn is_archive(self) -> bool {
        matches!(self, ContainerFormat::Tar | ContainerFormat::TarGz)
    }

    pub fn needs_decoding(self) -> bool {
        !matches!(self, ContainerFormat::Plain)
    }
}

/// One record exactly as the catalog returns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCatalogRecord {
    pub file_name: String,
    pub task_id: i64,
    pub size: i64,
    pub source_ip: String,
    /// Upload completion time, `YYYY-MM-DD HH:MM:SS`
    pub file_last_mtime: String,
}

/// A catalog record after validation and file name parsing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileDescriptor {
    pub file_name: String,
    pub upload_task_id: i64,
    pub size_bytes: u64,
    pub source_ip: String,
    pub source_port: u16,
    /// Catalog's last-modified time, i.e. when the upload completed
    pub last_modified_at: NaiveDateTime,
    pub engine: EngineKind,
    pub kind: BackupKind,
    /// Store index, -1 when not sharded
    pub shard_index: i32,
    /// Split index for full backups, binlog index for incrementals
    pub sequence_index: u64,
    /// Parsed from the file name
    pub creation_timestamp: NaiveDateTime,
    pub format: ContainerFormat,
    /// File name without split or container suffixes
    pub inner_name: String,
}

impl BackupFileDescriptor {
    /// Validate a raw record and parse its file name with `engine`'s grammars
    pub fn from_record(record: &RawCatalogRecord, engine: EngineKind) -> Result<Self, ParseError> {
        let invalid = |reason: String| ParseError::InvalidRecord {
            file: record.file_name.clone(),
            reason,
        };

        if record.task_id < 0 {
            return Err(invalid(format!("negative upload task id {}", record.task_id)));
        }
        if record.size < 0 {
            return Err(invalid(format!("negative size {}", record.size)));
        }
        let last_modified_at =
            NaiveDateTime::parse_from_str(record.file_last_mtime.trim(), CATALOG_TIME_FORMAT)
                .map_err(|_| ParseError::BadTimestamp {
                    file: record.file_name.clone(),
                    raw: record.file_last_mtime.clone(),
                })?;

        let parsed = grammar::parse(&record.file_name, engine)?;
        if parsed.source_ip != record.source_ip {
            return Err(invalid(format!(
                "file name carries ip {} but the record says {}",
                parsed.source_ip, record.source_ip
            )));
        }

        Ok(Self {
            file_name: record.file_name.clone(),
            upload_task_id: record.task_id,
            size_bytes: record.size as u64,
            source_ip: parsed.source_ip,
            source_port: parsed.source_port,
            last_modified_at,
            engine,
            kind: parsed.kind,
            shard_index: parsed.shard_index,
            sequence_index: parsed.sequence_index,
            creation_timestamp: parsed.creation_timestamp,
            format: parsed.format,
            inner_name: parsed.stem,
        })
    }

    /// Upload-completed time, used for the tail of a binlog window
    pub fn upload_completed_at(&self) -> NaiveDateTime {
        self.last_modified_at
    }

    pub fn source(&self) -> NodeAddr {
        NodeAddr::new(self.source_ip.clone(), self.source_port)
    }
}

/// Parse a listing for one source, keeping only records of the requested kind
///
/// Records that fail to parse are dropped with a warning. For incrementals a
/// dropped record shows up later as an explicit gap in the chain.
pub fn descriptors_from_listing(
    records: &[RawCatalogRecord],
    engine: EngineKind,
    source: &NodeAddr,
    kind: BackupKind,
) -> Vec<BackupFileDescriptor> {
    let mut descriptors = Vec::with_capacity(records.len());

    for record in records {
        match BackupFileDescriptor::from_record(record, engine) {
            Ok(descriptor) => {
                if descriptor.source_port != source.port || descriptor.kind != kind {
                    debug!(file = %descriptor.file_name, "Skipping record for another port or kind");
                    continue;
                }
                descriptors.push(descriptor);
            }
            Err(e) => {
                warn!(file = %record.file_name, source = %source, error = %e, "Dropping unparseable catalog record");
            }
        }
    }

    descriptors
}

/// Lists catalog records for a source instance
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list(
        &self,
        source: &NodeAddr,
        kind: BackupKind,
    ) -> Result<Vec<RawCatalogRecord>, CatalogError>;
}

/// In-memory catalog, filled up front
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    records: HashMap<(String, BackupKind), Vec<RawCatalogRecord>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records are keyed by source IP, the catalog has no notion of ports
    pub fn with_records(
        mut self,
        source_ip: impl Into<String>,
        kind: BackupKind,
        records: Vec<RawCatalogRecord>,
    ) -> Self {
        self.records
            .entry((source_ip.into(), kind))
            .or_default()
            .extend(records);
        self
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn list(
        &self,
        source: &NodeAddr,
        kind: BackupKind,
    ) -> Result<Vec<RawCatalogRecord>, CatalogError> {
        Ok(self
            .records
            .get(&(source.ip.clone(), kind))
            .cloned()
            .unwrap_or_default())
    }
}

/// Listing file shape: `{"full": [...], "incremental": [...]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogListing {
    #[serde(default)]
    pub full: Vec<RawCatalogRecord>,
    #[serde(default)]
    pub incremental: Vec<RawCatalogRecord>,
}

/// Catalog backed by one JSON listing per source IP in a directory
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    dir: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `{dir}/{ip}.json`
    pub fn listing_path(&self, source: &NodeAddr) -> PathBuf {
        self.dir.join(format!("{}.json", source.ip))
    }
}

#[async_trait]
impl CatalogSource for JsonFileCatalog {
    async fn list(
        &self,
        source: &NodeAddr,
        kind: BackupKind,
    ) -> Result<Vec<RawCatalogRecord>, CatalogError> {
        let path = self.listing_path(source);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::Unavailable {
                    source_addr: source.to_string(),
                    reason: format!("{} does not exist", path.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let listing: CatalogListing = serde_json::from_slice(&bytes)?;
        Ok(match kind {
            BackupKind::Full => listing.full,
            BackupKind::Incremental => listing.incremental,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(file_name: &str, task_id: i64, size: i64) -> RawCatalogRecord {
        RawCatalogRecord {
            file_name: file_name.to_string(),
            task_id,
            size,
            source_ip: "10.0.0.1".to_string(),
            file_last_mtime: "2024-01-10 05:20:00".to_string(),
        }
    }

    #[test]
    fn test_container_format_detection() {
        assert_eq!(
            ContainerFormat::from_file_name("a.rdb.tar.gz"),
            (ContainerFormat::TarGz, "a.rdb")
        );
        assert_eq!(ContainerFormat::from_file_name("a.log.gz"), (ContainerFormat::Gzip, "a.log"));
        assert_eq!(ContainerFormat::from_file_name("a.log"), (ContainerFormat::Plain, "a.log"));
        assert!(ContainerFormat::Tar.is_archive());
        assert!(!ContainerFormat::Block.is_archive());
    }

    #[test]
    fn test_negative_fields_are_invalid() {
        let name = "100-TENDISPLUS-BINLOG-10.0.0.1-30000-0-0000100-20240110045950.log";
        let err = BackupFileDescriptor::from_record(&record(name, -1, 10), EngineKind::MultiShard)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidRecord { .. }));
        let err = BackupFileDescriptor::from_record(&record(name, 1, -10), EngineKind::MultiShard)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidRecord { .. }));
    }

    #[test]
    fn test_listing_filters_port_and_kind() {
        let records = vec![
            record("100-TENDISPLUS-BINLOG-10.0.0.1-30000-0-0000100-20240110045950.log", 1, 10),
            record("100-TENDISPLUS-BINLOG-10.0.0.1-30001-0-0000100-20240110045950.log", 1, 10),
            record("100-TENDISPLUS-FULL-slave-10.0.0.1-30000-20240110-050000.tar", 1, 10),
            record("garbage.log", 1, 10),
        ];
        let source = NodeAddr::new("10.0.0.1", 30000);
        let found = descriptors_from_listing(
            &records,
            EngineKind::MultiShard,
            &source,
            BackupKind::Incremental,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sequence_index, 100);
        assert_eq!(found[0].upload_completed_at().to_string(), "2024-01-10 05:20:00");
    }

    #[tokio::test]
    async fn test_json_file_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let listing = CatalogListing {
            full: vec![record("100-TENDISPLUS-FULL-slave-10.0.0.1-30000-20240110-050000.tar", 1, 10)],
            incremental: vec![],
        };
        std::fs::write(
            dir.path().join("10.0.0.1.json"),
            serde_json::to_vec(&listing).unwrap(),
        )
        .unwrap();

        let catalog = JsonFileCatalog::new(dir.path());
        let source = NodeAddr::new("10.0.0.1", 30000);
        assert_eq!(catalog.list(&source, BackupKind::Full).await.unwrap().len(), 1);
        assert!(catalog.list(&source, BackupKind::Incremental).await.unwrap().is_empty());

        let missing = NodeAddr::new("10.0.0.9", 30000);
        assert!(matches!(
            catalog.list(&missing, BackupKind::Full).await,
            Err(CatalogError::Unavailable { .. })
        ));
    }
}
