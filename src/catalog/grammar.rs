//! Backup file name grammars
//!
//! Each engine names its full backups and incrementals differently. Parsing
//! is strict: a name that matches none of the engine's grammars is an error,
//! never a best guess.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use thiserror::Error;

use super::{BackupKind, ContainerFormat};
use crate::engine_kind::EngineKind;

/// Errors raised while parsing a backup file name
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("'{file}' matches no {engine} backup file grammar")]
    UnknownGrammar { file: String, engine: EngineKind },

    #[error("'{file}' carries an invalid timestamp '{raw}'")]
    BadTimestamp { file: String, raw: String },

    #[error("'{file}' has an out of range {field}")]
    BadNumber { file: String, field: &'static str },

    #[error("catalog record '{file}' is invalid: {reason}")]
    InvalidRecord { file: String, reason: String },
}

/// Structured fields extracted from one file name
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    pub kind: BackupKind,
    pub source_ip: String,
    pub source_port: u16,
    /// Store index, -1 when the engine keeps a single store
    pub shard_index: i32,
    /// Split number for full backups, binlog number for incrementals
    pub sequence_index: u64,
    pub creation_timestamp: NaiveDateTime,
    pub format: ContainerFormat,
    /// Name with split and container suffixes removed
    pub stem: String,
}

const IP: &str = r"(?P<ip>\d{1,3}(?:\.\d{1,3}){3})";

lazy_static! {
    static ref CACHE_FULL: Regex = Regex::new(&format!(
        r"^(?P<biz>\d+)-REDIS-FULL-(?P<role>[a-z]+)-{IP}-(?P<port>\d+)-(?P<date>\d{{8}})-(?P<time>\d{{6}})\.(?P<ext>(?:rdb|aof)(?:\.zst|\.tar\.gz)?)$"
    ))
    .expect("cache full grammar");

    static ref CACHE_INCR: Regex = Regex::new(&format!(
        r"^(?P<biz>\d+)-REDIS-BINLOG-{IP}-(?P<port>\d+)-(?P<seq>\d+)-(?P<ts>\d{{14}})\.(?P<ext>aof(?:\.zst|\.gz)?)$"
    ))
    .expect("cache binlog grammar");

    static ref SSD_FULL: Regex = Regex::new(&format!(
        r"^(?P<biz>\d+)-TENDISSSD-FULL-(?P<role>[a-z]+)-{IP}-(?P<port>\d+)-(?P<date>\d{{8}})-(?P<time>\d{{6}})\.(?P<ext>tar)(?:\.split\.(?P<split>\d+))?$"
    ))
    .expect("ssd full grammar");

    static ref SSD_INCR: Regex = Regex::new(&format!(
        r"^binlog-{IP}-(?P<port>\d+)-(?P<seq>\d+)-(?P<ts>\d{{14}})\.(?P<ext>log(?:\.zst|\.blz)?)$"
    ))
    .expect("ssd binlog grammar");

    static ref MULTI_FULL: Regex = Regex::new(&format!(
        r"^(?P<biz>\d+)-TENDISPLUS-FULL-(?P<role>[a-z]+)-{IP}-(?P<port>\d+)-(?P<date>\d{{8}})-(?P<time>\d{{6}})\.(?P<ext>tar(?:\.gz)?)(?:\.split\.(?P<split>\d+))?$"
    ))
    .expect("multishard full grammar");

    static ref MULTI_INCR: Regex = Regex::new(&format!(
        r"^(?P<biz>\d+)-TENDISPLUS-BINLOG-{IP}-(?P<port>\d+)-(?P<kvstore>\d+)-(?P<seq>\d+)-(?P<ts>\d{{14}})\.(?P<ext>log(?:\.zst|\.tar\.gz|\.tar)?)$"
    ))
    .expect("multishard binlog grammar");
}

/// Parse a catalog file name with the grammars of `engine`
pub fn parse(file_name: &str, engine: EngineKind) -> Result<ParsedName, ParseError> {
    let (full, incremental): (&Regex, &Regex) = match engine {
        EngineKind::Cache => (&CACHE_FULL, &CACHE_INCR),
        EngineKind::Ssd => (&SSD_FULL, &SSD_INCR),
        EngineKind::MultiShard => (&MULTI_FULL, &MULTI_INCR),
    };

    if let Some(caps) = full.captures(file_name) {
        return parse_full(file_name, &caps);
    }
    if let Some(caps) = incremental.captures(file_name) {
        return parse_incremental(file_name, &caps);
    }

    Err(ParseError::UnknownGrammar {
        file: file_name.to_string(),
        engine,
    })
}

fn parse_full(file_name: &str, caps: &Captures<'_>) -> Result<ParsedName, ParseError> {
    let creation_timestamp = parse_split_timestamp(file_name, &caps["date"], &caps["time"])?;
    let sequence_index = match caps.name("split") {
        Some(split) => parse_number(file_name, split.as_str(), "split index")?,
        None => 0,
    };
    let unsplit = match caps.name("split") {
        Some(split) => &file_name[..split.start() - ".split.".len()],
        None => file_name,
    };
    let (format, stem) = ContainerFormat::from_file_name(unsplit);

    Ok(ParsedName {
        kind: BackupKind::Full,
        source_ip: caps["ip"].to_string(),
        source_port: parse_port(file_name, &caps["port"])?,
        shard_index: -1,
        sequence_index,
        creation_timestamp,
        format,
        stem: stem.to_string(),
    })
}

fn parse_incremental(file_name: &str, caps: &Captures<'_>) -> Result<ParsedName, ParseError> {
    let creation_timestamp = parse_compact_timestamp(file_name, &caps["ts"])?;
    let shard_index = match caps.name("kvstore") {
        Some(kvstore) => {
            let index = parse_number(file_name, kvstore.as_str(), "kvstore index")?;
            i32::try_from(index).map_err(|_| ParseError::BadNumber {
                file: file_name.to_string(),
                field: "kvstore index",
            })?
        }
        None => -1,
    };
    let (format, stem) = ContainerFormat::from_file_name(file_name);

    Ok(ParsedName {
        kind: BackupKind::Incremental,
        source_ip: caps["ip"].to_string(),
        source_port: parse_port(file_name, &caps["port"])?,
        shard_index,
        sequence_index: parse_number(file_name, &caps["seq"], "binlog index")?,
        creation_timestamp,
        format,
        stem: stem.to_string(),
    })
}

fn parse_number(file: &str, raw: &str, field: &'static str) -> Result<u64, ParseError> {
    raw.parse::<u64>().map_err(|_| ParseError::BadNumber {
        file: file.to_string(),
        field,
    })
}

fn parse_port(file: &str, raw: &str) -> Result<u16, ParseError> {
    raw.parse::<u16>().map_err(|_| ParseError::BadNumber {
        file: file.to_string(),
        field: "port",
    })
}

/// `YYYYMMDD` + `HHMMSS`
fn parse_split_timestamp(file: &str, date: &str, time: &str) -> Result<NaiveDateTime, ParseError> {
    let bad = || ParseError::BadTimestamp {
        file: file.to_string(),
        raw: format!("{date}-{time}"),
    };
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| bad())?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S").map_err(|_| bad())?;
    Ok(NaiveDateTime::new(date, time))
}

/// `YYYYMMDDHHMMSS`
fn parse_compact_timestamp(file: &str, raw: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S").map_err(|_| ParseError::BadTimestamp {
        file: file.to_string(),
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_multishard_full_split() {
        let parsed = parse(
            "100-TENDISPLUS-FULL-slave-10.0.0.1-30000-20240110-050000.tar.split.3",
            EngineKind::MultiShard,
        )
        .unwrap();
        assert_eq!(parsed.kind, BackupKind::Full);
        assert_eq!(parsed.sequence_index, 3);
        assert_eq!(parsed.shard_index, -1);
        assert_eq!(parsed.creation_timestamp, ts("2024-01-10 05:00:00"));
        assert_eq!(parsed.format, ContainerFormat::Tar);
        assert_eq!(parsed.stem, "100-TENDISPLUS-FULL-slave-10.0.0.1-30000-20240110-050000");
    }

    #[test]
    fn test_multishard_binlog() {
        let parsed = parse(
            "100-TENDISPLUS-BINLOG-10.0.0.1-30000-7-0000105-20240110051230.log.zst",
            EngineKind::MultiShard,
        )
        .unwrap();
        assert_eq!(parsed.kind, BackupKind::Incremental);
        assert_eq!(parsed.shard_index, 7);
        assert_eq!(parsed.sequence_index, 105);
        assert_eq!(parsed.source_port, 30000);
        assert_eq!(parsed.creation_timestamp, ts("2024-01-10 05:12:30"));
        assert_eq!(parsed.format, ContainerFormat::Zstd);
        assert!(parsed.stem.ends_with(".log"));
    }

    #[test]
    fn test_ssd_binlog_block_format() {
        let parsed = parse(
            "binlog-10.0.0.2-30001-0001234-20240110235959.log.blz",
            EngineKind::Ssd,
        )
        .unwrap();
        assert_eq!(parsed.shard_index, -1);
        assert_eq!(parsed.sequence_index, 1234);
        assert_eq!(parsed.format, ContainerFormat::Block);
    }

    #[test]
    fn test_cache_full_rdb() {
        let parsed = parse(
            "7-REDIS-FULL-master-10.0.0.3-6379-20240110-050000.rdb.zst",
            EngineKind::Cache,
        )
        .unwrap();
        assert_eq!(parsed.kind, BackupKind::Full);
        assert_eq!(parsed.format, ContainerFormat::Zstd);
        assert!(parsed.stem.ends_with(".rdb"));
    }

    #[test]
    fn test_wrong_engine_grammar_is_rejected() {
        let err = parse(
            "100-TENDISPLUS-FULL-slave-10.0.0.1-30000-20240110-050000.tar",
            EngineKind::Ssd,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::UnknownGrammar { engine: EngineKind::Ssd, .. }));
    }

    #[test]
    fn test_impossible_timestamp() {
        let err = parse(
            "binlog-10.0.0.2-30001-0001234-20241399235959.log",
            EngineKind::Ssd,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::BadTimestamp { .. }));
    }
}
