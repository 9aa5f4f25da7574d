//! Recovery validation against the source's heartbeat records
//!
//! The source periodically writes a per-shard hash holding a counter and a
//! wall-clock time. After a restore, the recovered heartbeat time should sit
//! close to the requested recovery time. Every finding here is advisory.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::client::EngineClient;
use crate::node::NodeAddr;
use crate::resolve::shard_label;

pub const HEARTBEAT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `pitr:heartbeat:{ip}:{port}:{shard}`, `all` for single-store engines
pub fn heartbeat_key(source: &NodeAddr, shard_index: i32) -> String {
    format!(
        "pitr:heartbeat:{}:{}:{}",
        source.ip,
        source.port,
        shard_label(shard_index)
    )
}

/// Accepts `%Y-%m-%d %H:%M:%S` or unix seconds
pub fn parse_heartbeat_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, HEARTBEAT_TIME_FORMAT) {
        return Some(t);
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|t| t.naive_utc())
}

/// A non-fatal validation finding
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationWarning {
    #[error("shard {}: no heartbeat recorded, check skipped", shard_label(*.shard_index))]
    HeartbeatMissing { shard_index: i32 },

    #[error(
        "shard {}: recovered heartbeat {recovered} deviates {deviation_secs}s from requested {requested}",
        shard_label(*.shard_index)
    )]
    HeartbeatDeviation {
        shard_index: i32,
        recovered: NaiveDateTime,
        requested: NaiveDateTime,
        deviation_secs: i64,
    },

    #[error("shard {}: heartbeat unreadable: {reason}", shard_label(*.shard_index))]
    HeartbeatUnreadable { shard_index: i32, reason: String },
}

impl ValidationWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationWarning::HeartbeatMissing { .. } => "heartbeat_missing",
            ValidationWarning::HeartbeatDeviation { .. } => "heartbeat_deviation",
            ValidationWarning::HeartbeatUnreadable { .. } => "heartbeat_unreadable",
        }
    }

    pub fn shard_index(&self) -> i32 {
        match self {
            ValidationWarning::HeartbeatMissing { shard_index }
            | ValidationWarning::HeartbeatDeviation { shard_index, .. }
            | ValidationWarning::HeartbeatUnreadable { shard_index, .. } => *shard_index,
        }
    }
}

/// One shard's heartbeat as found on the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReading {
    pub shard_index: i32,
    pub counter: Option<u64>,
    pub recovered: NaiveDateTime,
    /// Recovered minus requested, in seconds
    pub deviation_secs: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub readings: Vec<HeartbeatReading>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationOutcome {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Compares recovered heartbeats to the requested recovery time
#[derive(Debug, Clone)]
pub struct RecoveryValidator {
    tolerance: chrono::Duration,
}

impl RecoveryValidator {
    pub fn new(tolerance: chrono::Duration) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> chrono::Duration {
        self.tolerance
    }

    /// Judge one shard's heartbeat hash
    pub fn assess(
        &self,
        shard_index: i32,
        fields: &HashMap<String, String>,
        requested: NaiveDateTime,
    ) -> Result<HeartbeatReading, ValidationWarning> {
        let Some(raw_time) = fields.get("time") else {
            return Err(ValidationWarning::HeartbeatMissing { shard_index });
        };
        let recovered = parse_heartbeat_time(raw_time).ok_or_else(|| {
            ValidationWarning::HeartbeatUnreadable {
                shard_index,
                reason: format!("time field '{raw_time}' is not a timestamp"),
            }
        })?;
        let counter = fields.get("counter").and_then(|c| c.trim().parse().ok());

        let deviation = recovered - requested;
        if deviation.abs() > self.tolerance {
            return Err(ValidationWarning::HeartbeatDeviation {
                shard_index,
                recovered,
                requested,
                deviation_secs: deviation.num_seconds(),
            });
        }

        Ok(HeartbeatReading {
            shard_index,
            counter,
            recovered,
            deviation_secs: deviation.num_seconds(),
        })
    }

    /// Read every shard's heartbeat from the target and judge it
    ///
    /// Shards are judged independently; one far-off shard does not affect
    /// another's verdict, and nothing here fails the task.
    #[instrument(skip(self, client, shards), fields(target = %client.addr()))]
    pub async fn validate(
        &self,
        client: &dyn EngineClient,
        source: &NodeAddr,
        shards: &[i32],
        requested: NaiveDateTime,
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        for &shard_index in shards {
            let key = heartbeat_key(source, shard_index);
            let verdict = match client.hgetall(&key).await {
                Ok(fields) if fields.is_empty() => {
                    Err(ValidationWarning::HeartbeatMissing { shard_index })
                }
                Ok(fields) => self.assess(shard_index, &fields, requested),
                Err(e) => Err(ValidationWarning::HeartbeatUnreadable {
                    shard_index,
                    reason: e.to_string(),
                }),
            };

            match verdict {
                Ok(reading) => {
                    info!(
                        shard = %shard_label(shard_index),
                        recovered = %reading.recovered,
                        deviation_secs = reading.deviation_secs,
                        "Heartbeat within tolerance"
                    );
                    outcome.readings.push(reading);
                }
                Err(warning) => {
                    warn!(key = %key, warning = %warning, "Heartbeat check");
                    outcome.warnings.push(warning);
                }
            }
        }

        outcome
    }
}
