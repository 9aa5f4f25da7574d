//! Engine command client
//!
//! The orchestrator talks to engine instances only through [`EngineClient`].
//! Connection handling (dialing, reconnects) is the implementation's concern.

pub mod redis;
pub mod topology;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::node::NodeAddr;
pub use topology::{parse_cluster_nodes, parse_slot_ranges, ClusterNode, SlotRange};

/// Errors raised by engine clients
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("{command} on {addr} failed: {reason}")]
    Command {
        addr: String,
        command: String,
        reason: String,
    },

    #[error("{command} on {addr} timed out after {timeout:?}")]
    Timeout {
        addr: String,
        command: String,
        timeout: Duration,
    },

    #[error("{command} on {addr} returned an unexpected reply: {reply}")]
    UnexpectedReply {
        addr: String,
        command: String,
        reply: String,
    },
}

/// Replication role as reported by `INFO replication`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRole {
    Master,
    Replica { master: NodeAddr, link_up: bool },
}

impl ReplicationRole {
    pub fn is_master(&self) -> bool {
        matches!(self, ReplicationRole::Master)
    }

    /// Replica of `primary`, regardless of link state
    pub fn is_replica_of(&self, primary: &NodeAddr) -> bool {
        matches!(self, ReplicationRole::Replica { master, .. } if master == primary)
    }
}

/// Parse `INFO` output into key/value pairs, skipping section headers
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Derive the role from `INFO replication` fields
pub fn role_from_info(info: &HashMap<String, String>) -> Option<ReplicationRole> {
    match info.get("role").map(String::as_str) {
        Some("master") => Some(ReplicationRole::Master),
        Some("slave") | Some("replica") => {
            let host = info.get("master_host")?;
            let port = info.get("master_port")?.parse::<u16>().ok()?;
            Some(ReplicationRole::Replica {
                master: NodeAddr::new(host.clone(), port),
                link_up: info.get("master_link_status").map(String::as_str) == Some("up"),
            })
        }
        _ => None,
    }
}

/// Request/response primitives against one engine instance
#[async_trait]
pub trait EngineClient: Send + Sync {
    fn addr(&self) -> &NodeAddr;

    async fn ping(&self) -> Result<(), ClientError>;

    async fn role(&self) -> Result<ReplicationRole, ClientError>;

    /// `INFO {section}` as key/value pairs
    async fn info(&self, section: &str) -> Result<HashMap<String, String>, ClientError>;

    async fn flush_all(&self) -> Result<(), ClientError>;

    /// Raw `CLUSTER NODES` text
    async fn cluster_nodes(&self) -> Result<String, ClientError>;

    async fn cluster_myid(&self) -> Result<String, ClientError>;

    async fn cluster_reset(&self, hard: bool) -> Result<(), ClientError>;

    async fn cluster_add_slots(&self, ranges: &[SlotRange]) -> Result<(), ClientError>;

    async fn cluster_meet(&self, addr: &NodeAddr) -> Result<(), ClientError>;

    async fn cluster_replicate(&self, node_id: &str) -> Result<(), ClientError>;

    /// Engine-native restore from a backup directory on the instance's host
    async fn restore_backup(&self, dir: &Path) -> Result<(), ClientError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ClientError>;

    async fn config_rewrite(&self) -> Result<(), ClientError>;

    /// Parsed `CLUSTER NODES`
    async fn topology(&self) -> Result<Vec<ClusterNode>, ClientError> {
        let text = self.cluster_nodes().await?;
        parse_cluster_nodes(&text).map_err(|reply| ClientError::UnexpectedReply {
            addr: self.addr().to_string(),
            command: "CLUSTER NODES".to_string(),
            reply,
        })
    }
}

/// Opens clients to engine instances
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        addr: &NodeAddr,
        password: Option<&str>,
    ) -> Result<Arc<dyn EngineClient>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_info() {
        let info = parse_info(
            "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\nmaster_port:30000\r\nmaster_link_status:up\r\n",
        );
        let role = role_from_info(&info).unwrap();
        assert!(role.is_replica_of(&NodeAddr::new("10.0.0.1", 30000)));
        assert!(!role.is_master());

        let info = parse_info("role:master\nconnected_slaves:0\n");
        assert_eq!(role_from_info(&info), Some(ReplicationRole::Master));
        assert_eq!(role_from_info(&HashMap::new()), None);
    }
}
