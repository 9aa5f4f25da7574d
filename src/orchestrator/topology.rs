//! Topology snapshot and rebuild
//!
//! The snapshot is taken before the wipe, because afterwards the target no
//! longer knows its replicas. The rebuild re-assigns the backed-up slots and
//! re-attaches every replica recorded in the snapshot.
//!
//! A persisted snapshot belongs to one recovery (source, target and recovery
//! time). It only outlives a task that failed, so a retry of that same
//! recovery can still find the replicas its wipe made the target forget.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::task::TaskWarning;
use super::StepError;
use crate::client::topology::find_myself;
use crate::client::{ClientFactory, ClusterNode, EngineClient, SlotRange};
use crate::config::RecoveryOptions;
use crate::node::NodeAddr;
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::PitrError;

/// Cluster view of the target as it was before the restore touched it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub captured_at: DateTime<Utc>,
    pub source: NodeAddr,
    pub target: NodeAddr,
    pub recovery_time: NaiveDateTime,
    /// Target's node id before the wipe
    pub node_id: String,
    pub nodes: Vec<ClusterNode>,
}

impl TopologySnapshot {
    /// `{staging}/{ip}_{port}.topology.json`
    pub fn path(staging_dir: &Path, target: &NodeAddr) -> PathBuf {
        staging_dir.join(format!("{}.topology.json", target.slug()))
    }

    /// Whether this snapshot was taken for the given recovery
    pub fn belongs_to(
        &self,
        source: &NodeAddr,
        target: &NodeAddr,
        recovery_time: NaiveDateTime,
    ) -> bool {
        &self.source == source && &self.target == target && self.recovery_time == recovery_time
    }

    /// Nodes that replicated from the target
    pub fn replicas(&self) -> Vec<&ClusterNode> {
        self.nodes
            .iter()
            .filter(|n| n.master_id.as_deref() == Some(self.node_id.as_str()))
            .collect()
    }
}

/// Capture the target's topology and persist it
///
/// A persisted snapshot is reused only when the live view already shows a
/// lone node, which is what an earlier attempt's wipe leaves behind, and only
/// when it was taken for this same recovery. Anything else is overwritten.
#[instrument(skip(client), fields(target = %client.addr()))]
pub async fn capture_snapshot(
    client: &dyn EngineClient,
    path: &Path,
    source: &NodeAddr,
    recovery_time: NaiveDateTime,
) -> Result<TopologySnapshot, PitrError> {
    let live = client.topology().await?;

    if live.len() <= 1 {
        if let Some(snapshot) = read_snapshot(path).await? {
            if snapshot.belongs_to(source, client.addr(), recovery_time) {
                info!(path = %path.display(), replicas = snapshot.replicas().len(), "Reusing persisted topology snapshot");
                return Ok(snapshot);
            }
            warn!(
                path = %path.display(),
                source = %snapshot.source,
                target = %snapshot.target,
                recovery_time = %snapshot.recovery_time,
                "Ignoring topology snapshot of another recovery"
            );
        }
    }

    let snapshot_error = |reason: String| StepError::Snapshot {
        path: path.to_path_buf(),
        reason,
    };
    let node_id = find_myself(&live)
        .map(|myself| myself.id.clone())
        .ok_or_else(|| snapshot_error("no node flagged myself in CLUSTER NODES".to_string()))?;

    let snapshot = TopologySnapshot {
        captured_at: Utc::now(),
        source: source.clone(),
        target: client.addr().clone(),
        recovery_time,
        node_id,
        nodes: live,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(&snapshot)?).await?;

    info!(
        path = %path.display(),
        nodes = snapshot.nodes.len(),
        replicas = snapshot.replicas().len(),
        "Topology snapshot captured"
    );
    Ok(snapshot)
}

async fn read_snapshot(path: &Path) -> Result<Option<TopologySnapshot>, PitrError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove the persisted snapshot once the recovery it belongs to is done
pub async fn discard_snapshot(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Re-assign slots to the target and re-attach the snapshot's replicas
///
/// Replicas that fail to converge become warnings; only slot assignment can
/// fail the step.
#[instrument(skip_all, fields(target = %target_client.addr(), slot_ranges = slots.len()))]
pub async fn rebuild_topology(
    target_client: &dyn EngineClient,
    factory: &dyn ClientFactory,
    password: Option<&str>,
    snapshot: &TopologySnapshot,
    slots: &[SlotRange],
    options: &RecoveryOptions,
) -> Result<Vec<TaskWarning>, PitrError> {
    target_client.cluster_add_slots(slots).await?;
    let new_id = target_client.cluster_myid().await?;
    let target = target_client.addr().clone();
    info!(node_id = %new_id, "Slots assigned");

    let replicas = snapshot.replicas();
    let attempts = join_all(replicas.iter().map(|replica| {
        attach_replica(factory, password, &replica.addr, &target, &new_id, options)
    }))
    .await;

    let mut warnings = Vec::new();
    for (replica, attempt) in replicas.iter().zip(attempts) {
        match attempt {
            Ok(()) => info!(replica = %replica.addr, "Replica re-attached"),
            Err(e) => {
                warn!(replica = %replica.addr, error = %e, "Replica did not converge");
                warnings.push(TaskWarning::ReplicaNotAttached {
                    replica: replica.addr.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(warnings)
}

async fn attach_replica(
    factory: &dyn ClientFactory,
    password: Option<&str>,
    replica: &NodeAddr,
    target: &NodeAddr,
    new_id: &str,
    options: &RecoveryOptions,
) -> Result<(), PitrError> {
    let client = factory.connect(replica, password).await?;
    let poll = RetryExecutor::new(RetryConfig::polling(
        options.topology_max_attempts,
        options.topology_delay(),
        options.progress_log_every,
    ));

    client.cluster_meet(target).await?;
    poll.execute("replica sees new primary", || {
        sees_primary(client.as_ref(), target, new_id)
    })
    .await?;

    client.cluster_replicate(new_id).await?;
    poll.execute("replica role flip", || replicates(client.as_ref(), target))
        .await?;

    if let Err(e) = client.config_rewrite().await {
        warn!(replica = %replica, error = %e, "Replica config not persisted");
    }
    debug!(replica = %replica, "Replica attached");
    Ok(())
}

async fn sees_primary(
    client: &dyn EngineClient,
    target: &NodeAddr,
    new_id: &str,
) -> Result<(), PitrError> {
    let nodes = client.topology().await?;
    if nodes.iter().any(|n| n.id == new_id && &n.addr == target) {
        return Ok(());
    }
    Err(StepError::ReplicaNotConverged {
        replica: client.addr().to_string(),
        reason: format!("{target} ({new_id}) not yet in its cluster view"),
    }
    .into())
}

async fn replicates(client: &dyn EngineClient, target: &NodeAddr) -> Result<(), PitrError> {
    let role = client.role().await?;
    if role.is_replica_of(target) {
        return Ok(());
    }
    Err(StepError::ReplicaNotConverged {
        replica: client.addr().to_string(),
        reason: format!("role is {role:?}, expected replica of {target}"),
    }
    .into())
}
