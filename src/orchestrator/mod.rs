//! Restore orchestrator
//!
//! Drives one recovery task through its states:
//!
//! ```text
//! Pending -> Staged -> PreconditionChecked -> Wiped -> FullLoaded
//!         -> IncrementalsReplayed -> TopologyRebuilt -> Validated
//! ```
//!
//! `TopologyRebuilt` is skipped for engines without cluster topology, and any
//! step may end the task as `Failed`. Shard-level work (chain resolution,
//! chain staging, replay) fans out one worker per shard; all workers join
//! before any result is looked at, so every failing shard reports its own
//! error. Nothing is rolled back on failure.

pub mod load;
pub mod precheck;
pub mod replay;
pub mod task;
pub mod topology;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, instrument};

use crate::catalog::{descriptors_from_listing, BackupKind, CatalogSource};
use crate::client::ClientFactory;
use crate::config::EnvironmentConfig;
use crate::engine_kind::{EngineKind, ReplayStart};
use crate::fanout::{ShardFanout, ShardOutcome};
use crate::lease::DestinationLease;
use crate::observability;
use crate::process::{ProcessControl, ProcessError};
use crate::resolve::{
    resolve_chain, resolve_nearest_full, shard_label, ChainWindow, IncrementalChain,
};
use crate::staging::manifest::{chain_start_position, read_manifest};
use crate::staging::{
    ArtifactTransfer, BackupManifest, StagedChain, StagingError, StagingManager, MANIFEST_FILE,
};
use crate::validate::RecoveryValidator;
use crate::{ErrorClass, PitrError};

use load::LoadContext;
use replay::ReplayContext;

pub use task::{
    ChainSummary, RecoveryFailure, RecoveryReport, RecoveryState, RecoveryStep, RecoveryTask,
    RecoveryTaskSpec, StepFailure, TaskWarning,
};
pub use topology::TopologySnapshot;

/// Errors raised by the orchestrator's own steps
#[derive(Error, Debug)]
pub enum StepError {
    #[error("target {target} is not a standalone master (role {role})")]
    NotMaster { target: String, role: String },

    #[error("target {target} processed {delta} commands during a {window:?} sniff, live traffic suspected")]
    LiveTraffic {
        target: String,
        delta: u64,
        window: Duration,
    },

    #[error("target {target} still sees {nodes} cluster node(s) after leaving the cluster")]
    DetachNotConverged { target: String, nodes: usize },

    #[error("task expects {expected} stores, the backup manifest records {recorded}")]
    ShardCountMismatch { expected: u32, recorded: u32 },

    #[error("shard {}: replay of {file} failed: {source}", shard_label(*.shard_index))]
    Replay {
        shard_index: i32,
        file: String,
        #[source]
        source: ProcessError,
    },

    #[error("replica {replica} has not converged: {reason}")]
    ReplicaNotConverged { replica: String, reason: String },

    #[error("topology snapshot {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("full backup load failed: {reason}")]
    Load { reason: String },
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::NotMaster { .. } | StepError::LiveTraffic { .. } => {
                ErrorClass::PreconditionFailed
            }
            StepError::ReplicaNotConverged { .. } => ErrorClass::TopologyConvergence,
            StepError::DetachNotConverged { .. }
            | StepError::Replay { .. }
            | StepError::Load { .. } => ErrorClass::Remote,
            StepError::ShardCountMismatch { .. } | StepError::Snapshot { .. } => {
                ErrorClass::Internal
            }
        }
    }
}

/// Attribute an error to the step it happened in
trait AtStep<T> {
    fn at(self, step: RecoveryStep) -> Result<T, Vec<StepFailure>>;
}

impl<T, E: Into<PitrError>> AtStep<T> for Result<T, E> {
    fn at(self, step: RecoveryStep) -> Result<T, Vec<StepFailure>> {
        self.map_err(|e| vec![StepFailure::new(step, e)])
    }
}

/// Every shard's value, or every shard's failure
fn collect_outcomes<T>(
    step: RecoveryStep,
    outcomes: Vec<ShardOutcome<T, PitrError>>,
) -> Result<Vec<T>, Vec<StepFailure>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(value) => values.push(value),
            Err(e) => failures.push(StepFailure::for_shard(step, outcome.shard_index, e)),
        }
    }
    if failures.is_empty() {
        Ok(values)
    } else {
        Err(failures)
    }
}

/// Runs recovery tasks against injected collaborators
pub struct RestoreOrchestrator {
    catalog: Arc<dyn CatalogSource>,
    transfer: Arc<dyn ArtifactTransfer>,
    clients: Arc<dyn ClientFactory>,
    process: Arc<dyn ProcessControl>,
}

impl RestoreOrchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        transfer: Arc<dyn ArtifactTransfer>,
        clients: Arc<dyn ClientFactory>,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            catalog,
            transfer,
            clients,
            process,
        }
    }

    /// Run one recovery to `Validated` or to the first fatal step
    #[instrument(
        skip(self, spec),
        fields(
            source = %spec.source,
            target = %spec.target,
            engine = %spec.engine,
            recovery_time = %spec.recovery_time
        )
    )]
    pub async fn run(&self, spec: RecoveryTaskSpec) -> Result<RecoveryReport, RecoveryFailure> {
        let env = EnvironmentConfig::resolve(&spec.overrides);
        let mut task = RecoveryTask::new(spec, env);
        let engine = task.engine().to_string();
        info!(task_id = %task.id, "Recovery task started");

        match self.drive(&mut task).await {
            Ok(()) => {
                observability::record_task(&engine, task.state.as_str());
                info!(
                    task_id = %task.id,
                    state = %task.state,
                    warnings = task.warnings.len(),
                    elapsed = ?task.elapsed(),
                    "Recovery task finished"
                );
                Ok(task.report())
            }
            Err(failures) => {
                for failure in &failures {
                    error!(task_id = %task.id, failure = %failure, "Recovery step failed");
                }
                let failure = task.fail(failures);
                observability::record_task(&engine, RecoveryState::Failed.as_str());
                Err(failure)
            }
        }
    }

    async fn drive(&self, task: &mut RecoveryTask) -> Result<(), Vec<StepFailure>> {
        let spec = task.spec.clone();
        let options = &spec.options;
        let engine = spec.engine;
        let password = spec.target_password.as_deref();
        let shards = spec.shards();
        let fanout = ShardFanout::new(options.max_shard_workers);

        // Held until this function returns, on every path
        let _lease = DestinationLease::acquire(
            &task.env.lock_dir,
            &spec.target,
            &task.id.to_string(),
            options.lease_timeout(),
        )
        .await
        .at(RecoveryStep::Lease)?;

        let client = self
            .clients
            .connect(&spec.target, password)
            .await
            .at(RecoveryStep::Connect)?;

        let snapshot_path = TopologySnapshot::path(&spec.staging_dir, &spec.target);
        let snapshot = if engine.is_clustered() {
            Some(
                topology::capture_snapshot(
                    client.as_ref(),
                    &snapshot_path,
                    &spec.source,
                    spec.recovery_time,
                )
                .await
                .at(RecoveryStep::Snapshot)?,
            )
        } else {
            None
        };

        // Resolution
        let full_records = self
            .catalog
            .list(&spec.source, BackupKind::Full)
            .await
            .at(RecoveryStep::ResolveFull)?;
        let fulls = descriptors_from_listing(&full_records, engine, &spec.source, BackupKind::Full);
        let mut full =
            resolve_nearest_full(&fulls, spec.recovery_time).at(RecoveryStep::ResolveFull)?;
        info!(
            anchor = %full.anchor_timestamp,
            parts = full.parts.len(),
            bytes = full.total_size(),
            "Full backup resolved"
        );

        let incremental_records = self
            .catalog
            .list(&spec.source, BackupKind::Incremental)
            .await
            .at(RecoveryStep::ResolveChains)?;
        let incrementals = Arc::new(descriptors_from_listing(
            &incremental_records,
            engine,
            &spec.source,
            BackupKind::Incremental,
        ));
        let window = ChainWindow::new(full.anchor_timestamp, spec.replay_end());
        let outcomes = fanout
            .run("resolve", &shards, |shard| {
                let incrementals = incrementals.clone();
                async move { resolve_chain(&incrementals, shard, window).map_err(PitrError::from) }
            })
            .await;
        let chains = collect_outcomes(RecoveryStep::ResolveChains, outcomes)?;

        // Staging
        let staging = Arc::new(StagingManager::new(
            &spec.staging_dir,
            engine,
            self.transfer.clone(),
            self.process.clone(),
            task.env.tools.clone(),
            options.tool_timeout(),
        ));
        let staged_full = staging
            .ensure_full_staged(&mut full)
            .await
            .at(RecoveryStep::Staging)?;

        // Read now: the staged directory is gone once the load succeeds
        let manifest = if engine.is_clustered() {
            let manifest = read_manifest(&staged_full.path).at(RecoveryStep::Staging)?;
            if engine == EngineKind::MultiShard && manifest.kvstore_count != spec.shard_count {
                return Err(vec![StepFailure::new(
                    RecoveryStep::Staging,
                    StepError::ShardCountMismatch {
                        expected: spec.shard_count,
                        recorded: manifest.kvstore_count,
                    },
                )]);
            }
            Some(manifest)
        } else {
            None
        };

        let chains = with_start_positions(engine, chains, &staged_full.path, manifest.as_ref())?;
        task.full_backup = Some(full.clone());
        task.chains = chains.clone();

        let by_shard: Arc<HashMap<i32, IncrementalChain>> =
            Arc::new(chains.iter().map(|c| (c.shard_index, c.clone())).collect());
        let outcomes = fanout
            .run("stage", &shards, |shard| {
                let staging = staging.clone();
                let chain = by_shard.get(&shard).cloned();
                async move {
                    let chain = chain.ok_or_else(|| {
                        PitrError::Internal(format!("no chain resolved for shard {}", shard_label(shard)))
                    })?;
                    staging.ensure_chain_staged(&chain).await.map_err(PitrError::from)
                }
            })
            .await;
        let staged_chains = collect_outcomes(RecoveryStep::Staging, outcomes)?;
        task.transition(RecoveryState::Staged);

        // Target preparation
        precheck::check_preconditions(client.as_ref(), options)
            .await
            .at(RecoveryStep::Precondition)?;
        task.transition(RecoveryState::PreconditionChecked);

        precheck::wipe_target(client.as_ref(), engine.is_clustered(), options)
            .await
            .at(RecoveryStep::Wipe)?;
        task.transition(RecoveryState::Wiped);

        {
            let ctx = LoadContext {
                client: client.as_ref(),
                process: self.process.as_ref(),
                env: &task.env,
                options,
                target: &spec.target,
            };
            load::load_full(engine, &ctx, &staged_full.path)
                .await
                .at(RecoveryStep::LoadFull)?;
        }
        if let Err(e) = staging.discard_full(&mut full).await {
            task.warn(TaskWarning::Cleanup {
                path: staged_full.path.clone(),
                reason: e.to_string(),
            });
        }
        task.transition(RecoveryState::FullLoaded);

        // Replay
        let replay_ctx = Arc::new(ReplayContext {
            process: self.process.clone(),
            tools: task.env.tools.clone(),
            engine,
            target: spec.target.clone(),
            password: spec.target_password.clone(),
            tool_timeout: options.tool_timeout(),
            anchor: full.anchor_timestamp,
            end: spec.replay_end(),
        });
        let staged_by_shard: Arc<HashMap<i32, (StagedChain, u64)>> = Arc::new(
            staged_chains
                .into_iter()
                .zip(&chains)
                .map(|(staged, chain)| (staged.shard_index, (staged, chain.chain_start_position)))
                .collect(),
        );
        let outcomes = fanout
            .run("replay", &shards, |shard| {
                let ctx = replay_ctx.clone();
                let entry = staged_by_shard.get(&shard).cloned();
                async move {
                    let (staged, start_position) = entry.ok_or_else(|| {
                        PitrError::Internal(format!("no staged chain for shard {}", shard_label(shard)))
                    })?;
                    replay::replay_chain(&ctx, &staged, start_position).await
                }
            })
            .await;
        let replayed: usize = collect_outcomes(RecoveryStep::Replay, outcomes)?
            .into_iter()
            .sum();
        for &shard in &shards {
            if let Err(e) = staging.discard_chain(&spec.source, shard).await {
                task.warn(TaskWarning::Cleanup {
                    path: staging.shard_dir(&spec.source, shard),
                    reason: e.to_string(),
                });
            }
        }
        info!(files = replayed, "Incrementals replayed");
        task.transition(RecoveryState::IncrementalsReplayed);

        // Topology
        if let (Some(snapshot), Some(manifest)) = (&snapshot, &manifest) {
            let slots = manifest
                .slot_ranges()
                .map_err(|reason| StagingError::Manifest {
                    path: staged_full.path.join(MANIFEST_FILE),
                    reason,
                })
                .at(RecoveryStep::Topology)?;
            let warnings = topology::rebuild_topology(
                client.as_ref(),
                self.clients.as_ref(),
                password,
                snapshot,
                &slots,
                options,
            )
            .await
            .at(RecoveryStep::Topology)?;
            for warning in warnings {
                task.warn(warning);
            }
            task.transition(RecoveryState::TopologyRebuilt);
        }

        // Validation never fails the task
        let validator = RecoveryValidator::new(options.heartbeat_tolerance());
        let outcome = validator
            .validate(client.as_ref(), &spec.source, &shards, spec.recovery_time)
            .await;
        for warning in outcome.warnings {
            task.warn(TaskWarning::Validation(warning));
        }

        // Kept only for a retry of this same recovery
        if snapshot.is_some() {
            if let Err(e) = topology::discard_snapshot(&snapshot_path).await {
                task.warn(TaskWarning::Cleanup {
                    path: snapshot_path.clone(),
                    reason: e.to_string(),
                });
            }
        }
        task.transition(RecoveryState::Validated);

        Ok(())
    }
}

/// Attach each chain's replay start offset from the staged backup's metadata
fn with_start_positions(
    engine: EngineKind,
    chains: Vec<IncrementalChain>,
    backup_dir: &Path,
    manifest: Option<&BackupManifest>,
) -> Result<Vec<IncrementalChain>, Vec<StepFailure>> {
    if engine.replay_start() == ReplayStart::AnchorTime {
        return Ok(chains);
    }
    let Some(manifest) = manifest else {
        return Err(vec![StepFailure::new(
            RecoveryStep::Staging,
            PitrError::Internal(format!("{engine} replays from positions but has no manifest")),
        )]);
    };

    let mut positioned = Vec::with_capacity(chains.len());
    let mut failures = Vec::new();
    for chain in chains {
        let shard_index = chain.shard_index;
        match chain_start_position(backup_dir, manifest, shard_index) {
            Ok(position) => positioned.push(chain.with_start_position(position)),
            Err(e) => failures.push(StepFailure::for_shard(RecoveryStep::Staging, shard_index, e)),
        }
    }
    if failures.is_empty() {
        Ok(positioned)
    } else {
        Err(failures)
    }
}
