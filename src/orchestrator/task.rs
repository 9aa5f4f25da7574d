//! Recovery task aggregate, states and results

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::{EnvironmentConfig, EnvironmentOverrides, RecoveryOptions};
use crate::engine_kind::EngineKind;
use crate::node::NodeAddr;
use crate::observability;
use crate::resolve::{shard_label, FullBackupSet, IncrementalChain};
use crate::validate::ValidationWarning;
use crate::{ErrorClass, PitrError};

fn default_shard_count() -> u32 {
    1
}

/// What the caller asks for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTaskSpec {
    pub source: NodeAddr,
    /// Temporary instance that receives the recovered data
    pub target: NodeAddr,
    #[serde(default)]
    pub target_password: Option<String>,
    pub recovery_time: NaiveDateTime,
    pub engine: EngineKind,
    /// Stores per instance, only meaningful for multi-shard engines
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    pub staging_dir: PathBuf,
    #[serde(default)]
    pub options: RecoveryOptions,
    #[serde(default)]
    pub overrides: EnvironmentOverrides,
}

impl RecoveryTaskSpec {
    pub fn new(
        source: NodeAddr,
        target: NodeAddr,
        recovery_time: NaiveDateTime,
        engine: EngineKind,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            target,
            target_password: None,
            recovery_time,
            engine,
            shard_count: default_shard_count(),
            staging_dir: staging_dir.into(),
            options: RecoveryOptions::default(),
            overrides: EnvironmentOverrides::default(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.target_password = Some(password.into());
        self
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_options(mut self, options: RecoveryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_overrides(mut self, overrides: EnvironmentOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Shards whose chains are resolved and replayed
    pub fn shards(&self) -> Vec<i32> {
        self.engine.shard_indices(self.shard_count)
    }

    /// Recovery time plus the window epsilon; replay stops here
    pub fn replay_end(&self) -> NaiveDateTime {
        self.recovery_time + self.options.window_epsilon()
    }
}

/// Position of a task in the restore state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    Pending,
    Staged,
    PreconditionChecked,
    Wiped,
    FullLoaded,
    IncrementalsReplayed,
    TopologyRebuilt,
    Validated,
    Failed,
}

impl RecoveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecoveryState::Validated | RecoveryState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryState::Pending => "pending",
            RecoveryState::Staged => "staged",
            RecoveryState::PreconditionChecked => "precondition_checked",
            RecoveryState::Wiped => "wiped",
            RecoveryState::FullLoaded => "full_loaded",
            RecoveryState::IncrementalsReplayed => "incrementals_replayed",
            RecoveryState::TopologyRebuilt => "topology_rebuilt",
            RecoveryState::Validated => "validated",
            RecoveryState::Failed => "failed",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStep {
    Connect,
    Lease,
    Snapshot,
    ResolveFull,
    ResolveChains,
    Staging,
    Precondition,
    Wipe,
    LoadFull,
    Replay,
    Topology,
    Validate,
}

impl RecoveryStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStep::Connect => "connect",
            RecoveryStep::Lease => "lease",
            RecoveryStep::Snapshot => "snapshot",
            RecoveryStep::ResolveFull => "resolve_full",
            RecoveryStep::ResolveChains => "resolve_chains",
            RecoveryStep::Staging => "staging",
            RecoveryStep::Precondition => "precondition",
            RecoveryStep::Wipe => "wipe",
            RecoveryStep::LoadFull => "load_full",
            RecoveryStep::Replay => "replay",
            RecoveryStep::Topology => "topology",
            RecoveryStep::Validate => "validate",
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal finding attached to the task result
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskWarning {
    #[error("replica {replica} was not re-attached: {reason}")]
    ReplicaNotAttached { replica: NodeAddr, reason: String },

    #[error("{0}")]
    Validation(ValidationWarning),

    #[error("could not remove {path}: {reason}")]
    Cleanup { path: PathBuf, reason: String },
}

impl TaskWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskWarning::ReplicaNotAttached { .. } => "replica_attach",
            TaskWarning::Validation(w) => w.kind(),
            TaskWarning::Cleanup { .. } => "cleanup",
        }
    }
}

/// One fatal error, attributed to a step and possibly a shard
#[derive(Debug)]
pub struct StepFailure {
    pub step: RecoveryStep,
    pub shard_index: Option<i32>,
    pub error: PitrError,
}

impl StepFailure {
    pub fn new(step: RecoveryStep, error: impl Into<PitrError>) -> Self {
        Self {
            step,
            shard_index: None,
            error: error.into(),
        }
    }

    pub fn for_shard(step: RecoveryStep, shard_index: i32, error: impl Into<PitrError>) -> Self {
        Self {
            step,
            shard_index: Some(shard_index),
            error: error.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard_index {
            Some(shard) => write!(f, "[{} shard {}] {}", self.step, shard_label(shard), self.error),
            None => write!(f, "[{}] {}", self.step, self.error),
        }
    }
}

/// Per-shard chain summary for reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub shard_index: i32,
    pub first_index: Option<u64>,
    pub last_index: Option<u64>,
    pub files: Vec<String>,
    pub start_position: u64,
}

impl From<&IncrementalChain> for ChainSummary {
    fn from(chain: &IncrementalChain) -> Self {
        Self {
            shard_index: chain.shard_index,
            first_index: chain.first_index(),
            last_index: chain.last_index(),
            files: chain.file_names(),
            start_position: chain.chain_start_position,
        }
    }
}

/// Successful recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub task_id: Uuid,
    pub final_state: RecoveryState,
    pub full_backup: Vec<String>,
    pub anchor_timestamp: Option<NaiveDateTime>,
    pub chains: Vec<ChainSummary>,
    pub warnings: Vec<TaskWarning>,
    pub elapsed: Duration,
}

/// Failed recovery: every shard's first fatal error plus the warnings so far
#[derive(Error, Debug)]
#[error("recovery task {task_id} failed at {step} after reaching {last_state}: {}", summarize(.failures))]
pub struct RecoveryFailure {
    pub task_id: Uuid,
    pub step: RecoveryStep,
    pub last_state: RecoveryState,
    pub failures: Vec<StepFailure>,
    pub warnings: Vec<TaskWarning>,
}

fn summarize(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RecoveryFailure {
    /// Class of the first failure
    pub fn class(&self) -> ErrorClass {
        self.failures
            .first()
            .map(|f| f.error.class())
            .unwrap_or(ErrorClass::Internal)
    }

    /// True when every failure is a not-yet-available artifact
    pub fn is_retryable(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.error.is_retryable())
    }
}

/// One restore operation, exclusively owned by the orchestrator
#[derive(Debug)]
pub struct RecoveryTask {
    pub id: Uuid,
    pub spec: RecoveryTaskSpec,
    pub env: EnvironmentConfig,
    pub state: RecoveryState,
    pub full_backup: Option<FullBackupSet>,
    pub chains: Vec<IncrementalChain>,
    pub warnings: Vec<TaskWarning>,
    pub history: Vec<(RecoveryState, DateTime<Utc>)>,
    started: Instant,
    step_started: Instant,
}

impl RecoveryTask {
    pub fn new(spec: RecoveryTaskSpec, env: EnvironmentConfig) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            spec,
            env,
            state: RecoveryState::Pending,
            full_backup: None,
            chains: Vec::new(),
            warnings: Vec::new(),
            history: vec![(RecoveryState::Pending, Utc::now())],
            started: now,
            step_started: now,
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.spec.engine
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to `next`, recording how long the step that got us here took
    pub fn transition(&mut self, next: RecoveryState) {
        let step_elapsed = self.step_started.elapsed();
        observability::record_step(
            &self.spec.engine.to_string(),
            next.as_str(),
            step_elapsed,
        );
        info!(
            task_id = %self.id,
            from = %self.state,
            to = %next,
            step_elapsed = ?step_elapsed,
            "Recovery state transition"
        );
        self.state = next;
        self.history.push((next, Utc::now()));
        self.step_started = Instant::now();
    }

    pub fn warn(&mut self, warning: TaskWarning) {
        observability::record_warning(warning.kind());
        self.warnings.push(warning);
    }

    pub fn report(&self) -> RecoveryReport {
        RecoveryReport {
            task_id: self.id,
            final_state: self.state,
            full_backup: self
                .full_backup
                .as_ref()
                .map(FullBackupSet::file_names)
                .unwrap_or_default(),
            anchor_timestamp: self.full_backup.as_ref().map(|f| f.anchor_timestamp),
            chains: self.chains.iter().map(ChainSummary::from).collect(),
            warnings: self.warnings.clone(),
            elapsed: self.elapsed(),
        }
    }

    /// Close the task as failed
    pub fn fail(&mut self, failures: Vec<StepFailure>) -> RecoveryFailure {
        let last_state = self.state;
        let step = failures
            .first()
            .map(|f| f.step)
            .unwrap_or(RecoveryStep::Validate);
        self.state = RecoveryState::Failed;
        self.history.push((RecoveryState::Failed, Utc::now()));
        RecoveryFailure {
            task_id: self.id,
            step,
            last_state,
            failures,
            warnings: self.warnings.clone(),
        }
    }
}
