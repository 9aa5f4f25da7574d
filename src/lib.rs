//! # Point-in-time recovery for sharded key-value engines
//!
//! Rebuilds one shard of a Redis-compatible engine as of a historical
//! timestamp: the nearest preceding full backup is loaded into a prepared
//! target instance, the binlog chain bridging that backup to the requested
//! time is replayed per store, cluster topology is restored and the result is
//! checked against heartbeats the source wrote into its own keyspace.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::NaiveDateTime;
//! use pitr::catalog::JsonFileCatalog;
//! use pitr::client::redis::RedisClientFactory;
//! use pitr::engine_kind::EngineKind;
//! use pitr::node::NodeAddr;
//! use pitr::orchestrator::{RecoveryTaskSpec, RestoreOrchestrator};
//! use pitr::process::TokioProcessControl;
//! use pitr::staging::LocalDirTransfer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! pitr::observability::init_tracing("info");
//!
//! let orchestrator = RestoreOrchestrator::new(
//!     Arc::new(JsonFileCatalog::new("/data/dbbak/catalog")),
//!     Arc::new(LocalDirTransfer::new("/data/dbbak")),
//!     Arc::new(RedisClientFactory::default()),
//!     Arc::new(TokioProcessControl::new()),
//! );
//!
//! let recovery_time = NaiveDateTime::parse_from_str("2024-01-10 05:15:00", "%Y-%m-%d %H:%M:%S")?;
//! let spec = RecoveryTaskSpec::new(
//!     NodeAddr::new("10.0.0.1", 30000),
//!     NodeAddr::new("10.0.0.9", 30000),
//!     recovery_time,
//!     EngineKind::MultiShard,
//!     "/data/dbbak/pitr",
//! )
//! .with_shard_count(10);
//!
//! let report = orchestrator.run(spec).await?;
//! println!("{} finished as {}", report.task_id, report.final_state);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`catalog`]: catalog records and backup file name grammars
//! - [`resolve`]: nearest full backup and per-shard binlog chain selection
//! - [`staging`]: local mirroring and decompression of artifacts
//! - [`orchestrator`]: the restore state machine
//! - [`validate`]: heartbeat-based recovery validation
//! - [`client`], [`process`]: engine commands and external tools

#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

pub mod catalog;
pub mod client;
pub mod config;
pub mod engine_kind;
pub mod fanout;
pub mod lease;
pub mod node;
pub mod observability;
pub mod orchestrator;
pub mod process;
pub mod resilience;
pub mod resolve;
pub mod staging;
pub mod validate;

pub use config::{EnvironmentConfig, EnvironmentOverrides, RecoveryOptions};
pub use engine_kind::EngineKind;
pub use node::NodeAddr;
pub use orchestrator::{RecoveryFailure, RecoveryReport, RecoveryTaskSpec, RestoreOrchestrator};

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, PitrError>;

/// How an error should be treated by whoever drives the recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Artifacts not there yet; the caller may try again later
    NotYetAvailable,
    /// The catalog cannot produce a consistent image
    ChainCorruption,
    /// A local artifact is damaged
    LocalStagingCorruption,
    /// The target must not be restored onto
    PreconditionFailed,
    /// A replica did not join the rebuilt topology
    TopologyConvergence,
    /// A remote command or tool failed
    Remote,
    Internal,
}

/// Main error type for recovery operations
#[derive(Error, Debug)]
pub enum PitrError {
    #[error("Backup file name error: {0}")]
    Parse(#[from] catalog::ParseError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] resolve::ResolveError),

    #[error("Staging error: {0}")]
    Staging(#[from] staging::StagingError),

    #[error("Engine client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("External command error: {0}")]
    Process(#[from] process::ProcessError),

    #[error("Lease error: {0}")]
    Lease(#[from] lease::LeaseError),

    #[error("Recovery step error: {0}")]
    Step(#[from] orchestrator::StepError),

    #[error("Shard worker error: {0}")]
    WorkerLost(#[from] fanout::WorkerLost),

    #[error("{operation} gave up after {attempts} attempt(s): {last_error}")]
    GaveUp {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<PitrError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl<E> From<resilience::Exhausted<E>> for PitrError
where
    E: std::error::Error + Into<PitrError> + 'static,
{
    fn from(exhausted: resilience::Exhausted<E>) -> Self {
        PitrError::GaveUp {
            operation: exhausted.operation,
            attempts: exhausted.attempts,
            last_error: Box::new(exhausted.last_error.into()),
        }
    }
}

impl PitrError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PitrError::Resolve(e) if e.is_not_yet_available() => ErrorClass::NotYetAvailable,
            PitrError::Resolve(_) => ErrorClass::ChainCorruption,
            PitrError::Parse(_) => ErrorClass::ChainCorruption,
            PitrError::Catalog(catalog::CatalogError::Unavailable { .. }) => {
                ErrorClass::NotYetAvailable
            }
            PitrError::Catalog(_) => ErrorClass::Remote,
            PitrError::Staging(e) if e.is_not_yet_available() => ErrorClass::NotYetAvailable,
            PitrError::Staging(e) if e.is_local_corruption() => {
                ErrorClass::LocalStagingCorruption
            }
            PitrError::Staging(_) => ErrorClass::Internal,
            PitrError::Client(_) | PitrError::Process(_) => ErrorClass::Remote,
            PitrError::Lease(_) => ErrorClass::PreconditionFailed,
            PitrError::Step(e) => e.class(),
            PitrError::GaveUp { last_error, .. } => last_error.class(),
            PitrError::WorkerLost(_)
            | PitrError::Io(_)
            | PitrError::Serialization(_)
            | PitrError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Only missing artifacts are worth a fresh attempt
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::NotYetAvailable
    }
}
