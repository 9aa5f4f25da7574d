//! Binlog replay into the target
//!
//! Each binlog is filtered by the engine's log reader into a command stream,
//! then piped into the target with the command line client. Files of one
//! chain are applied strictly in sequence order; each builds on the state the
//! previous one left.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument};

use super::StepError;
use crate::config::ToolPaths;
use crate::engine_kind::{EngineKind, ReplayStart};
use crate::node::NodeAddr;
use crate::observability;
use crate::process::{CommandSpec, ProcessControl};
use crate::resolve::shard_label;
use crate::staging::{StagedBinlog, StagedChain};
use crate::PitrError;

/// Time format the log readers accept
pub const REPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Shared, cheaply clonable settings for replay workers
#[derive(Clone)]
pub struct ReplayContext {
    pub process: Arc<dyn ProcessControl>,
    pub tools: ToolPaths,
    pub engine: EngineKind,
    pub target: NodeAddr,
    pub password: Option<String>,
    pub tool_timeout: Duration,
    /// The full backup's creation time
    pub anchor: NaiveDateTime,
    /// Recovery target plus epsilon
    pub end: NaiveDateTime,
}

impl ReplayContext {
    /// Log reader invocation for the `position`-th file of a chain
    pub fn filter_command(
        &self,
        binlog: &StagedBinlog,
        position: usize,
        start_position: u64,
    ) -> (CommandSpec, PathBuf) {
        let filtered = filtered_path(binlog);
        let mut spec = CommandSpec::new(self.engine.log_reader(&self.tools), self.tool_timeout)
            .arg(format!("--logfile={}", binlog.path.display()))
            .arg("--mode=aof");
        spec = match self.engine.replay_start() {
            ReplayStart::BinlogPosition => {
                let from = if position == 0 { start_position } else { 0 };
                spec.arg(format!("--start-position={from}"))
            }
            ReplayStart::AnchorTime => spec.arg(format!(
                "--start-datetime={}",
                self.anchor.format(REPLAY_TIME_FORMAT)
            )),
        };
        let spec = spec
            .arg(format!("--end-datetime={}", self.end.format(REPLAY_TIME_FORMAT)))
            .with_stdout_file(&filtered);
        (spec, filtered)
    }

    /// `cli -h {ip} -p {port} [-a {password}] --pipe < filtered`
    pub fn import_command(&self, filtered: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.tools.cli, self.tool_timeout)
            .args(["-h".to_string(), self.target.ip.clone()])
            .args(["-p".to_string(), self.target.port.to_string()]);
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            spec = spec.args(["-a", password]);
        }
        spec.arg("--pipe").with_stdin_file(filtered)
    }
}

fn filtered_path(binlog: &StagedBinlog) -> PathBuf {
    let mut name = binlog
        .path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".aof");
    binlog.path.with_file_name(name)
}

/// Replay one shard's staged chain; returns the number of files applied
#[instrument(skip(ctx, chain), fields(shard = %shard_label(chain.shard_index), files = chain.files.len()))]
pub async fn replay_chain(
    ctx: &ReplayContext,
    chain: &StagedChain,
    start_position: u64,
) -> Result<usize, PitrError> {
    let shard_index = chain.shard_index;
    let replay_error = |file: &str, source| StepError::Replay {
        shard_index,
        file: file.to_string(),
        source,
    };

    for (position, binlog) in chain.files.iter().enumerate() {
        let file = binlog.descriptor.file_name.as_str();
        let (filter, filtered) = ctx.filter_command(binlog, position, start_position);
        debug!(file, index = binlog.descriptor.sequence_index, "Filtering binlog");
        ctx.process
            .run_checked(&filter)
            .await
            .map_err(|e| replay_error(file, e))?;

        let import = ctx.import_command(&filtered);
        ctx.process
            .run_checked(&import)
            .await
            .map_err(|e| replay_error(file, e))?;

        match tokio::fs::remove_file(&filtered).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        observability::record_binlog_replayed(&ctx.engine.to_string());
    }

    info!(
        first = ?chain.files.first().map(|b| b.descriptor.sequence_index),
        last = ?chain.files.last().map(|b| b.descriptor.sequence_index),
        "Chain replayed"
    );
    Ok(chain.files.len())
}
