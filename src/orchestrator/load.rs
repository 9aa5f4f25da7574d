//! Full backup load, one routine per load strategy

use std::path::Path;

use tracing::{info, instrument, warn};

use super::StepError;
use crate::client::EngineClient;
use crate::config::{EnvironmentConfig, RecoveryOptions};
use crate::engine_kind::{EngineKind, LoadStrategy};
use crate::node::NodeAddr;
use crate::process::{CommandSpec, ProcessControl};
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::PitrError;

const RDB_IMAGE: &str = "dump.rdb";
const AOF_IMAGE: &str = "appendonly.aof";

/// Everything a load needs to reach the target
pub struct LoadContext<'a> {
    pub client: &'a dyn EngineClient,
    pub process: &'a dyn ProcessControl,
    pub env: &'a EnvironmentConfig,
    pub options: &'a RecoveryOptions,
    pub target: &'a NodeAddr,
}

/// Load the staged full backup at `staged` into the target and wait until it answers
#[instrument(skip(ctx), fields(target = %ctx.target, staged = %staged.display()))]
pub async fn load_full(
    engine: EngineKind,
    ctx: &LoadContext<'_>,
    staged: &Path,
) -> Result<(), PitrError> {
    match engine.load_strategy() {
        LoadStrategy::NativeRestoreCommand => {
            ctx.client.restore_backup(staged).await?;
        }
        LoadStrategy::RestoreToolThenStart => {
            stop_instance(ctx).await?;
            let data_dir = ctx.env.instance_data_dir(ctx.target.port);
            let restore = CommandSpec::new(&ctx.env.tools.ssd_restore, ctx.options.full_load_timeout())
                .args([
                    "--backup-dir".to_string(),
                    staged.display().to_string(),
                    "--data-dir".to_string(),
                    data_dir.display().to_string(),
                ])
                .with_run_as(&ctx.env.process_user);
            ctx.process.run_checked(&restore).await?;
            start_instance(ctx).await?;
        }
        LoadStrategy::ReplaceImageThenStart => {
            stop_instance(ctx).await?;
            let aof = place_image(ctx, staged).await?;
            let conf = ctx.env.instance_config_file(ctx.target.port);
            rewrite_persistence_mode(&conf, aof).await?;
            start_instance(ctx).await?;
        }
    }

    wait_until_pingable(ctx.client, ctx.options).await?;
    info!("Full backup loaded");
    Ok(())
}

/// Poll `PING` at a fixed interval until the target answers
pub async fn wait_until_pingable(
    client: &dyn EngineClient,
    options: &RecoveryOptions,
) -> Result<(), PitrError> {
    let executor = RetryExecutor::new(RetryConfig::polling(
        options.ping_max_attempts,
        options.poll_interval(),
        options.progress_log_every,
    ));
    executor.execute("ping", || client.ping()).await?;
    Ok(())
}

async fn stop_instance(ctx: &LoadContext<'_>) -> Result<(), PitrError> {
    let spec = CommandSpec::stop_instance(
        &ctx.env.tools,
        ctx.target.port,
        ctx.options.metadata_timeout(),
    )
    .with_run_as(&ctx.env.process_user);
    let output = ctx.process.run(&spec).await?;
    if !output.success() {
        // Already stopped instances make the script exit non-zero
        warn!(code = ?output.code, stderr = %output.stderr.trim(), "Stop script reported failure");
    }
    Ok(())
}

async fn start_instance(ctx: &LoadContext<'_>) -> Result<(), PitrError> {
    let spec = CommandSpec::start_instance(
        &ctx.env.tools,
        ctx.target.port,
        ctx.options.metadata_timeout(),
    )
    .with_run_as(&ctx.env.process_user);
    ctx.process.run_checked(&spec).await?;
    Ok(())
}

/// Move the staged image into the data directory; returns true for AOF images
async fn place_image(ctx: &LoadContext<'_>, staged: &Path) -> Result<bool, PitrError> {
    let aof = staged.extension().and_then(|e| e.to_str()) == Some("aof");
    let data_dir = ctx.env.instance_data_dir(ctx.target.port);
    tokio::fs::create_dir_all(&data_dir).await?;

    for stale in [RDB_IMAGE, AOF_IMAGE] {
        let path = data_dir.join(stale);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), "Removed previous image"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let dest = data_dir.join(if aof { AOF_IMAGE } else { RDB_IMAGE });
    move_file(staged, &dest).await.map_err(|e| StepError::Load {
        reason: format!("cannot move {} to {}: {e}", staged.display(), dest.display()),
    })?;
    info!(image = %dest.display(), aof, "Image placed");
    Ok(aof)
}

/// Rename, falling back to copy and remove across file systems
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Set `appendonly yes|no` in an instance config file, appending it if absent
pub async fn rewrite_persistence_mode(conf: &Path, aof: bool) -> Result<(), PitrError> {
    let text = match tokio::fs::read_to_string(conf).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    tokio::fs::write(conf, set_appendonly(&text, aof)).await?;
    Ok(())
}

fn set_appendonly(text: &str, aof: bool) -> String {
    let directive = format!("appendonly {}", if aof { "yes" } else { "no" });
    let mut replaced = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            let key = line.split_whitespace().next().unwrap_or_default();
            if key.eq_ignore_ascii_case("appendonly") {
                replaced = true;
                directive.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(directive);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_appendonly_replaces_existing() {
        let conf = "port 30000\nappendonly no\nappendfsync everysec\n";
        assert_eq!(
            set_appendonly(conf, true),
            "port 30000\nappendonly yes\nappendfsync everysec\n"
        );
    }

    #[test]
    fn test_set_appendonly_appends_when_missing() {
        assert_eq!(set_appendonly("port 30000\n", false), "port 30000\nappendonly no\n");
        assert_eq!(set_appendonly("", true), "appendonly yes\n");
    }

    #[tokio::test]
    async fn test_rewrite_persistence_mode_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("redis.conf");
        rewrite_persistence_mode(&conf, true).await.unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "appendonly yes\n");
    }
}
