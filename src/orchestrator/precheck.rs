//! Target preparation: hard preconditions, then the wipe

use tracing::{info, instrument, warn};

use super::StepError;
use crate::client::EngineClient;
use crate::config::RecoveryOptions;
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::PitrError;

const COMMANDS_PROCESSED: &str = "total_commands_processed";

/// Refuse targets that are still replicas or that serve live clients
///
/// Neither condition is retried: restoring over either would destroy data
/// someone is using.
#[instrument(skip(client, options), fields(target = %client.addr()))]
pub async fn check_preconditions(
    client: &dyn EngineClient,
    options: &RecoveryOptions,
) -> Result<(), PitrError> {
    let role = client.role().await?;
    if !role.is_master() {
        return Err(StepError::NotMaster {
            target: client.addr().to_string(),
            role: format!("{role:?}"),
        }
        .into());
    }

    let window = options.traffic_sniff();
    let before = commands_processed(client).await?;
    tokio::time::sleep(window).await;
    let after = commands_processed(client).await?;

    let delta = after.saturating_sub(before);
    if delta > options.traffic_allowance {
        return Err(StepError::LiveTraffic {
            target: client.addr().to_string(),
            delta,
            window,
        }
        .into());
    }

    info!(delta, window = ?window, "Target is an idle master");
    Ok(())
}

async fn commands_processed(client: &dyn EngineClient) -> Result<u64, PitrError> {
    let stats = client.info("stats").await?;
    stats
        .get(COMMANDS_PROCESSED)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            crate::client::ClientError::UnexpectedReply {
                addr: client.addr().to_string(),
                command: "INFO stats".to_string(),
                reply: format!("no {COMMANDS_PROCESSED} field"),
            }
            .into()
        })
}

/// Erase all data and, for clustered engines, leave the cluster
///
/// The detach has converged once the target sees only itself. Until then the
/// whole step is retried with backoff.
#[instrument(skip(client, options), fields(target = %client.addr()))]
pub async fn wipe_target(
    client: &dyn EngineClient,
    clustered: bool,
    options: &RecoveryOptions,
) -> Result<(), PitrError> {
    let executor = RetryExecutor::new(RetryConfig::backoff(
        options.wipe_max_attempts,
        options.wipe_initial_delay(),
    ));

    executor
        .execute("wipe", || wipe_once(client, clustered))
        .await?;

    info!(clustered, "Target wiped");
    Ok(())
}

async fn wipe_once(client: &dyn EngineClient, clustered: bool) -> Result<(), PitrError> {
    client.flush_all().await?;
    if !clustered {
        return Ok(());
    }
    client.cluster_reset(true).await?;
    let nodes = client.topology().await?;
    if nodes.len() != 1 {
        warn!(nodes = nodes.len(), "Cluster detach has not converged");
        return Err(StepError::DetachNotConverged {
            target: client.addr().to_string(),
            nodes: nodes.len(),
        }
        .into());
    }
    Ok(())
}
