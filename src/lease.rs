//! Scoped destination lease
//!
//! One recovery task per destination instance, enforced with an advisory
//! file lock. The lock is released when the lease is dropped, which covers
//! every exit path including panics and early error returns.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::node::NodeAddr;

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("another recovery task holds the lease on {target} (waited {waited:?})")]
    Busy { target: String, waited: Duration },

    #[error("cannot open lease file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive claim on one destination instance
#[derive(Debug)]
pub struct DestinationLease {
    file: File,
    path: PathBuf,
    target: NodeAddr,
}

impl DestinationLease {
    /// `{lock_dir}/pitr-{ip}_{port}.lock`
    pub fn lock_path(lock_dir: &Path, target: &NodeAddr) -> PathBuf {
        lock_dir.join(format!("pitr-{}.lock", target.slug()))
    }

    /// Take the lease, waiting up to `timeout` for a current holder to finish
    pub async fn acquire(
        lock_dir: &Path,
        target: &NodeAddr,
        holder: &str,
        timeout: Duration,
    ) -> Result<Self, LeaseError> {
        let path = Self::lock_path(lock_dir, target);
        let io_error = |source| LeaseError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(lock_dir).map_err(io_error)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        let started = Instant::now();
        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        warn!(target = %target, waited = ?waited, "Destination lease is busy");
                        return Err(LeaseError::Busy {
                            target: target.to_string(),
                            waited,
                        });
                    }
                    if !announced {
                        info!(target = %target, "Waiting for destination lease");
                        announced = true;
                    }
                    tokio::time::sleep(RETRY_INTERVAL.min(timeout - waited)).await;
                }
                Err(e) => return Err(io_error(e)),
            }
        }

        // Holder info is for operators only
        let _ = file.set_len(0);
        let _ = writeln!(file, "{holder} pid={}", std::process::id());

        debug!(target = %target, path = %path.display(), "Destination lease acquired");
        Ok(Self {
            file,
            path,
            target: target.clone(),
        })
    }

    pub fn target(&self) -> &NodeAddr {
        &self.target
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DestinationLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release destination lease");
        } else {
            debug!(target = %self.target, "Destination lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out_then_succeeds_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = NodeAddr::new("10.0.0.5", 30000);

        let lease = DestinationLease::acquire(dir.path(), &target, "task-a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(lease.path().ends_with("pitr-10.0.0.5_30000.lock"));

        let busy =
            DestinationLease::acquire(dir.path(), &target, "task-b", Duration::from_millis(300))
                .await;
        assert!(matches!(busy, Err(LeaseError::Busy { .. })));

        drop(lease);
        let again =
            DestinationLease::acquire(dir.path(), &target, "task-b", Duration::from_millis(300))
                .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_targets_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let a = NodeAddr::new("10.0.0.5", 30000);
        let b = NodeAddr::new("10.0.0.5", 30001);
        let _la = DestinationLease::acquire(dir.path(), &a, "t", Duration::ZERO).await.unwrap();
        let _lb = DestinationLease::acquire(dir.path(), &b, "t", Duration::ZERO).await.unwrap();
    }
}
