//! Per-shard worker fan-out
//!
//! Each shard runs on its own task, bounded by a semaphore. Every worker
//! reports through its own oneshot channel, and no result is looked at until
//! all workers have joined, so an early failure never cuts another shard's
//! diagnostics short.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::resolve::shard_label;

/// A shard worker that ended without reporting
#[derive(Error, Debug, Clone, PartialEq)]
#[error("worker for shard {} ended without a result: {reason}", shard_label(*.shard_index))]
pub struct WorkerLost {
    pub shard_index: i32,
    pub reason: String,
}

/// What one shard worker produced
#[derive(Debug)]
pub struct ShardOutcome<T, E> {
    pub shard_index: i32,
    pub result: Result<T, E>,
    pub elapsed: Duration,
}

/// Bounded concurrent execution of one job per shard
#[derive(Debug, Clone)]
pub struct ShardFanout {
    concurrency_limit: usize,
}

impl Default for ShardFanout {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl ShardFanout {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Run `worker` once per shard and return every outcome in `shards` order
    #[instrument(skip(self, shards, worker), fields(shards = shards.len()))]
    pub async fn run<F, Fut, T, E>(
        &self,
        step: &str,
        shards: &[i32],
        worker: F,
    ) -> Vec<ShardOutcome<T, E>>
    where
        F: Fn(i32) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<WorkerLost> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut receivers = Vec::with_capacity(shards.len());
        let mut handles = Vec::with_capacity(shards.len());

        for &shard_index in shards {
            let (tx, rx) = oneshot::channel();
            let job = worker(shard_index);
            let sem = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return;
                };
                debug!(shard = %shard_label(shard_index), "Shard worker started");
                let started = Instant::now();
                let result = job.await;
                let _ = tx.send((result, started.elapsed()));
            }));
            receivers.push((shard_index, rx));
        }

        // Barrier: every worker joins before any result is inspected
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Shard worker panicked");
            }
        }

        let mut outcomes = Vec::with_capacity(receivers.len());
        let mut failed = 0;
        for (shard_index, mut rx) in receivers {
            let outcome = match rx.try_recv() {
                Ok((result, elapsed)) => ShardOutcome {
                    shard_index,
                    result,
                    elapsed,
                },
                Err(e) => ShardOutcome {
                    shard_index,
                    result: Err(E::from(WorkerLost {
                        shard_index,
                        reason: e.to_string(),
                    })),
                    elapsed: Duration::ZERO,
                },
            };
            if outcome.result.is_err() {
                failed += 1;
            }
            outcomes.push(outcome);
        }

        info!(step, total = outcomes.len(), failed, "Shard fan-out joined");
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(i32),
        Lost,
    }

    impl From<WorkerLost> for TestError {
        fn from(_: WorkerLost) -> Self {
            TestError::Lost
        }
    }

    #[tokio::test]
    async fn test_early_failure_does_not_hide_other_shards() {
        let fanout = ShardFanout::new(2);
        let outcomes = fanout
            .run("test", &[0, 1, 2, 3], |shard| async move {
                if shard == 0 {
                    return Err(TestError::Failed(shard));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                if shard == 2 {
                    Err(TestError::Failed(shard))
                } else {
                    Ok(shard * 10)
                }
            })
            .await;

        let shards: Vec<i32> = outcomes.iter().map(|o| o.shard_index).collect();
        assert_eq!(shards, vec![0, 1, 2, 3]);
        assert_eq!(outcomes[0].result, Err(TestError::Failed(0)));
        assert_eq!(outcomes[1].result, Ok(10));
        assert_eq!(outcomes[2].result, Err(TestError::Failed(2)));
        assert_eq!(outcomes[3].result, Ok(30));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let fanout = ShardFanout::new(2);

        let outcomes = fanout
            .run("bounded", &[0, 1, 2, 3, 4, 5], |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                }
            })
            .await;

        assert_eq!(outcomes.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported() {
        let fanout = ShardFanout::new(4);
        let outcomes = fanout
            .run("panics", &[0, 1], |shard| async move {
                if shard == 1 {
                    panic!("boom");
                }
                Ok::<_, TestError>(shard)
            })
            .await;
        assert_eq!(outcomes[0].result, Ok(0));
        assert_eq!(outcomes[1].result, Err(TestError::Lost));
    }
}
