// =============================================================================
// Warmup Pool — bounded workers for advisory cache writes
// =============================================================================
//
// Fire-and-forget cache population must not add latency to the foreground
// path, so jobs are handed to a bounded channel drained by a fixed set of
// workers.  When the channel is full the job is dropped (the cache will be
// populated on the next natural lookup).  Shutdown closes the channel and
// joins the workers within a bounded deadline.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type WarmupJob = Box<dyn FnOnce() + Send + 'static>;

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupStats {
    pub submitted: u64,
    pub dropped: u64,
    pub completed: u64,
}

/// A bounded pool of warmup workers.
pub struct WarmupPool {
    tx: parking_lot::Mutex<Option<mpsc::Sender<WarmupJob>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    submitted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

/// Jobs queued beyond this bound are dropped.
const QUEUE_DEPTH: usize = 64;

impl WarmupPool {
    /// Spawn `concurrency` worker tasks draining a bounded queue.
    pub fn new(concurrency: usize) -> Self {
        let (tx, rx) = mpsc::channel::<WarmupJob>(QUEUE_DEPTH);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let completed = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(concurrency.max(1));

        for worker_id in 0..concurrency.max(1) {
            let rx = rx.clone();
            let completed = completed.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => {
                            job();
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            debug!(worker_id, "warmup worker draining complete");
                            break;
                        }
                    }
                }
            }));
        }

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            submitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            completed,
        }
    }

    /// Submit an advisory job. Returns `false` (and drops the job) when the
    /// queue is full or the pool is shutting down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .tx
            .lock()
            .as_ref()
            .map(|tx| tx.try_send(Box::new(job)).is_ok())
            .unwrap_or(false);
        if !sent {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("warmup queue unavailable — job dropped");
        }
        sent
    }

    /// Close the queue and wait for the workers to drain, bounded by
    /// `deadline`.
    pub async fn shutdown(&self, deadline: std::time::Duration) {
        drop(self.tx.lock().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("warmup pool did not drain before the shutdown deadline");
        } else {
            info!("warmup pool drained");
        }
    }

    pub fn stats(&self) -> WarmupStats {
        WarmupStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn jobs_run_and_pool_drains_on_shutdown() {
        let pool = WarmupPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        pool.shutdown(std::time::Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn stats_track_submissions() {
        let pool = WarmupPool::new(1);
        pool.submit(|| {});
        pool.submit(|| {});
        let stats = pool.stats();
        assert_eq!(stats.submitted, 2);
        pool.shutdown(std::time::Duration::from_secs(5)).await;
    }
}
