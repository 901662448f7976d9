//! Per-user FIFO lanes for background agent work.
//!
//! One lane per user: jobs submitted for the same user run one at a time, in
//! submission order; lanes for different users run in parallel. Lanes carry
//! no persistent state — on restart, outstanding work is lost and re-derived
//! from the durable cache pool and storyboard cursors.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedJob {
    label: &'static str,
    fut: Job,
}

/// Registry of per-user serial executors.
pub struct TaskLanes {
    lanes: DashMap<String, mpsc::UnboundedSender<QueuedJob>>,
    shutdown: CancellationToken,
}

impl TaskLanes {
    /// `shutdown` stops every lane worker at its next idle point; running
    /// jobs are expected to watch the same token at their own suspension
    /// points.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            lanes: DashMap::new(),
            shutdown,
        }
    }

    /// Submit a job for `user_id`. Returns immediately; the job runs after
    /// every previously submitted job for that user has finished (whether it
    /// succeeded, failed, or panicked).
    pub fn submit<F>(&self, user_id: &str, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            warn!(user_id, label, "lanes shut down, job dropped");
            return;
        }

        // Re-create the lane if its worker already exited (shutdown race).
        let mut job = Some(QueuedJob {
            label,
            fut: Box::pin(fut),
        });
        for _ in 0..2 {
            let Some(queued) = job.take() else { return };
            let tx = self
                .lanes
                .entry(user_id.to_string())
                .or_insert_with(|| self.spawn_lane(user_id))
                .clone();
            match tx.send(queued) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.lanes.remove(user_id);
                    job = Some(returned);
                }
            }
        }
        warn!(user_id, "lane worker unavailable, job dropped");
    }

    fn spawn_lane(&self, user_id: &str) -> mpsc::UnboundedSender<QueuedJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        let shutdown = self.shutdown.clone();
        let user = user_id.to_string();

        tokio::spawn(async move {
            debug!(user_id = %user, "lane worker started");
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                debug!(user_id = %user, label = job.label, "job started");
                // Each job gets its own task so a panic terminates only that
                // job, never the lane.
                if let Err(e) = tokio::spawn(job.fut).await {
                    error!(user_id = %user, label = job.label, "background job panicked: {e}");
                }
            }
            info!(user_id = %user, "lane worker stopped");
        });

        tx
    }
}
