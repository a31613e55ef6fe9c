use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::changeflow_error;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::types::JobId;

/// Internal state for [`JobWorkerPool`].
#[derive(Debug)]
struct JobWorkerPoolInner {
    /// Running job workers indexed by job.
    active: HashMap<JobId, AbortHandle>,
    /// Owns all spawned worker tasks.
    join_set: JoinSet<(JobId, ChangeflowResult<()>)>,
}

/// Tracks the background task of every job.
#[derive(Debug, Clone)]
pub struct JobWorkerPool {
    inner: Arc<Mutex<JobWorkerPoolInner>>,
}

impl JobWorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(JobWorkerPoolInner {
                active: HashMap::new(),
                join_set: JoinSet::new(),
            })),
        }
    }

    /// Spawns the worker of `job_id`.
    ///
    /// A previous worker of the same job is replaced. One still running belongs to a dropped
    /// generation of the job and is aborted; a cycle it had in progress is rolled back with its
    /// target transaction.
    pub async fn spawn<F>(&self, job_id: JobId, future: F)
    where
        F: Future<Output = ChangeflowResult<()>> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        let JobWorkerPoolInner { active, join_set } = &mut *inner;

        let task_job_id = job_id.clone();
        let spawn = |join_set: &mut JoinSet<_>| {
            join_set.spawn(async move {
                let result = future.await;
                (task_job_id, result)
            })
        };

        match active.entry(job_id) {
            Entry::Vacant(entry) => {
                debug!(job = %entry.key(), "spawned job worker");
                entry.insert(spawn(join_set));
            }
            Entry::Occupied(mut entry) => {
                if entry.get().is_finished() {
                    debug!(job = %entry.key(), "replaced finished job worker");
                } else {
                    warn!(job = %entry.key(), "aborting job worker of a replaced job");
                    entry.get().abort();
                }
                entry.insert(spawn(join_set));
            }
        }
    }

    pub async fn has_active_worker(&self, job_id: &JobId) -> bool {
        let inner = self.inner.lock().await;

        inner
            .active
            .get(job_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits for every spawned worker and collects their errors.
    ///
    /// Workers still running once `timeout` elapsed are aborted; a worker aborted in the middle of a
    /// cycle drops its target transaction, so nothing of that cycle is applied. Panicked workers are
    /// reported as [`ErrorKind::JobWorkerPanic`]; aborted ones are ignored.
    pub async fn wait_all(&self, timeout: Option<Duration>) -> ChangeflowResult<()> {
        let mut join_set = {
            let mut inner = self.inner.lock().await;
            mem::take(&mut inner.join_set)
        };
        let mut deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut errors = Vec::new();
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, join_set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            remaining = join_set.len(),
                            "job workers did not stop in time, aborting them"
                        );
                        join_set.abort_all();
                        deadline = None;
                        continue;
                    }
                },
                None => join_set.join_next().await,
            };

            let Some(result) = next else {
                break;
            };

            match result {
                Ok((job_id, worker_result)) => {
                    // The handle may already belong to the worker of a newer generation.
                    let mut inner = self.inner.lock().await;
                    if inner
                        .active
                        .get(&job_id)
                        .is_some_and(|handle| handle.is_finished())
                    {
                        inner.active.remove(&job_id);
                    }
                    drop(inner);

                    if let Err(err) = worker_result {
                        error!(job = %job_id, error = %err, "job worker completed with error");
                        errors.push(err);
                    }
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("job worker task was cancelled");
                    } else {
                        errors.push(changeflow_error!(
                            ErrorKind::JobWorkerPanic,
                            "Job worker panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        self.inner.lock().await.active.clear();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

impl Default for JobWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
