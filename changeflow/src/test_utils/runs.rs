use std::time::Duration;
use tokio::time::timeout;

use crate::scheduler::{JobRegistry, JobRun, RunOutcome};
use crate::types::JobId;

/// Time tests wait for an expected state before failing.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits until the registry holds at least `count` runs of `job_id` matching `filter` and returns
/// all runs of the job.
///
/// # Panics
///
/// Panics if the runs are not recorded within [`DEFAULT_WAIT_TIMEOUT`] or the job is unknown.
pub async fn wait_for_matching_runs<F>(
    registry: &JobRegistry,
    job_id: &JobId,
    count: usize,
    filter: F,
) -> Vec<JobRun>
where
    F: Fn(&JobRun) -> bool,
{
    let mut runs_rx = registry.subscribe_runs();

    let wait = async {
        loop {
            runs_rx.borrow_and_update();

            let runs = registry.runs(job_id).await.unwrap();
            if runs.iter().filter(|run| filter(run)).count() >= count {
                return runs;
            }

            if runs_rx.changed().await.is_err() {
                panic!("job registry was dropped while waiting for runs of `{job_id}`");
            }
        }
    };

    match timeout(DEFAULT_WAIT_TIMEOUT, wait).await {
        Ok(runs) => runs,
        Err(_) => panic!(
            "timed out after {DEFAULT_WAIT_TIMEOUT:?} waiting for {count} runs of `{job_id}`"
        ),
    }
}

/// Waits until at least `count` runs of `job_id` are recorded.
pub async fn wait_for_runs(registry: &JobRegistry, job_id: &JobId, count: usize) -> Vec<JobRun> {
    wait_for_matching_runs(registry, job_id, count, |_| true).await
}

/// Waits until at least `count` runs of `job_id` merged a batch.
pub async fn wait_for_successful_runs(
    registry: &JobRegistry,
    job_id: &JobId,
    count: usize,
) -> Vec<JobRun> {
    wait_for_matching_runs(registry, job_id, count, |run| {
        matches!(run.outcome, RunOutcome::Succeeded(_))
    })
    .await
}
