use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::changeflow_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::scheduler::registry::{
    JobDefinition, JobRegistry, JobRun, JobState, RunOutcome, RunTrigger, SkipReason,
};
use crate::scheduler::timer::sleep_until_date_time;
use crate::store::cursor::CursorStore;
use crate::store::log::ChangeLogStore;
use crate::store::table::TableStore;
use crate::types::JobId;
use crate::workers::merge::{CycleOutcome, MergeCycle};

/// Runs one cycle of `definition` and records it in the registry.
///
/// Shared by scheduled ticks and manual executions. A cycle is skipped with
/// [`SkipReason::Overlap`] while another run of the same job holds the run permit. Failures are
/// recorded, not returned; the returned error only covers the registry itself.
pub(crate) async fn run_job_cycle<S, C>(
    registry: &JobRegistry,
    cycle: &MergeCycle<S, C>,
    definition: &JobDefinition,
    trigger: RunTrigger,
    scheduled_at: DateTime<Utc>,
) -> ChangeflowResult<JobRun>
where
    S: TableStore + ChangeLogStore + Clone + Send + Sync,
    C: CursorStore + Clone + Send + Sync,
{
    let started_at = Utc::now();

    let Some(permit) = registry.try_begin_run(&definition.id).await? else {
        warn!(job = %definition.id, "previous run still in progress, skipping");

        let run = JobRun {
            run_id: Uuid::new_v4(),
            job_id: definition.id.clone(),
            attempt: 0,
            trigger,
            scheduled_at,
            started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::Skipped(SkipReason::Overlap),
        };
        registry.record_run(run.clone()).await?;

        return Ok(run);
    };

    let run_id = Uuid::new_v4();
    let attempt = permit.attempt();
    let span = tracing::info_span!(
        "merge_cycle",
        job = %definition.id,
        %run_id,
        attempt,
        trigger = ?trigger
    );

    let result = async {
        match definition.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, cycle.run(definition)).await {
                Ok(result) => result,
                Err(_) => Err(changeflow_error!(
                    ErrorKind::JobTimeout,
                    "Merge cycle timed out",
                    format!(
                        "The cycle of job `{}` did not finish within {}ms and was rolled back",
                        definition.id,
                        timeout.as_millis()
                    )
                )),
            },
            None => cycle.run(definition).await,
        }
    }
    .instrument(span.clone())
    .await;

    let outcome = match result {
        Ok(CycleOutcome::Merged(summary)) => {
            span.in_scope(|| info!(%summary, "merge cycle succeeded"));
            RunOutcome::Succeeded(summary)
        }
        Ok(CycleOutcome::NoData) => {
            span.in_scope(|| debug!("merge cycle skipped, no data"));
            RunOutcome::Skipped(SkipReason::NoData)
        }
        Err(err) => {
            if err.is_retryable() {
                span.in_scope(|| warn!(error = %err, "merge cycle failed, retrying on next tick"));
            } else {
                span.in_scope(|| error!(error = %err, "merge cycle failed"));
            }

            RunOutcome::Failed {
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    };

    let run = JobRun {
        run_id,
        job_id: definition.id.clone(),
        attempt,
        trigger,
        scheduled_at,
        started_at,
        finished_at: Utc::now(),
        outcome,
    };

    // Released before recording so that waiters on the run see the job idle.
    drop(permit);
    registry.record_run(run.clone()).await?;

    Ok(run)
}

/// Background task driving one job on its schedule.
///
/// The worker idles while its job is created or suspended, ticks while it is started and exits once
/// the job is dropped or shutdown is requested. A tick in progress always completes before the
/// worker reacts to either. A worker is bound to one generation of its job: once the job id is
/// created again after a drop, the old worker treats its job as dropped.
#[derive(Debug)]
pub struct JobWorker<S, C> {
    job_id: JobId,
    generation: u64,
    registry: JobRegistry,
    cycle: MergeCycle<S, C>,
    shutdown_rx: ShutdownRx,
}

impl<S, C> JobWorker<S, C>
where
    S: TableStore + ChangeLogStore + Clone + Send + Sync + 'static,
    C: CursorStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        job_id: JobId,
        generation: u64,
        registry: JobRegistry,
        cycle: MergeCycle<S, C>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            job_id,
            generation,
            registry,
            cycle,
            shutdown_rx,
        }
    }

    /// Runs the worker loop until the job is dropped or shutdown is requested.
    pub async fn run(mut self) -> ChangeflowResult<()> {
        let span = tracing::info_span!(
            "job_worker",
            job = %self.job_id,
            generation = self.generation
        );

        async move {
            info!("starting job worker");

            let status = self.registry.status(&self.job_id).await?;
            if status.generation != self.generation {
                info!("job was replaced before its worker started");
                return Ok(());
            }
            let definition: Arc<JobDefinition> = status.definition;
            let mut state_rx = self.registry.subscribe_state();
            let mut next_tick: Option<DateTime<Utc>> = None;

            loop {
                if self.shutdown_rx.is_shutdown() {
                    break;
                }

                // Marks the current version as seen, so only later changes wake the loop up.
                state_rx.borrow_and_update();

                match self
                    .registry
                    .generation_state(&self.job_id, self.generation)
                    .await?
                {
                    JobState::Dropped => {
                        info!("job dropped");
                        break;
                    }
                    JobState::Created | JobState::Suspended => {
                        next_tick = None;

                        tokio::select! {
                            biased;
                            _ = self.shutdown_rx.wait_for_shutdown() => break,
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    JobState::Started => {
                        let scheduled_at = match next_tick {
                            Some(scheduled_at) => scheduled_at,
                            None => {
                                let Some(scheduled_at) = definition.schedule.next_after(Utc::now())
                                else {
                                    warn!(schedule = %definition.schedule, "schedule never fires again");
                                    self.shutdown_rx.wait_for_shutdown().await;
                                    break;
                                };

                                self.registry
                                    .set_next_run(&self.job_id, Some(scheduled_at))
                                    .await?;
                                next_tick = Some(scheduled_at);
                                scheduled_at
                            }
                        };

                        tokio::select! {
                            biased;
                            _ = self.shutdown_rx.wait_for_shutdown() => break,
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = sleep_until_date_time(scheduled_at) => {
                                next_tick = None;
                                run_job_cycle(
                                    &self.registry,
                                    &self.cycle,
                                    &definition,
                                    RunTrigger::Schedule,
                                    scheduled_at,
                                )
                                .await?;
                            }
                        }
                    }
                }
            }

            info!("job worker stopped");

            Ok(())
        }
        .instrument(span)
        .await
    }
}
