use changeflow_config::shared::{BatchConfig, SchedulerConfig};
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info};

use crate::apply::MergeApplier;
use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ChangeflowResult, ErrorKind};
use crate::scheduler::registry::{JobDefinition, JobRegistry, JobRun, JobState, RunTrigger};
use crate::store::cursor::CursorStore;
use crate::store::log::ChangeLogStore;
use crate::store::table::TableStore;
use crate::types::JobId;
use crate::view::ChangeView;
use crate::workers::job::{JobWorker, run_job_cycle};
use crate::workers::merge::MergeCycle;
use crate::workers::pool::JobWorkerPool;

/// Drives merge jobs on their schedules.
///
/// Every registered job gets its own worker task. The lifecycle of jobs lives in the injected
/// [`JobRegistry`]: workers idle until their job is resumed and exit once it is dropped.
#[derive(Debug)]
pub struct Scheduler<S, C> {
    registry: JobRegistry,
    cycle: MergeCycle<S, C>,
    view: ChangeView<S, C>,
    pool: JobWorkerPool,
    shutdown_tx: ShutdownTx,
    shutdown_timeout: Duration,
}

impl<S, C> Scheduler<S, C>
where
    S: TableStore + ChangeLogStore + Clone + Send + Sync + 'static,
    C: CursorStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: JobRegistry,
        view: ChangeView<S, C>,
        applier: MergeApplier<S>,
        batch_config: &BatchConfig,
        scheduler_config: &SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            registry,
            cycle: MergeCycle::new(view.clone(), applier, Some(batch_config.max_size)),
            view,
            pool: JobWorkerPool::new(),
            shutdown_tx,
            shutdown_timeout: Duration::from_millis(scheduler_config.shutdown_timeout_ms),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Registers the job's consumer with the view, adds the job to the registry and spawns its
    /// worker. The job stays idle until [`Scheduler::resume`] is called.
    ///
    /// Registering the id of a dropped job replaces it; a worker of the dropped job still running
    /// is stopped before the new worker starts.
    pub async fn register_job(&self, definition: JobDefinition) -> ChangeflowResult<()> {
        if self.shutdown_tx.is_shutdown() {
            bail!(
                ErrorKind::InvalidState,
                "Scheduler is shut down",
                format!("Job `{}` cannot be registered after shutdown", definition.id)
            );
        }

        self.view
            .register_consumer(
                definition.consumer.clone(),
                definition.source_table.clone(),
                definition.mode,
            )
            .await?;

        let job_id = definition.id.clone();
        let generation = self.registry.create(definition).await?;

        let worker = JobWorker::new(
            job_id.clone(),
            generation,
            self.registry.clone(),
            self.cycle.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.pool.spawn(job_id, worker.run()).await;

        Ok(())
    }

    pub async fn resume(&self, job_id: &JobId) -> ChangeflowResult<()> {
        self.registry.resume(job_id).await
    }

    pub async fn suspend(&self, job_id: &JobId) -> ChangeflowResult<()> {
        self.registry.suspend(job_id).await
    }

    pub async fn drop_job(&self, job_id: &JobId) -> ChangeflowResult<()> {
        self.registry.drop_job(job_id).await
    }

    /// Returns `true` while the worker task of the job is running.
    pub async fn has_active_worker(&self, job_id: &JobId) -> bool {
        self.pool.has_active_worker(job_id).await
    }

    /// Runs one cycle of the job now, whatever its schedule and unless it is dropped.
    ///
    /// The run is recorded in the job's history like a scheduled one.
    pub async fn execute_now(&self, job_id: &JobId) -> ChangeflowResult<JobRun> {
        let status = self.registry.status(job_id).await?;
        if status.state == JobState::Dropped {
            bail!(
                ErrorKind::InvalidState,
                "Job is dropped",
                format!("Job `{job_id}` was dropped and cannot be executed")
            );
        }

        info!(job = %job_id, "executing job manually");

        run_job_cycle(
            &self.registry,
            &self.cycle,
            &status.definition,
            RunTrigger::Manual,
            Utc::now(),
        )
        .await
    }

    /// Stops every worker and waits for them.
    ///
    /// Cycles in progress are given the configured shutdown timeout to finish; workers still running
    /// after it are aborted, rolling back their cycle. Errors of every worker are aggregated.
    pub async fn shutdown_and_wait(&self) -> ChangeflowResult<()> {
        info!("shutting down scheduler");
        self.shutdown_tx.shutdown();

        let result = self.pool.wait_all(Some(self.shutdown_timeout)).await;
        if let Err(err) = &result {
            error!(error = %err, "job workers completed with errors");
        }

        result
    }
}
