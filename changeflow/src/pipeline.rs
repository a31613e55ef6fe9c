use changeflow_config::shared::ChangeflowConfig;
use std::sync::Arc;
use tracing::info;

use crate::apply::MergeApplier;
use crate::bail;
use crate::changelog::ChangeLog;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::scheduler::{JobDefinition, JobRegistry, Scheduler};
use crate::store::cursor::CursorStore;
use crate::store::log::ChangeLogStore;
use crate::store::table::TableStore;
use crate::view::ChangeView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    NotStarted,
    Started,
}

/// Wires the change log, the change view, the merge applier and the scheduler together from a
/// [`ChangeflowConfig`].
#[derive(Debug)]
pub struct Pipeline<S, C> {
    config: Arc<ChangeflowConfig>,
    store: S,
    change_log: ChangeLog<S>,
    view: ChangeView<S, C>,
    scheduler: Scheduler<S, C>,
    state: PipelineState,
}

impl<S, C> Pipeline<S, C>
where
    S: TableStore + ChangeLogStore + Clone + Send + Sync + 'static,
    C: CursorStore + Clone + Send + Sync + 'static,
{
    pub fn new(config: ChangeflowConfig, store: S, cursors: C) -> Self {
        let registry = JobRegistry::new(config.scheduler.run_history_capacity);
        let view = ChangeView::new(store.clone(), cursors);
        let applier = MergeApplier::new(store.clone());
        let scheduler = Scheduler::new(
            registry,
            view.clone(),
            applier,
            &config.batch,
            &config.scheduler,
        );

        Self {
            config: Arc::new(config),
            change_log: ChangeLog::new(store.clone()),
            store,
            view,
            scheduler,
            state: PipelineState::NotStarted,
        }
    }

    pub fn config(&self) -> &ChangeflowConfig {
        &self.config
    }

    /// Change log used to write to the source tables of the configured jobs.
    pub fn change_log(&self) -> &ChangeLog<S> {
        &self.change_log
    }

    pub fn view(&self) -> &ChangeView<S, C> {
        &self.view
    }

    pub fn scheduler(&self) -> &Scheduler<S, C> {
        &self.scheduler
    }

    pub fn registry(&self) -> &JobRegistry {
        self.scheduler.registry()
    }

    /// Validates the configuration, prepares the tables of every job and starts the jobs.
    ///
    /// Source tables get change tracking enabled and missing target tables are created. Every job
    /// definition is parsed before the first job is registered, so an invalid schedule leaves the
    /// scheduler untouched.
    pub async fn start(&mut self) -> ChangeflowResult<()> {
        if self.state == PipelineState::Started {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline already started",
                "The pipeline can only be started once"
            );
        }

        self.config.validate()?;

        let definitions = self
            .config
            .jobs
            .iter()
            .map(JobDefinition::try_from)
            .collect::<ChangeflowResult<Vec<_>>>()?;

        info!(jobs = definitions.len(), "starting pipeline");

        for definition in definitions {
            self.change_log
                .track_table(&definition.source_table)
                .await?;
            self.store.create_table(&definition.target_table).await?;

            let job_id = definition.id.clone();
            self.scheduler.register_job(definition).await?;
            self.scheduler.resume(&job_id).await?;
        }

        self.state = PipelineState::Started;

        Ok(())
    }

    /// Signals every job worker to stop and waits for them.
    pub async fn shutdown_and_wait(self) -> ChangeflowResult<()> {
        if self.state == PipelineState::NotStarted {
            info!("pipeline was not started, nothing to shut down");
        }

        self.scheduler.shutdown_and_wait().await
    }
}
