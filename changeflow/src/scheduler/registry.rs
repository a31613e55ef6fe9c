use changeflow_config::shared::JobConfig;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::info;
use uuid::Uuid;

use crate::apply::MergeSummary;
use crate::bail;
use crate::changeflow_error;
use crate::error::{ChangeflowError, ChangeflowResult, ErrorKind};
use crate::scheduler::schedule::Schedule;
use crate::types::{ConsumerId, JobId, TableId};
use crate::view::ConsumerMode;

/// Lifecycle of a job in the [`JobRegistry`].
///
/// Jobs start in [`JobState::Created`] and only run once resumed. [`JobState::Dropped`] is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Started,
    Suspended,
    Dropped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => f.write_str("created"),
            JobState::Started => f.write_str("started"),
            JobState::Suspended => f.write_str("suspended"),
            JobState::Dropped => f.write_str("dropped"),
        }
    }
}

/// Everything needed to run a merge job, with the schedule already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub id: JobId,
    pub consumer: ConsumerId,
    pub source_table: TableId,
    pub target_table: TableId,
    pub schedule: Schedule,
    /// Skip ticks when the consumer has nothing to read.
    pub when_has_data: bool,
    pub timeout: Option<Duration>,
    pub mode: ConsumerMode,
}

impl JobDefinition {
    pub fn new(
        id: impl Into<JobId>,
        consumer: impl Into<ConsumerId>,
        source_table: impl Into<TableId>,
        target_table: impl Into<TableId>,
        schedule: Schedule,
    ) -> Self {
        Self {
            id: id.into(),
            consumer: consumer.into(),
            source_table: source_table.into(),
            target_table: target_table.into(),
            schedule,
            when_has_data: true,
            timeout: None,
            mode: ConsumerMode::Standard,
        }
    }

    pub fn with_when_has_data(mut self, when_has_data: bool) -> Self {
        self.when_has_data = when_has_data;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_mode(mut self, mode: ConsumerMode) -> Self {
        self.mode = mode;
        self
    }
}

impl TryFrom<&JobConfig> for JobDefinition {
    type Error = ChangeflowError;

    fn try_from(config: &JobConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        let schedule = Schedule::parse(&config.schedule)?;

        Ok(Self {
            id: JobId::new(config.name.clone()),
            consumer: ConsumerId::new(config.consumer.clone()),
            source_table: TableId::new(config.source_table.clone()),
            target_table: TableId::new(config.target_table.clone()),
            schedule,
            when_has_data: config.when_has_data,
            timeout: config.timeout_ms.map(Duration::from_millis),
            mode: config.mode.into(),
        })
    }
}

/// Why a run did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job is gated on data and the consumer had nothing to read.
    NoData,
    /// Another run of the same job was still in progress.
    Overlap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded(MergeSummary),
    Skipped(SkipReason),
    Failed { kind: ErrorKind, message: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Schedule,
    Manual,
}

/// A single recorded run of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_id: JobId,
    /// 1 for the first run after a success, incremented by each consecutive failure.
    pub attempt: u32,
    pub trigger: RunTrigger,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

/// Point-in-time view of a registered job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub definition: Arc<JobDefinition>,
    /// Changes each time the job id is created again after a drop.
    pub generation: u64,
    pub state: JobState,
    pub consecutive_failures: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<JobRun>,
}

/// Exclusive right to run a job, released on drop.
#[derive(Debug)]
pub struct RunPermit {
    running: Arc<AtomicBool>,
    attempt: u32,
}

impl RunPermit {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct JobEntry {
    definition: Arc<JobDefinition>,
    generation: u64,
    state: JobState,
    history: VecDeque<JobRun>,
    consecutive_failures: u32,
    next_run_at: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
}

#[derive(Debug)]
struct RegistryInner {
    jobs: BTreeMap<JobId, JobEntry>,
    history_capacity: usize,
    next_generation: u64,
}

impl RegistryInner {
    fn entry(&self, job_id: &JobId) -> ChangeflowResult<&JobEntry> {
        self.jobs.get(job_id).ok_or_else(|| unknown_job(job_id))
    }

    fn entry_mut(&mut self, job_id: &JobId) -> ChangeflowResult<&mut JobEntry> {
        self.jobs.get_mut(job_id).ok_or_else(|| unknown_job(job_id))
    }
}

fn unknown_job(job_id: &JobId) -> ChangeflowError {
    changeflow_error!(
        ErrorKind::ConfigurationError,
        "Unknown job",
        format!("No job named `{job_id}` has been created")
    )
}

/// Registered jobs, their lifecycle state and their run history.
///
/// Lifecycle changes are published on a watch channel so that job workers react to `resume`,
/// `suspend` and `drop` without polling; recorded runs are published on a second channel.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    state_tx: Arc<watch::Sender<u64>>,
    runs_tx: Arc<watch::Sender<u64>>,
}

impl JobRegistry {
    /// Creates an empty registry keeping at most `history_capacity` runs per job.
    pub fn new(history_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(0);
        let (runs_tx, _) = watch::channel(0);

        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                jobs: BTreeMap::new(),
                history_capacity: history_capacity.max(1),
                next_generation: 1,
            })),
            state_tx: Arc::new(state_tx),
            runs_tx: Arc::new(runs_tx),
        }
    }

    /// Adds a job in [`JobState::Created`] and returns its generation.
    ///
    /// A dropped job with the same id is replaced by an entry of a new generation. Fails if a live job
    /// already has the id or already reads through the same consumer.
    pub async fn create(&self, definition: JobDefinition) -> ChangeflowResult<u64> {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.jobs.get(&definition.id) {
            if entry.state != JobState::Dropped {
                bail!(
                    ErrorKind::ConfigurationError,
                    "Job already exists",
                    format!("A job named `{}` is already {}", definition.id, entry.state)
                );
            }
        }

        if let Some(other) = inner.jobs.values().find(|entry| {
            entry.state != JobState::Dropped && entry.definition.consumer == definition.consumer
        }) {
            bail!(
                ErrorKind::ConfigurationError,
                "Consumer already in use",
                format!(
                    "Consumer `{}` is already read by job `{}`",
                    definition.consumer, other.definition.id
                )
            );
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        info!(job = %definition.id, schedule = %definition.schedule, generation, "created job");

        inner.jobs.insert(
            definition.id.clone(),
            JobEntry {
                definition: Arc::new(definition),
                generation,
                state: JobState::Created,
                history: VecDeque::new(),
                consecutive_failures: 0,
                next_run_at: None,
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        drop(inner);

        self.notify_state_change();

        Ok(generation)
    }

    /// Starts a created or suspended job. Resuming a started job is a no-op.
    pub async fn resume(&self, job_id: &JobId) -> ChangeflowResult<()> {
        self.transition(job_id, |state| match state {
            JobState::Created | JobState::Suspended | JobState::Started => Some(JobState::Started),
            JobState::Dropped => None,
        })
        .await
    }

    /// Pauses a started job. Suspending a suspended job is a no-op.
    pub async fn suspend(&self, job_id: &JobId) -> ChangeflowResult<()> {
        self.transition(job_id, |state| match state {
            JobState::Started | JobState::Suspended => Some(JobState::Suspended),
            JobState::Created | JobState::Dropped => None,
        })
        .await
    }

    /// Permanently stops a job. Its run history stays readable.
    pub async fn drop_job(&self, job_id: &JobId) -> ChangeflowResult<()> {
        self.transition(job_id, |state| match state {
            JobState::Dropped => None,
            _ => Some(JobState::Dropped),
        })
        .await
    }

    async fn transition<F>(&self, job_id: &JobId, next: F) -> ChangeflowResult<()>
    where
        F: FnOnce(JobState) -> Option<JobState>,
    {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry_mut(job_id)?;

        let current = entry.state;
        let Some(target) = next(current) else {
            bail!(
                ErrorKind::InvalidState,
                "Invalid job state transition",
                format!("Job `{job_id}` cannot change state while {current}")
            );
        };

        if current == target {
            return Ok(());
        }

        entry.state = target;
        if target != JobState::Started {
            entry.next_run_at = None;
        }
        drop(inner);

        info!(job = %job_id, from = %current, to = %target, "job state changed");
        self.notify_state_change();

        Ok(())
    }

    pub async fn state(&self, job_id: &JobId) -> ChangeflowResult<JobState> {
        let inner = self.inner.lock().await;

        Ok(inner.entry(job_id)?.state)
    }

    /// State of a specific generation of a job.
    ///
    /// A generation replaced by a later [`JobRegistry::create`] is reported as
    /// [`JobState::Dropped`].
    pub async fn generation_state(
        &self,
        job_id: &JobId,
        generation: u64,
    ) -> ChangeflowResult<JobState> {
        let inner = self.inner.lock().await;
        let entry = inner.entry(job_id)?;

        if entry.generation != generation {
            return Ok(JobState::Dropped);
        }

        Ok(entry.state)
    }

    pub async fn definition(&self, job_id: &JobId) -> ChangeflowResult<Arc<JobDefinition>> {
        let inner = self.inner.lock().await;

        Ok(inner.entry(job_id)?.definition.clone())
    }

    pub async fn status(&self, job_id: &JobId) -> ChangeflowResult<JobStatus> {
        let inner = self.inner.lock().await;
        let entry = inner.entry(job_id)?;

        Ok(JobStatus {
            definition: entry.definition.clone(),
            generation: entry.generation,
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            next_run_at: entry.next_run_at,
            last_run: entry.history.back().cloned(),
        })
    }

    pub async fn job_ids(&self) -> Vec<JobId> {
        let inner = self.inner.lock().await;

        inner.jobs.keys().cloned().collect()
    }

    /// Returns the recorded runs of a job, oldest first.
    pub async fn runs(&self, job_id: &JobId) -> ChangeflowResult<Vec<JobRun>> {
        let inner = self.inner.lock().await;

        Ok(inner.entry(job_id)?.history.iter().cloned().collect())
    }

    /// Marks the job as running unless a run is already in progress.
    ///
    /// Returns `None` when another run holds the permit.
    pub async fn try_begin_run(&self, job_id: &JobId) -> ChangeflowResult<Option<RunPermit>> {
        let inner = self.inner.lock().await;
        let entry = inner.entry(job_id)?;

        if entry
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }

        Ok(Some(RunPermit {
            running: entry.running.clone(),
            attempt: entry.consecutive_failures + 1,
        }))
    }

    /// Appends a run to the job's history, evicting the oldest run beyond capacity.
    pub async fn record_run(&self, run: JobRun) -> ChangeflowResult<()> {
        let mut inner = self.inner.lock().await;
        let capacity = inner.history_capacity;
        let entry = inner.entry_mut(&run.job_id)?;

        match run.outcome {
            RunOutcome::Succeeded(_) | RunOutcome::Skipped(SkipReason::NoData) => {
                entry.consecutive_failures = 0;
            }
            RunOutcome::Failed { .. } => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            }
            RunOutcome::Skipped(SkipReason::Overlap) => {}
        }

        entry.history.push_back(run);
        while entry.history.len() > capacity {
            entry.history.pop_front();
        }
        drop(inner);

        self.runs_tx.send_modify(|version| *version += 1);

        Ok(())
    }

    pub async fn set_next_run(
        &self,
        job_id: &JobId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> ChangeflowResult<()> {
        let mut inner = self.inner.lock().await;
        inner.entry_mut(job_id)?.next_run_at = next_run_at;

        Ok(())
    }

    /// Subscribes to lifecycle changes of any job.
    pub fn subscribe_state(&self) -> watch::Receiver<u64> {
        self.state_tx.subscribe()
    }

    /// Subscribes to runs recorded for any job.
    pub fn subscribe_runs(&self) -> watch::Receiver<u64> {
        self.runs_tx.subscribe()
    }

    fn notify_state_change(&self) {
        self.state_tx.send_modify(|version| *version += 1);
    }
}
