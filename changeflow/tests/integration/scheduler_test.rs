use std::time::Duration;

use changeflow::apply::{MergeApplier, MergeSummary};
use changeflow::changelog::ChangeLog;
use changeflow::error::ErrorKind;
use changeflow::scheduler::{
    JobDefinition, JobRegistry, JobState, RunOutcome, RunTrigger, Schedule, Scheduler, SkipReason,
};
use changeflow::store::both::memory::MemoryStore;
use changeflow::store::cursor::memory::MemoryCursorStore;
use changeflow::store::log::ChangeLogStore;
use changeflow::store::table::TableStore;
use changeflow::test_utils::rows::{delete_member, insert_member};
use changeflow::test_utils::runs::{
    DEFAULT_WAIT_TIMEOUT, wait_for_matching_runs, wait_for_runs, wait_for_successful_runs,
};
use changeflow::test_utils::table::FaultyTableStore;
use changeflow::types::{ConsumerId, JobId, TableId};
use changeflow::view::ChangeView;
use changeflow_config::shared::{BatchConfig, SchedulerConfig};
use changeflow_telemetry::tracing::init_test_tracing;
use tokio::time::{sleep, timeout};

struct Harness<S> {
    store: S,
    log: ChangeLog<S>,
    view: ChangeView<S, MemoryCursorStore>,
    scheduler: Scheduler<S, MemoryCursorStore>,
}

impl<S> Harness<S>
where
    S: TableStore + ChangeLogStore + Clone + Send + Sync + 'static,
{
    async fn new(store: S) -> Self {
        let log = ChangeLog::new(store.clone());
        log.track_table(&members()).await.unwrap();
        store.create_table(&mirror()).await.unwrap();
        store.create_table(&TableId::new("archive")).await.unwrap();

        let view = ChangeView::new(store.clone(), MemoryCursorStore::new());
        let scheduler = Scheduler::new(
            JobRegistry::new(100),
            view.clone(),
            MergeApplier::new(store.clone()),
            &BatchConfig::default(),
            &SchedulerConfig {
                shutdown_timeout_ms: 5_000,
                ..Default::default()
            },
        );

        Self {
            store,
            log,
            view,
            scheduler,
        }
    }

    async fn insert_members(&self, ids: std::ops::RangeInclusive<i64>) {
        self.log
            .append_all(
                &members(),
                ids.map(|id| insert_member(id, "member", id)).collect(),
            )
            .await
            .unwrap();
    }

    async fn assert_mirror_converged(&self) {
        assert_eq!(
            self.store.read_all(&mirror()).await.unwrap(),
            self.store.read_all(&members()).await.unwrap()
        );
    }
}

fn members() -> TableId {
    TableId::new("members")
}

fn mirror() -> TableId {
    TableId::new("mirror")
}

fn mirror_job_id() -> JobId {
    JobId::new("mirror_members")
}

fn mirror_job(interval: Duration) -> JobDefinition {
    JobDefinition::new(
        "mirror_members",
        "mirror",
        "members",
        "mirror",
        Schedule::FixedInterval(interval),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn interval_job_merges_on_its_ticks() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    harness.insert_members(1..=3).await;

    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(50)))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();

    let runs = wait_for_successful_runs(scheduler.registry(), &mirror_job_id(), 1).await;
    assert!(
        runs.iter()
            .all(|run| run.trigger == RunTrigger::Schedule && run.attempt == 1)
    );
    harness.assert_mirror_converged().await;

    harness
        .log
        .append(&members(), delete_member(2))
        .await
        .unwrap();
    wait_for_successful_runs(scheduler.registry(), &mirror_job_id(), 2).await;
    harness.assert_mirror_converged().await;
    assert_eq!(harness.store.read_all(&mirror()).await.unwrap().len(), 2);

    let status = scheduler.registry().status(&mirror_job_id()).await.unwrap();
    assert_eq!(status.state, JobState::Started);
    assert_eq!(status.consecutive_failures, 0);

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn gated_job_without_data_skips_its_ticks() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();

    let runs = wait_for_matching_runs(scheduler.registry(), &mirror_job_id(), 3, |run| {
        run.outcome == RunOutcome::Skipped(SkipReason::NoData)
    })
    .await;

    assert!(runs.iter().all(|run| !run.outcome.is_success()));
    assert!(harness.store.read_all(&mirror()).await.unwrap().is_empty());

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ungated_empty_ticks_succeed_with_zero_counts() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)).with_when_has_data(false))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();

    let runs = wait_for_successful_runs(scheduler.registry(), &mirror_job_id(), 2).await;

    for run in runs {
        assert_eq!(run.outcome, RunOutcome::Succeeded(MergeSummary::default()));
    }

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn suspended_job_stops_ticking_until_resumed() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();
    wait_for_runs(scheduler.registry(), &mirror_job_id(), 2).await;

    scheduler.suspend(&mirror_job_id()).await.unwrap();
    // Lets a tick that was already running finish.
    sleep(Duration::from_millis(50)).await;
    let suspended_runs = scheduler
        .registry()
        .runs(&mirror_job_id())
        .await
        .unwrap()
        .len();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        scheduler.registry().runs(&mirror_job_id()).await.unwrap().len(),
        suspended_runs
    );

    // Data written while suspended is merged once the job resumes.
    harness.insert_members(1..=2).await;
    scheduler.resume(&mirror_job_id()).await.unwrap();
    wait_for_successful_runs(scheduler.registry(), &mirror_job_id(), 1).await;
    harness.assert_mirror_converged().await;

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn created_job_only_runs_when_executed_manually() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    harness.insert_members(1..=3).await;

    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(
        scheduler
            .registry()
            .runs(&mirror_job_id())
            .await
            .unwrap()
            .is_empty()
    );

    let run = scheduler.execute_now(&mirror_job_id()).await.unwrap();

    assert_eq!(run.trigger, RunTrigger::Manual);
    assert!(run.outcome.is_success());
    harness.assert_mirror_converged().await;
    assert_eq!(
        scheduler.registry().state(&mirror_job_id()).await.unwrap(),
        JobState::Created
    );

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_job_stops_its_worker_and_rejects_operations() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();
    assert!(scheduler.has_active_worker(&mirror_job_id()).await);

    scheduler.drop_job(&mirror_job_id()).await.unwrap();

    timeout(DEFAULT_WAIT_TIMEOUT, async {
        while scheduler.has_active_worker(&mirror_job_id()).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let err = scheduler.execute_now(&mirror_job_id()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = scheduler.resume(&mirror_job_id()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reregistered_job_merges_with_its_new_definition() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();
    sleep(Duration::from_millis(5)).await;

    // Re-registered right away, while the first worker may still be running.
    scheduler.drop_job(&mirror_job_id()).await.unwrap();
    scheduler
        .register_job(JobDefinition::new(
            "mirror_members",
            "archive_consumer",
            "members",
            "archive",
            Schedule::FixedInterval(Duration::from_millis(20)),
        ))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();

    harness.insert_members(1..=3).await;
    wait_for_matching_runs(scheduler.registry(), &mirror_job_id(), 1, |run| {
        matches!(&run.outcome, RunOutcome::Succeeded(summary) if summary.inserted > 0)
    })
    .await;

    let definition = scheduler.registry().definition(&mirror_job_id()).await.unwrap();
    assert_eq!(definition.target_table, TableId::new("archive"));
    assert_eq!(
        harness
            .store
            .read_all(&TableId::new("archive"))
            .await
            .unwrap(),
        harness.store.read_all(&members()).await.unwrap()
    );
    assert!(harness.store.read_all(&mirror()).await.unwrap().is_empty());

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_cycle_is_rolled_back_and_retried() {
    init_test_tracing();

    let store = FaultyTableStore::new(MemoryStore::new());
    let harness = Harness::new(store.clone()).await;
    harness.insert_members(1..=3).await;

    let scheduler = &harness.scheduler;
    scheduler
        .register_job(
            mirror_job(Duration::from_secs(3_600)).with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    store.delay_commits(Duration::from_millis(500));
    let run = scheduler.execute_now(&mirror_job_id()).await.unwrap();

    assert!(matches!(
        run.outcome,
        RunOutcome::Failed {
            kind: ErrorKind::JobTimeout,
            ..
        }
    ));
    assert!(store.read_all(&mirror()).await.unwrap().is_empty());
    assert!(harness.view.has_data(&ConsumerId::new("mirror")).await.unwrap());
    assert_eq!(
        scheduler
            .registry()
            .status(&mirror_job_id())
            .await
            .unwrap()
            .consecutive_failures,
        1
    );

    store.heal();
    let run = scheduler.execute_now(&mirror_job_id()).await.unwrap();

    assert!(run.outcome.is_success());
    assert_eq!(run.attempt, 2);
    harness.assert_mirror_converged().await;
    assert!(!harness.view.has_data(&ConsumerId::new("mirror")).await.unwrap());

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_cycles_are_retried_on_the_next_tick() {
    init_test_tracing();

    let store = FaultyTableStore::new(MemoryStore::new());
    let harness = Harness::new(store.clone()).await;
    harness.insert_members(1..=3).await;
    store.fail_commits(true);

    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();

    let runs = wait_for_matching_runs(scheduler.registry(), &mirror_job_id(), 2, |run| {
        run.outcome.is_failure()
    })
    .await;
    assert!(runs.iter().all(|run| matches!(
        run.outcome,
        RunOutcome::Failed {
            kind: ErrorKind::TransactionAbort,
            ..
        }
    )));
    assert!(store.read_all(&mirror()).await.unwrap().is_empty());

    store.heal();
    wait_for_successful_runs(scheduler.registry(), &mirror_job_id(), 1).await;
    harness.assert_mirror_converged().await;

    scheduler.shutdown_and_wait().await.unwrap();
    assert_eq!(
        scheduler
            .registry()
            .status(&mirror_job_id())
            .await
            .unwrap()
            .consecutive_failures,
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_runs_of_a_job_are_skipped() {
    init_test_tracing();

    let store = FaultyTableStore::new(MemoryStore::new());
    let harness = Harness::new(store.clone()).await;
    harness.insert_members(1..=3).await;
    store.delay_commits(Duration::from_millis(300));

    let scheduler = &harness.scheduler;
    scheduler
        .register_job(mirror_job(Duration::from_secs(3_600)))
        .await
        .unwrap();

    let job_id = mirror_job_id();
    let (first, second) = tokio::join!(
        scheduler.execute_now(&job_id),
        scheduler.execute_now(&job_id)
    );
    let outcomes = [first.unwrap().outcome, second.unwrap().outcome];

    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == RunOutcome::Skipped(SkipReason::Overlap))
            .count(),
        1
    );
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_success()).count(), 1);
    harness.assert_mirror_converged().await;

    scheduler.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_every_worker() {
    init_test_tracing();

    let harness = Harness::new(MemoryStore::new()).await;
    let scheduler = &harness.scheduler;
    let archive_job = JobDefinition::new(
        "archive_members",
        "archive",
        "members",
        "archive",
        Schedule::parse("20ms").unwrap(),
    );
    scheduler
        .register_job(mirror_job(Duration::from_millis(20)))
        .await
        .unwrap();
    scheduler.register_job(archive_job.clone()).await.unwrap();
    scheduler.resume(&mirror_job_id()).await.unwrap();
    scheduler.resume(&archive_job.id).await.unwrap();

    scheduler.shutdown_and_wait().await.unwrap();

    assert!(!scheduler.has_active_worker(&mirror_job_id()).await);
    assert!(!scheduler.has_active_worker(&archive_job.id).await);

    let err = scheduler
        .register_job(JobDefinition::new(
            "late",
            "late",
            "members",
            "archive",
            Schedule::FixedInterval(Duration::from_millis(20)),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}
