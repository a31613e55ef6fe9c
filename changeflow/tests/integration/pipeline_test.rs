use changeflow::error::ErrorKind;
use changeflow::pipeline::Pipeline;
use changeflow::scheduler::RunOutcome;
use changeflow::store::both::memory::MemoryStore;
use changeflow::store::cursor::memory::MemoryCursorStore;
use changeflow::store::table::TableStore;
use changeflow::test_utils::rows::{delete_member, insert_member, member, update_member};
use changeflow::types::{ChangeAction, ConsumerId, JobId, Mutation, RowKey, TableId, Value};
use changeflow_config::shared::{ChangeflowConfig, ConsumerModeConfig, JobConfig};
use changeflow_telemetry::tracing::init_test_tracing;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn job_config(name: &str, consumer: &str, target: &str) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        consumer: consumer.to_string(),
        source_table: "members".to_string(),
        target_table: target.to_string(),
        // Long enough that only manual executions run during a test.
        schedule: "1 hour".to_string(),
        when_has_data: true,
        timeout_ms: None,
        mode: ConsumerModeConfig::Standard,
    }
}

fn pipeline_config(jobs: Vec<JobConfig>) -> ChangeflowConfig {
    ChangeflowConfig {
        jobs,
        ..Default::default()
    }
}

fn random_mutations(rng: &mut StdRng, count: usize, keys: i64) -> Vec<Mutation> {
    (0..count)
        .map(|index| {
            let id = rng.gen_range(0..keys);
            let name = format!("member-{index}");
            let score = rng.gen_range(0..1_000);

            match rng.gen_range(0..10) {
                0..=3 => insert_member(id, &name, score),
                4..=7 => update_member(id, &name, score),
                _ => delete_member(id),
            }
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn insert_update_and_reinsert_reach_the_target() {
    init_test_tracing();

    let store = MemoryStore::new();
    let mut pipeline = Pipeline::new(
        pipeline_config(vec![job_config("mirror_members", "mirror", "mirror")]),
        store.clone(),
        MemoryCursorStore::new(),
    );
    pipeline.start().await.unwrap();

    let members = TableId::new("members");
    let mirror = TableId::new("mirror");
    let job_id = JobId::new("mirror_members");

    pipeline
        .change_log()
        .append_all(
            &members,
            vec![
                insert_member(1, "ada", 10),
                insert_member(2, "grace", 20),
                insert_member(3, "linus", 30),
            ],
        )
        .await
        .unwrap();

    let run = pipeline.scheduler().execute_now(&job_id).await.unwrap();
    let RunOutcome::Succeeded(summary) = run.outcome else {
        panic!("expected a successful run, got {:?}", run.outcome);
    };
    assert_eq!(summary.inserted, 3);
    assert_eq!(store.read_all(&mirror).await.unwrap().len(), 3);
    assert_eq!(
        store.read_all(&mirror).await.unwrap(),
        store.read_all(&members).await.unwrap()
    );

    // An update is logged as a delete and an insert flagged as a pair.
    let entries = pipeline
        .change_log()
        .append(&members, update_member(1, "ada", 11))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, ChangeAction::Delete);
    assert_eq!(entries[1].action, ChangeAction::Insert);
    assert!(entries.iter().all(|entry| entry.is_update_pair));
    assert!(entries[0].sequence < entries[1].sequence);

    pipeline.scheduler().execute_now(&job_id).await.unwrap();
    let row = store
        .get_row(&mirror, &RowKey::from(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("score"), Some(&Value::I64(11)));

    // Inserting an existing key again overwrites the target row.
    pipeline
        .change_log()
        .append(&members, insert_member(3, "linus", 99))
        .await
        .unwrap();
    let run = pipeline.scheduler().execute_now(&job_id).await.unwrap();
    let RunOutcome::Succeeded(summary) = run.outcome else {
        panic!("expected a successful run, got {:?}", run.outcome);
    };
    assert_eq!(summary.overwritten, 1);
    assert_eq!(summary.inserted, 0);

    let rows = store.read_all(&mirror).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].get("score"), Some(&Value::I64(99)));
    assert_eq!(rows, store.read_all(&members).await.unwrap());

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn random_mutations_converge_in_every_target() {
    init_test_tracing();

    for seed in [7_u64, 42, 1_337] {
        let mut rng = StdRng::seed_from_u64(seed);
        let store = MemoryStore::new();
        let mut config = pipeline_config(vec![
            job_config("mirror_members", "mirror", "mirror"),
            job_config("archive_members", "archive", "archive"),
        ]);
        // A small batch size forces several cycles per round.
        config.batch.max_size = 7;

        let mut pipeline = Pipeline::new(config, store.clone(), MemoryCursorStore::new());
        pipeline.start().await.unwrap();

        let members = TableId::new("members");
        for _ in 0..10 {
            let count = rng.gen_range(1..25);
            let mutations = random_mutations(&mut rng, count, 12);
            pipeline
                .change_log()
                .append_all(&members, mutations)
                .await
                .unwrap();

            // Only the mirror keeps up round by round; the archive catches up at the end.
            for _ in 0..rng.gen_range(1..4) {
                pipeline
                    .scheduler()
                    .execute_now(&JobId::new("mirror_members"))
                    .await
                    .unwrap();
            }
        }

        for job in ["mirror_members", "archive_members"] {
            let consumer = if job == "mirror_members" { "mirror" } else { "archive" };
            while pipeline
                .view()
                .has_data(&ConsumerId::new(consumer))
                .await
                .unwrap()
            {
                let run = pipeline
                    .scheduler()
                    .execute_now(&JobId::new(job))
                    .await
                    .unwrap();
                assert!(run.outcome.is_success(), "seed {seed}: {:?}", run.outcome);
            }
        }

        let source = store.read_all(&members).await.unwrap();
        assert_eq!(
            store.read_all(&TableId::new("mirror")).await.unwrap(),
            source,
            "seed {seed}"
        );
        assert_eq!(
            store.read_all(&TableId::new("archive")).await.unwrap(),
            source,
            "seed {seed}"
        );

        pipeline.shutdown_and_wait().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn append_only_job_keeps_every_first_insert() {
    init_test_tracing();

    let store = MemoryStore::new();
    let mut job = job_config("history_members", "history", "history");
    job.mode = ConsumerModeConfig::AppendOnly;
    let mut pipeline = Pipeline::new(
        pipeline_config(vec![job]),
        store.clone(),
        MemoryCursorStore::new(),
    );
    pipeline.start().await.unwrap();

    let members = TableId::new("members");
    pipeline
        .change_log()
        .append_all(
            &members,
            vec![
                insert_member(1, "ada", 10),
                insert_member(2, "grace", 20),
                update_member(1, "ada", 11),
                delete_member(2),
            ],
        )
        .await
        .unwrap();

    pipeline
        .scheduler()
        .execute_now(&JobId::new("history_members"))
        .await
        .unwrap();

    let history = store.read_all(&TableId::new("history")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].get("score"), Some(&Value::I64(10)));
    assert_eq!(history[1].key(), member(2, "grace", 20).key());
    assert!(
        !pipeline
            .view()
            .has_data(&ConsumerId::new("history"))
            .await
            .unwrap()
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_schedule_fails_start_before_registering_jobs() {
    init_test_tracing();

    let mut broken = job_config("broken", "broken", "broken_target");
    broken.schedule = "every tuesday".to_string();
    let mut pipeline = Pipeline::new(
        pipeline_config(vec![job_config("mirror_members", "mirror", "mirror"), broken]),
        MemoryStore::new(),
        MemoryCursorStore::new(),
    );

    let err = pipeline.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    assert!(pipeline.registry().job_ids().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_sharing_a_consumer_are_rejected() {
    init_test_tracing();

    let mut pipeline = Pipeline::new(
        pipeline_config(vec![
            job_config("first", "shared", "first_target"),
            job_config("second", "shared", "second_target"),
        ]),
        MemoryStore::new(),
        MemoryCursorStore::new(),
    );

    let err = pipeline.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_cannot_start_twice() {
    init_test_tracing();

    let mut pipeline = Pipeline::new(
        pipeline_config(vec![job_config("mirror_members", "mirror", "mirror")]),
        MemoryStore::new(),
        MemoryCursorStore::new(),
    );
    pipeline.start().await.unwrap();

    let err = pipeline.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    pipeline.shutdown_and_wait().await.unwrap();
}
