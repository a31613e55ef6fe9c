use changeflow::changelog::ChangeLog;
use changeflow::error::ErrorKind;
use changeflow::store::both::memory::MemoryStore;
use changeflow::store::cursor::CursorStore;
use changeflow::store::cursor::file::JsonFileCursorStore;
use changeflow::store::cursor::memory::MemoryCursorStore;
use changeflow::test_utils::rows::{delete_member, insert_member, update_member};
use changeflow::types::{ChangeAction, ConsumerId, SequenceNumber, TableId};
use changeflow::view::{ChangeView, ConsumerMode};
use changeflow_telemetry::tracing::init_test_tracing;
use uuid::Uuid;

async fn tracked_members() -> (ChangeLog<MemoryStore>, TableId) {
    let log = ChangeLog::new(MemoryStore::new());
    let members = TableId::new("members");
    log.track_table(&members).await.unwrap();

    (log, members)
}

#[tokio::test(flavor = "multi_thread")]
async fn has_data_tracks_consumption_and_new_mutations() {
    init_test_tracing();

    let (log, members) = tracked_members().await;
    let view = ChangeView::new(log.store().clone(), MemoryCursorStore::new());
    let consumer = ConsumerId::new("mirror");
    view.register_consumer(consumer.clone(), members.clone(), ConsumerMode::Standard)
        .await
        .unwrap();

    assert!(!view.has_data(&consumer).await.unwrap());

    log.append_all(
        &members,
        vec![insert_member(1, "ada", 10), insert_member(2, "grace", 20)],
    )
    .await
    .unwrap();
    assert!(view.has_data(&consumer).await.unwrap());

    let batch = view.consume(&consumer).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert!(!view.has_data(&consumer).await.unwrap());
    assert!(view.peek(&consumer).await.unwrap().is_empty());

    log.append(&members, delete_member(1)).await.unwrap();
    assert!(view.has_data(&consumer).await.unwrap());

    let batch = view.peek(&consumer).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.entries()[0].action, ChangeAction::Delete);
    assert!(!batch.entries()[0].is_update_pair);
}

#[tokio::test(flavor = "multi_thread")]
async fn consumers_of_one_table_progress_independently() {
    init_test_tracing();

    let (log, members) = tracked_members().await;
    let view = ChangeView::new(log.store().clone(), MemoryCursorStore::new());
    let fast = ConsumerId::new("fast");
    let slow = ConsumerId::new("slow");
    let inserts_only = ConsumerId::new("inserts_only");
    for (consumer, mode) in [
        (&fast, ConsumerMode::Standard),
        (&slow, ConsumerMode::Standard),
        (&inserts_only, ConsumerMode::AppendOnly),
    ] {
        view.register_consumer(consumer.clone(), members.clone(), mode)
            .await
            .unwrap();
    }

    log.append_all(
        &members,
        vec![insert_member(1, "ada", 10), update_member(1, "ada", 11)],
    )
    .await
    .unwrap();
    assert_eq!(view.consume(&fast).await.unwrap().len(), 3);

    log.append(&members, insert_member(2, "grace", 20))
        .await
        .unwrap();
    assert_eq!(view.consume(&fast).await.unwrap().len(), 1);

    let slow_batch = view.consume(&slow).await.unwrap();
    assert_eq!(slow_batch.len(), 4);
    assert_eq!(slow_batch.max_sequence(), Some(SequenceNumber::new(4)));

    let inserts = view.consume(&inserts_only).await.unwrap();
    assert_eq!(inserts.len(), 2);
    assert!(inserts.iter().all(|entry| entry.is_plain_insert()));
    assert_eq!(
        view.cursor_store().get(&inserts_only).await.unwrap(),
        SequenceNumber::new(4)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_consumer_is_a_configuration_error() {
    init_test_tracing();

    let (log, _) = tracked_members().await;
    let view = ChangeView::new(log.store().clone(), MemoryCursorStore::new());

    let err = view.peek(&ConsumerId::new("ghost")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_cursors_resume_where_the_consumer_stopped() {
    init_test_tracing();

    let path = std::env::temp_dir().join(format!("changeflow-cursors-{}.json", Uuid::new_v4()));
    let (log, members) = tracked_members().await;
    let consumer = ConsumerId::new("mirror");

    log.append_all(
        &members,
        vec![insert_member(1, "ada", 10), insert_member(2, "grace", 20)],
    )
    .await
    .unwrap();

    {
        let cursors = JsonFileCursorStore::open(path.clone()).await.unwrap();
        let view = ChangeView::new(log.store().clone(), cursors);
        view.register_consumer(consumer.clone(), members.clone(), ConsumerMode::Standard)
            .await
            .unwrap();
        assert_eq!(view.consume(&consumer).await.unwrap().len(), 2);
    }

    log.append(&members, insert_member(3, "linus", 30))
        .await
        .unwrap();

    let cursors = JsonFileCursorStore::open(path.clone()).await.unwrap();
    let view = ChangeView::new(log.store().clone(), cursors);
    view.register_consumer(consumer.clone(), members.clone(), ConsumerMode::Standard)
        .await
        .unwrap();

    let batch = view.peek(&consumer).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.entries()[0].sequence, SequenceNumber::new(3));

    tokio::fs::remove_file(&path).await.unwrap();
}
