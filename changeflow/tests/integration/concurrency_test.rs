use std::collections::BTreeSet;
use std::sync::Arc;

use changeflow::apply::MergeApplier;
use changeflow::changelog::ChangeLog;
use changeflow::store::both::memory::MemoryStore;
use changeflow::store::cursor::CursorStore;
use changeflow::store::cursor::memory::MemoryCursorStore;
use changeflow::store::table::TableStore;
use changeflow::test_utils::rows::{insert_member, update_member};
use changeflow::types::{ConsumerId, SequenceNumber, TableId};
use changeflow::view::{ChangeView, ConsumerMode};
use changeflow_telemetry::tracing::init_test_tracing;
use tokio::sync::Barrier;
use tokio::task::JoinSet;

async fn view_with_consumer(
    consumer: &ConsumerId,
) -> (
    ChangeLog<MemoryStore>,
    ChangeView<MemoryStore, MemoryCursorStore>,
    TableId,
) {
    let log = ChangeLog::new(MemoryStore::new());
    let members = TableId::new("members");
    log.track_table(&members).await.unwrap();

    let view = ChangeView::new(log.store().clone(), MemoryCursorStore::new());
    view.register_consumer(consumer.clone(), members.clone(), ConsumerMode::Standard)
        .await
        .unwrap();

    (log, view, members)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumes_deliver_each_entry_once() {
    init_test_tracing();

    let consumer = ConsumerId::new("mirror");
    let (log, view, members) = view_with_consumer(&consumer).await;
    log.append_all(
        &members,
        (1..=5)
            .map(|id| insert_member(id, "member", id * 10))
            .collect(),
    )
    .await
    .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut tasks = JoinSet::new();
    for _ in 0..2 {
        let view = view.clone();
        let consumer = consumer.clone();
        let barrier = barrier.clone();
        tasks.spawn(async move {
            barrier.wait().await;
            view.consume(&consumer).await.unwrap()
        });
    }

    let mut delivered = Vec::new();
    while let Some(batch) = tasks.join_next().await {
        delivered.extend(batch.unwrap().iter().map(|entry| entry.sequence));
    }

    let unique: BTreeSet<_> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), 5);
    assert_eq!(unique, (1..=5).map(SequenceNumber::new).collect());
    assert_eq!(
        view.cursor_store().get(&consumer).await.unwrap(),
        SequenceNumber::new(5)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consuming_while_writers_append_misses_nothing() {
    init_test_tracing();

    let consumer = ConsumerId::new("mirror");
    let (log, view, members) = view_with_consumer(&consumer).await;

    let mut writers = JoinSet::new();
    for writer in 0..4_i64 {
        let log = log.clone();
        let members = members.clone();
        writers.spawn(async move {
            for round in 0..25_i64 {
                let id = writer * 100 + round;
                log.append(&members, insert_member(id, "member", round))
                    .await
                    .unwrap();
                log.append(&members, update_member(id, "member", round + 1))
                    .await
                    .unwrap();
            }
        });
    }

    let mut delivered = Vec::new();
    loop {
        let batch = view.consume_batch(&consumer, Some(16)).await.unwrap();
        delivered.extend(batch.iter().map(|entry| entry.sequence));

        if batch.is_empty() && writers.is_empty() {
            break;
        }
        if batch.is_empty() {
            if let Some(result) = writers.join_next().await {
                result.unwrap();
            }
        }
    }

    // Each writer round appends an insert and an update pair.
    let expected = 4 * 25 * 3;
    assert_eq!(delivered.len(), expected);
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(
        log.latest_sequence(&members).await.unwrap(),
        SequenceNumber::new(expected as u64)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_merges_into_separate_targets_converge() {
    init_test_tracing();

    let log = ChangeLog::new(MemoryStore::new());
    let store = log.store().clone();
    let members = TableId::new("members");
    log.track_table(&members).await.unwrap();

    let view = ChangeView::new(store.clone(), MemoryCursorStore::new());
    let targets: Vec<_> = (0..3).map(|n| TableId::new(format!("target_{n}"))).collect();
    for (n, target) in targets.iter().enumerate() {
        store.create_table(target).await.unwrap();
        view.register_consumer(
            ConsumerId::new(format!("consumer_{n}")),
            members.clone(),
            ConsumerMode::Standard,
        )
        .await
        .unwrap();
    }

    for id in 0..30 {
        log.append(&members, insert_member(id, "member", id))
            .await
            .unwrap();
    }
    for id in (0..30).step_by(3) {
        log.append(&members, update_member(id, "updated", id * 2))
            .await
            .unwrap();
    }

    let mut merges = JoinSet::new();
    for (n, target) in targets.iter().enumerate() {
        let view = view.clone();
        let applier = MergeApplier::new(store.clone());
        let target = target.clone();
        merges.spawn(async move {
            let consumer = ConsumerId::new(format!("consumer_{n}"));
            loop {
                let pending = view.begin_consume(&consumer, Some(8)).await.unwrap();
                if pending.batch().is_empty() {
                    break;
                }
                applier.apply(&target, pending.batch()).await.unwrap();
                pending.commit().await.unwrap();
            }
        });
    }
    while let Some(result) = merges.join_next().await {
        result.unwrap();
    }

    let source = store.read_all(&members).await.unwrap();
    for target in &targets {
        assert_eq!(store.read_all(target).await.unwrap(), source);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_keep_the_highest_sequence() {
    init_test_tracing();

    let cursors = MemoryCursorStore::new();
    let consumer = ConsumerId::new("mirror");

    let mut tasks = JoinSet::new();
    for task in 0..8_u64 {
        let cursors = cursors.clone();
        let consumer = consumer.clone();
        tasks.spawn(async move {
            let mut observed = SequenceNumber::ZERO;
            for step in 0..50_u64 {
                let sequence = SequenceNumber::new((step * 8 + task) % 397);
                cursors.advance(&consumer, sequence).await.unwrap();

                let current = cursors.get(&consumer).await.unwrap();
                assert!(current >= observed, "cursor moved backwards");
                observed = current;
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let highest = (0..8_u64)
        .flat_map(|task| (0..50_u64).map(move |step| (step * 8 + task) % 397))
        .max()
        .map(SequenceNumber::new);
    assert_eq!(Some(cursors.get(&consumer).await.unwrap()), highest);
}
