//! Consumer-facing view over the change logs.
//!
//! A [`ChangeView`] combines the change log of a source table with the cursor of a consumer and
//! returns the entries the consumer has not seen yet. Consumption is serialized per consumer and the
//! cursor only moves through a compare-and-set, so concurrent consumers of the same cursor never
//! receive the same entry twice.

use changeflow_config::shared::ConsumerModeConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::bail;
use crate::changeflow_error;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::store::cursor::{Cursor, CursorStore};
use crate::store::log::ChangeLogStore;
use crate::types::{ChangeBatch, ChangeEntry, ConsumerId, SequenceNumber, TableId};

/// Which change entries a consumer receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerMode {
    /// Every insert and delete, including both halves of updates.
    #[default]
    Standard,
    /// Only plain inserts. Deletes and update pairs are skipped, but the cursor still moves past them.
    AppendOnly,
}

impl From<ConsumerModeConfig> for ConsumerMode {
    fn from(value: ConsumerModeConfig) -> Self {
        match value {
            ConsumerModeConfig::Standard => ConsumerMode::Standard,
            ConsumerModeConfig::AppendOnly => ConsumerMode::AppendOnly,
        }
    }
}

impl fmt::Display for ConsumerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerMode::Standard => f.write_str("standard"),
            ConsumerMode::AppendOnly => f.write_str("append_only"),
        }
    }
}

/// The source table and mode a consumer was registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerBinding {
    pub source_table: TableId,
    pub mode: ConsumerMode,
}

#[derive(Debug)]
struct ConsumerSlot {
    binding: ConsumerBinding,
    consume_lock: Arc<Mutex<()>>,
}

/// Result of scanning the log from a cursor position.
#[derive(Debug)]
struct Scan {
    batch: ChangeBatch,
    /// Sequence the cursor moves to once the batch is consumed.
    advance_to: SequenceNumber,
}

/// Exposes unconsumed change entries per consumer and advances their cursors.
#[derive(Debug, Clone)]
pub struct ChangeView<L, C> {
    log: L,
    cursors: C,
    consumers: Arc<RwLock<HashMap<ConsumerId, ConsumerSlot>>>,
}

impl<L, C> ChangeView<L, C>
where
    L: ChangeLogStore + Send + Sync,
    C: CursorStore + Clone + Send + Sync,
{
    pub fn new(log: L, cursors: C) -> Self {
        Self {
            log,
            cursors,
            consumers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn cursor_store(&self) -> &C {
        &self.cursors
    }

    /// Binds `consumer_id` to the change log of `source_table`.
    ///
    /// Registering the same binding again is a no-op. Rebinding a consumer to another table or mode
    /// fails with [`ErrorKind::ConfigurationError`], as does binding it to an untracked table.
    pub async fn register_consumer(
        &self,
        consumer_id: ConsumerId,
        source_table: TableId,
        mode: ConsumerMode,
    ) -> ChangeflowResult<()> {
        if !self.log.is_change_tracked(&source_table).await? {
            bail!(
                ErrorKind::ConfigurationError,
                "Change tracking not enabled",
                format!(
                    "Consumer `{consumer_id}` cannot read table `{source_table}` which does not record changes"
                )
            );
        }

        let binding = ConsumerBinding { source_table, mode };
        let mut consumers = self.consumers.write().await;

        if let Some(slot) = consumers.get(&consumer_id) {
            if slot.binding != binding {
                bail!(
                    ErrorKind::ConfigurationError,
                    "Consumer already registered",
                    format!(
                        "Consumer `{consumer_id}` is bound to table `{}` in {} mode",
                        slot.binding.source_table, slot.binding.mode
                    )
                );
            }

            return Ok(());
        }

        info!(
            consumer = %consumer_id,
            table = %binding.source_table,
            mode = %binding.mode,
            "registered consumer"
        );

        consumers.insert(
            consumer_id,
            ConsumerSlot {
                binding,
                consume_lock: Arc::new(Mutex::new(())),
            },
        );

        Ok(())
    }

    pub async fn binding(&self, consumer_id: &ConsumerId) -> ChangeflowResult<ConsumerBinding> {
        let (binding, _) = self.slot(consumer_id).await?;

        Ok(binding)
    }

    /// Returns every unconsumed entry without moving the cursor.
    pub async fn peek(&self, consumer_id: &ConsumerId) -> ChangeflowResult<ChangeBatch> {
        self.peek_batch(consumer_id, None).await
    }

    /// Returns at most `limit` unconsumed entries without moving the cursor.
    pub async fn peek_batch(
        &self,
        consumer_id: &ConsumerId,
        limit: Option<usize>,
    ) -> ChangeflowResult<ChangeBatch> {
        let (binding, _) = self.slot(consumer_id).await?;
        let after = self.cursors.get(consumer_id).await?;

        Ok(self.scan(&binding, after, limit).await?.batch)
    }

    /// Returns `true` if the consumer has at least one visible unconsumed entry.
    pub async fn has_data(&self, consumer_id: &ConsumerId) -> ChangeflowResult<bool> {
        Ok(!self.peek_batch(consumer_id, Some(1)).await?.is_empty())
    }

    /// Returns every unconsumed entry and moves the cursor past them.
    pub async fn consume(&self, consumer_id: &ConsumerId) -> ChangeflowResult<ChangeBatch> {
        self.consume_batch(consumer_id, None).await
    }

    /// Returns at most `limit` unconsumed entries and moves the cursor to the last one returned.
    pub async fn consume_batch(
        &self,
        consumer_id: &ConsumerId,
        limit: Option<usize>,
    ) -> ChangeflowResult<ChangeBatch> {
        let pending = self.begin_consume(consumer_id, limit).await?;
        let batch = pending.batch().clone();
        pending.commit().await?;

        Ok(batch)
    }

    /// Reads the next batch for `consumer_id` while holding its consume lock.
    ///
    /// The cursor only moves when [`PendingConsume::commit`] is called. Dropping the returned value
    /// releases the lock and leaves the cursor untouched, so the same entries are returned again.
    pub async fn begin_consume(
        &self,
        consumer_id: &ConsumerId,
        limit: Option<usize>,
    ) -> ChangeflowResult<PendingConsume<C>> {
        let (binding, consume_lock) = self.slot(consumer_id).await?;
        let guard = consume_lock.lock_owned().await;

        let expected = self.cursors.get(consumer_id).await?;
        let scan = self.scan(&binding, expected, limit).await?;

        debug!(
            consumer = %consumer_id,
            cursor = %expected,
            entries = scan.batch.len(),
            advance_to = %scan.advance_to,
            "read change batch"
        );

        Ok(PendingConsume {
            consumer_id: consumer_id.clone(),
            source_table: binding.source_table,
            expected,
            advance_to: scan.advance_to,
            batch: scan.batch,
            cursors: self.cursors.clone(),
            _guard: guard,
        })
    }

    async fn slot(
        &self,
        consumer_id: &ConsumerId,
    ) -> ChangeflowResult<(ConsumerBinding, Arc<Mutex<()>>)> {
        let consumers = self.consumers.read().await;
        let slot = consumers.get(consumer_id).ok_or_else(|| {
            changeflow_error!(
                ErrorKind::ConfigurationError,
                "Unknown consumer",
                format!("No consumer named `{consumer_id}` has been registered")
            )
        })?;

        Ok((slot.binding.clone(), slot.consume_lock.clone()))
    }

    async fn scan(
        &self,
        binding: &ConsumerBinding,
        after: SequenceNumber,
        limit: Option<usize>,
    ) -> ChangeflowResult<Scan> {
        match binding.mode {
            ConsumerMode::Standard => {
                let entries = self
                    .log
                    .entries_after(&binding.source_table, after, limit)
                    .await?;
                let advance_to = entries.last().map(|entry| entry.sequence).unwrap_or(after);

                Ok(Scan {
                    batch: ChangeBatch::new(entries),
                    advance_to,
                })
            }
            ConsumerMode::AppendOnly => {
                let entries = self
                    .log
                    .entries_after(&binding.source_table, after, None)
                    .await?;

                let mut advance_to = after;
                let mut visible: Vec<ChangeEntry> = Vec::new();
                for entry in entries {
                    if limit.is_some_and(|limit| visible.len() >= limit) {
                        break;
                    }

                    advance_to = entry.sequence;
                    if entry.is_plain_insert() {
                        visible.push(entry);
                    }
                }

                Ok(Scan {
                    batch: ChangeBatch::new(visible),
                    advance_to,
                })
            }
        }
    }
}

/// A batch read under the consumer's lock, waiting for its cursor advance.
#[derive(Debug)]
pub struct PendingConsume<C> {
    consumer_id: ConsumerId,
    source_table: TableId,
    expected: SequenceNumber,
    advance_to: SequenceNumber,
    batch: ChangeBatch,
    cursors: C,
    _guard: OwnedMutexGuard<()>,
}

impl<C> PendingConsume<C>
where
    C: CursorStore + Send + Sync,
{
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    pub fn source_table(&self) -> &TableId {
        &self.source_table
    }

    pub fn batch(&self) -> &ChangeBatch {
        &self.batch
    }

    /// Cursor position the batch was read from.
    pub fn cursor(&self) -> SequenceNumber {
        self.expected
    }

    /// Cursor position after [`PendingConsume::commit`].
    ///
    /// May be past the last entry of the batch when entries were filtered out by the consumer mode.
    pub fn advance_to(&self) -> SequenceNumber {
        self.advance_to
    }

    /// Moves the cursor past the batch.
    ///
    /// Fails with [`ErrorKind::ConcurrentCursorConflict`] if the cursor was moved outside of the view
    /// since the batch was read.
    pub async fn commit(self) -> ChangeflowResult<Cursor> {
        let cursor = self
            .cursors
            .compare_and_advance(&self.consumer_id, self.expected, self.advance_to)
            .await?;

        debug!(
            consumer = %self.consumer_id,
            cursor = %cursor.last_consumed_sequence,
            "advanced cursor"
        );

        Ok(cursor)
    }
}
