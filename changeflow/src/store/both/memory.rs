use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::bail;
use crate::changeflow_error;
use crate::error::{ChangeflowError, ChangeflowResult, ErrorKind};
use crate::store::log::ChangeLogStore;
use crate::store::table::{CommitReceipt, TableStore, TableTransaction};
use crate::types::{ChangeEntry, PendingChange, RowKey, SequenceNumber, TableId, TableRow};

/// Change log of one tracked table.
#[derive(Debug, Default)]
struct MemoryChangeLog {
    /// Committed entries in ascending sequence order.
    entries: Vec<ChangeEntry>,
    last_sequence: SequenceNumber,
}

#[derive(Debug)]
struct MemoryTable {
    rows: BTreeMap<RowKey, TableRow>,
    /// Present once change tracking has been enabled for the table.
    change_log: Option<MemoryChangeLog>,
    /// Held by the transaction currently writing to the table.
    write_lock: Arc<Mutex<()>>,
}

impl MemoryTable {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            change_log: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Inner state of [`MemoryStore`].
#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableId, MemoryTable>,
}

/// In-memory table store with per-table change logs.
///
/// [`MemoryStore`] implements both [`TableStore`] and [`ChangeLogStore`]. Rows and change entries of
/// a transaction are applied under a single write lock on commit, so a change entry is never visible
/// without its row mutation and the other way around. All data is lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_table(table_id: &TableId) -> ChangeflowError {
    changeflow_error!(
        ErrorKind::StorageError,
        "Table not found",
        format!("The table `{table_id}` does not exist in the store")
    )
}

fn untracked_table(table_id: &TableId) -> ChangeflowError {
    changeflow_error!(
        ErrorKind::ConfigurationError,
        "Change tracking not enabled",
        format!("The table `{table_id}` does not record change entries")
    )
}

impl TableStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn create_table(&self, table_id: &TableId) -> ChangeflowResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .tables
            .entry(table_id.clone())
            .or_insert_with(MemoryTable::new);

        Ok(())
    }

    async fn begin_txn(&self, table_ids: &[TableId]) -> ChangeflowResult<MemoryTransaction> {
        // Sorting gives every transaction the same lock order.
        let locked: BTreeSet<TableId> = table_ids.iter().cloned().collect();

        let write_locks = {
            let inner = self.inner.read().await;
            locked
                .iter()
                .map(|table_id| {
                    inner
                        .tables
                        .get(table_id)
                        .map(|table| table.write_lock.clone())
                        .ok_or_else(|| missing_table(table_id))
                })
                .collect::<ChangeflowResult<Vec<_>>>()?
        };

        let mut guards = Vec::with_capacity(write_locks.len());
        for write_lock in write_locks {
            guards.push(write_lock.lock_owned().await);
        }

        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            locked,
            writes: BTreeMap::new(),
            staged: BTreeMap::new(),
            guards,
        })
    }

    async fn read_all(&self, table_id: &TableId) -> ChangeflowResult<Vec<TableRow>> {
        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| missing_table(table_id))?;

        Ok(table.rows.values().cloned().collect())
    }

    async fn get_row(&self, table_id: &TableId, key: &RowKey) -> ChangeflowResult<Option<TableRow>> {
        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| missing_table(table_id))?;

        Ok(table.rows.get(key).cloned())
    }
}

impl ChangeLogStore for MemoryStore {
    async fn enable_change_tracking(&self, table_id: &TableId) -> ChangeflowResult<()> {
        let mut inner = self.inner.write().await;
        let table = inner
            .tables
            .get_mut(table_id)
            .ok_or_else(|| missing_table(table_id))?;

        if table.change_log.is_none() {
            debug!(table = %table_id, "enabling change tracking");
            table.change_log = Some(MemoryChangeLog::default());
        }

        Ok(())
    }

    async fn is_change_tracked(&self, table_id: &TableId) -> ChangeflowResult<bool> {
        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| missing_table(table_id))?;

        Ok(table.change_log.is_some())
    }

    async fn entries_after(
        &self,
        table_id: &TableId,
        after: SequenceNumber,
        limit: Option<usize>,
    ) -> ChangeflowResult<Vec<ChangeEntry>> {
        let inner = self.inner.read().await;
        let log = inner
            .tables
            .get(table_id)
            .ok_or_else(|| missing_table(table_id))?
            .change_log
            .as_ref()
            .ok_or_else(|| untracked_table(table_id))?;

        let start = log.entries.partition_point(|entry| entry.sequence <= after);
        let end = match limit {
            Some(limit) => start.saturating_add(limit).min(log.entries.len()),
            None => log.entries.len(),
        };

        Ok(log.entries[start..end].to_vec())
    }

    async fn latest_sequence(&self, table_id: &TableId) -> ChangeflowResult<SequenceNumber> {
        let inner = self.inner.read().await;
        let log = inner
            .tables
            .get(table_id)
            .ok_or_else(|| missing_table(table_id))?
            .change_log
            .as_ref()
            .ok_or_else(|| untracked_table(table_id))?;

        Ok(log.last_sequence)
    }
}

/// Transaction over a [`MemoryStore`].
///
/// Writes are buffered until commit. The write locks of the tables passed to
/// [`MemoryStore::begin_txn`] are held until the transaction is committed, rolled back or dropped.
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    locked: BTreeSet<TableId>,
    /// Buffered row writes; `None` marks a delete.
    writes: BTreeMap<TableId, BTreeMap<RowKey, Option<TableRow>>>,
    staged: BTreeMap<TableId, Vec<PendingChange>>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn ensure_locked(&self, table_id: &TableId) -> ChangeflowResult<()> {
        if !self.locked.contains(table_id) {
            bail!(
                ErrorKind::InvalidState,
                "Table not locked by transaction",
                format!("The table `{table_id}` was not part of the transaction when it began")
            );
        }

        Ok(())
    }
}

impl TableTransaction for MemoryTransaction {
    async fn get_row(&self, table_id: &TableId, key: &RowKey) -> ChangeflowResult<Option<TableRow>> {
        if let Some(write) = self.writes.get(table_id).and_then(|rows| rows.get(key)) {
            return Ok(write.clone());
        }

        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| missing_table(table_id))?;

        Ok(table.rows.get(key).cloned())
    }

    async fn put_row(&mut self, table_id: &TableId, row: TableRow) -> ChangeflowResult<()> {
        self.ensure_locked(table_id)?;
        self.writes
            .entry(table_id.clone())
            .or_default()
            .insert(row.key().clone(), Some(row));

        Ok(())
    }

    async fn delete_row(&mut self, table_id: &TableId, key: &RowKey) -> ChangeflowResult<()> {
        self.ensure_locked(table_id)?;
        self.writes
            .entry(table_id.clone())
            .or_default()
            .insert(key.clone(), None);

        Ok(())
    }

    async fn stage_changes(
        &mut self,
        table_id: &TableId,
        changes: Vec<PendingChange>,
    ) -> ChangeflowResult<()> {
        self.ensure_locked(table_id)?;
        self.staged
            .entry(table_id.clone())
            .or_default()
            .extend(changes);

        Ok(())
    }

    async fn commit(self) -> ChangeflowResult<CommitReceipt> {
        let MemoryTransaction {
            inner,
            writes,
            staged,
            guards,
            ..
        } = self;

        let committed_at = Utc::now();
        let mut inner = inner.write().await;

        // Everything is checked before the first write so a failing commit changes nothing.
        for table_id in writes.keys().chain(staged.keys()) {
            let table = inner
                .tables
                .get(table_id)
                .ok_or_else(|| missing_table(table_id))?;
            if staged.contains_key(table_id) && table.change_log.is_none() {
                return Err(untracked_table(table_id));
            }
        }

        for (table_id, rows) in writes {
            let table = inner
                .tables
                .get_mut(&table_id)
                .ok_or_else(|| missing_table(&table_id))?;
            for (key, row) in rows {
                match row {
                    Some(row) => {
                        table.rows.insert(key, row);
                    }
                    None => {
                        table.rows.remove(&key);
                    }
                }
            }
        }

        let mut entries = Vec::new();
        for (table_id, changes) in staged {
            let log = inner
                .tables
                .get_mut(&table_id)
                .and_then(|table| table.change_log.as_mut())
                .ok_or_else(|| untracked_table(&table_id))?;

            for change in changes {
                log.last_sequence = log.last_sequence.next();
                let entry = ChangeEntry {
                    table_id: table_id.clone(),
                    sequence: log.last_sequence,
                    key: change.row_snapshot.key().clone(),
                    action: change.action,
                    is_update_pair: change.is_update_pair,
                    row_snapshot: change.row_snapshot,
                    committed_at,
                };
                log.entries.push(entry.clone());
                entries.push(entry);
            }
        }

        drop(inner);
        drop(guards);

        Ok(CommitReceipt {
            committed_at,
            entries,
        })
    }

    async fn rollback(self) -> ChangeflowResult<()> {
        debug!(
            tables = ?self.locked,
            discarded_writes = self.writes.values().map(|rows| rows.len()).sum::<usize>(),
            "rolling back transaction"
        );

        Ok(())
    }
}
