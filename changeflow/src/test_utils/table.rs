use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::bail;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::store::log::ChangeLogStore;
use crate::store::table::{CommitReceipt, TableStore, TableTransaction};
use crate::types::{ChangeEntry, PendingChange, RowKey, SequenceNumber, TableId, TableRow};

const PUTS_UNLIMITED: usize = usize::MAX;

#[derive(Debug)]
struct Faults {
    /// Row writes still allowed before every further write fails.
    puts_remaining: AtomicUsize,
    fail_commits: AtomicBool,
    commit_delay_ms: AtomicU64,
}

impl Faults {
    fn check_put(&self, table_id: &TableId) -> ChangeflowResult<()> {
        let allowed = self
            .puts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    PUTS_UNLIMITED => Some(remaining),
                    0 => None,
                    remaining => Some(remaining - 1),
                }
            });

        if allowed.is_err() {
            bail!(
                ErrorKind::StorageError,
                "Injected write failure",
                format!("Writing a row of `{table_id}` failed")
            );
        }

        Ok(())
    }
}

/// Wraps a table store and injects failures into its transactions.
///
/// Change log reads are passed through unchanged, so the wrapper can stand in for the store of a
/// whole pipeline.
#[derive(Debug, Clone)]
pub struct FaultyTableStore<S> {
    inner: S,
    faults: Arc<Faults>,
}

impl<S> FaultyTableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults {
                puts_remaining: AtomicUsize::new(PUTS_UNLIMITED),
                fail_commits: AtomicBool::new(false),
                commit_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Lets `count` more row writes through, then fails every write until [`Self::heal`].
    pub fn fail_put_after(&self, count: usize) {
        self.faults.puts_remaining.store(count, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.faults.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes every commit sleep for `delay` before reaching the wrapped store.
    pub fn delay_commits(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Removes every injected fault.
    pub fn heal(&self) {
        self.faults
            .puts_remaining
            .store(PUTS_UNLIMITED, Ordering::SeqCst);
        self.faults.fail_commits.store(false, Ordering::SeqCst);
        self.faults.commit_delay_ms.store(0, Ordering::SeqCst);
    }
}

impl<S> TableStore for FaultyTableStore<S>
where
    S: TableStore + Send + Sync,
    S::Transaction: Sync,
{
    type Transaction = FaultyTransaction<S::Transaction>;

    async fn create_table(&self, table_id: &TableId) -> ChangeflowResult<()> {
        self.inner.create_table(table_id).await
    }

    async fn begin_txn(&self, table_ids: &[TableId]) -> ChangeflowResult<Self::Transaction> {
        let inner = self.inner.begin_txn(table_ids).await?;

        Ok(FaultyTransaction {
            inner,
            faults: self.faults.clone(),
        })
    }

    async fn read_all(&self, table_id: &TableId) -> ChangeflowResult<Vec<TableRow>> {
        self.inner.read_all(table_id).await
    }

    async fn get_row(
        &self,
        table_id: &TableId,
        key: &RowKey,
    ) -> ChangeflowResult<Option<TableRow>> {
        self.inner.get_row(table_id, key).await
    }
}

impl<S> ChangeLogStore for FaultyTableStore<S>
where
    S: ChangeLogStore + Send + Sync,
{
    async fn enable_change_tracking(&self, table_id: &TableId) -> ChangeflowResult<()> {
        self.inner.enable_change_tracking(table_id).await
    }

    async fn is_change_tracked(&self, table_id: &TableId) -> ChangeflowResult<bool> {
        self.inner.is_change_tracked(table_id).await
    }

    async fn entries_after(
        &self,
        table_id: &TableId,
        after: SequenceNumber,
        limit: Option<usize>,
    ) -> ChangeflowResult<Vec<ChangeEntry>> {
        self.inner.entries_after(table_id, after, limit).await
    }

    async fn latest_sequence(&self, table_id: &TableId) -> ChangeflowResult<SequenceNumber> {
        self.inner.latest_sequence(table_id).await
    }
}

/// Transaction of a [`FaultyTableStore`].
#[derive(Debug)]
pub struct FaultyTransaction<T> {
    inner: T,
    faults: Arc<Faults>,
}

impl<T> TableTransaction for FaultyTransaction<T>
where
    T: TableTransaction + Send + Sync,
{
    async fn get_row(
        &self,
        table_id: &TableId,
        key: &RowKey,
    ) -> ChangeflowResult<Option<TableRow>> {
        self.inner.get_row(table_id, key).await
    }

    async fn put_row(&mut self, table_id: &TableId, row: TableRow) -> ChangeflowResult<()> {
        self.faults.check_put(table_id)?;
        self.inner.put_row(table_id, row).await
    }

    async fn delete_row(&mut self, table_id: &TableId, key: &RowKey) -> ChangeflowResult<()> {
        self.inner.delete_row(table_id, key).await
    }

    async fn stage_changes(
        &mut self,
        table_id: &TableId,
        changes: Vec<PendingChange>,
    ) -> ChangeflowResult<()> {
        self.inner.stage_changes(table_id, changes).await
    }

    async fn commit(self) -> ChangeflowResult<CommitReceipt> {
        let delay_ms = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if self.faults.fail_commits.load(Ordering::SeqCst) {
            self.inner.rollback().await?;
            bail!(ErrorKind::StorageError, "Injected commit failure");
        }

        self.inner.commit().await
    }

    async fn rollback(self) -> ChangeflowResult<()> {
        self.inner.rollback().await
    }
}
