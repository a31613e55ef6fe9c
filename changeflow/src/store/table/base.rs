use chrono::{DateTime, Utc};
use std::future::Future;

use crate::error::ChangeflowResult;
use crate::types::{ChangeEntry, Mutation, PendingChange, RowKey, TableId, TableRow};

/// Outcome of a committed [`TableTransaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// Commit time, also stamped on the change entries appended by the transaction.
    pub committed_at: DateTime<Utc>,
    /// Change entries made visible by the commit, in sequence order.
    pub entries: Vec<ChangeEntry>,
}

/// A key-value table store with transactional writes.
///
/// Implementations must make a transaction's row writes and staged change entries visible
/// together on commit, or not at all.
pub trait TableStore {
    type Transaction: TableTransaction + Send;

    /// Creates an empty table. Creating an existing table is a no-op.
    fn create_table(&self, table_id: &TableId) -> impl Future<Output = ChangeflowResult<()>> + Send;

    /// Starts a transaction holding exclusive write access to `table_ids` until it ends.
    ///
    /// Write locks are taken in a fixed order, so transactions over overlapping sets of tables do
    /// not deadlock.
    fn begin_txn(
        &self,
        table_ids: &[TableId],
    ) -> impl Future<Output = ChangeflowResult<Self::Transaction>> + Send;

    /// Returns all committed rows of a table ordered by key.
    fn read_all(
        &self,
        table_id: &TableId,
    ) -> impl Future<Output = ChangeflowResult<Vec<TableRow>>> + Send;

    /// Returns the committed row with `key`, if any.
    fn get_row(
        &self,
        table_id: &TableId,
        key: &RowKey,
    ) -> impl Future<Output = ChangeflowResult<Option<TableRow>>> + Send;

    fn key_exists(
        &self,
        table_id: &TableId,
        key: &RowKey,
    ) -> impl Future<Output = ChangeflowResult<bool>> + Send
    where
        Self: Sync,
    {
        async move { Ok(self.get_row(table_id, key).await?.is_some()) }
    }

    /// Applies a single mutation in its own transaction without recording change entries.
    ///
    /// Returns the row the mutation replaced or removed.
    fn mutate(
        &self,
        table_id: &TableId,
        mutation: Mutation,
    ) -> impl Future<Output = ChangeflowResult<Option<TableRow>>> + Send
    where
        Self: Sync,
    {
        async move {
            let mut txn = self.begin_txn(std::slice::from_ref(table_id)).await?;
            let previous = txn.get_row(table_id, mutation.key()).await?;

            match mutation {
                Mutation::Insert(row) => txn.put_row(table_id, row).await?,
                Mutation::Update(row) => {
                    if previous.is_some() {
                        txn.put_row(table_id, row).await?;
                    }
                }
                Mutation::Delete(key) => {
                    if previous.is_some() {
                        txn.delete_row(table_id, &key).await?;
                    }
                }
            }

            txn.commit().await?;

            Ok(previous)
        }
    }
}

/// A unit of work against a [`TableStore`].
///
/// Reads observe the transaction's own writes. Dropping a transaction without committing it
/// discards every write and staged change.
pub trait TableTransaction {
    fn get_row(
        &self,
        table_id: &TableId,
        key: &RowKey,
    ) -> impl Future<Output = ChangeflowResult<Option<TableRow>>> + Send;

    /// Writes `row`, replacing any row with the same key.
    fn put_row(
        &mut self,
        table_id: &TableId,
        row: TableRow,
    ) -> impl Future<Output = ChangeflowResult<()>> + Send;

    fn delete_row(
        &mut self,
        table_id: &TableId,
        key: &RowKey,
    ) -> impl Future<Output = ChangeflowResult<()>> + Send;

    /// Stages change entries for the table's log; sequences are assigned on commit.
    fn stage_changes(
        &mut self,
        table_id: &TableId,
        changes: Vec<PendingChange>,
    ) -> impl Future<Output = ChangeflowResult<()>> + Send;

    fn commit(self) -> impl Future<Output = ChangeflowResult<CommitReceipt>> + Send;

    fn rollback(self) -> impl Future<Output = ChangeflowResult<()>> + Send;
}
