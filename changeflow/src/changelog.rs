//! Append side of the per-table change logs.

use chrono::Utc;
use std::slice;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::store::log::ChangeLogStore;
use crate::store::table::{TableStore, TableTransaction};
use crate::types::{ChangeEntry, Mutation, PendingChange, SequenceNumber, TableId};

/// Applies mutations to tracked source tables and records them in the table's change log.
///
/// Each call writes the rows and stages the matching change entries in one store transaction, so
/// readers of the log never observe an entry whose row mutation did not commit.
#[derive(Debug, Clone)]
pub struct ChangeLog<S> {
    store: S,
}

impl<S> ChangeLog<S>
where
    S: TableStore + ChangeLogStore + Send + Sync,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Starts recording changes of `table_id`, creating the table if needed.
    pub async fn track_table(&self, table_id: &TableId) -> ChangeflowResult<()> {
        self.store.create_table(table_id).await?;
        self.store.enable_change_tracking(table_id).await
    }

    /// Applies a single mutation, returning the change entries it appended.
    pub async fn append(
        &self,
        table_id: &TableId,
        mutation: Mutation,
    ) -> ChangeflowResult<Vec<ChangeEntry>> {
        self.append_all(table_id, vec![mutation]).await
    }

    /// Applies `mutations` in order within one transaction.
    ///
    /// Either every mutation and its entries become visible, or none does. Later mutations observe
    /// the rows written by earlier ones in the same call.
    pub async fn append_all(
        &self,
        table_id: &TableId,
        mutations: Vec<Mutation>,
    ) -> ChangeflowResult<Vec<ChangeEntry>> {
        if !self.store.is_change_tracked(table_id).await? {
            bail!(
                ErrorKind::ConfigurationError,
                "Change tracking not enabled",
                format!("Mutations of table `{table_id}` cannot be recorded")
            );
        }

        let mut txn = self.store.begin_txn(slice::from_ref(table_id)).await?;

        let changes = match stage_mutations(&mut txn, table_id, mutations).await {
            Ok(changes) => changes,
            Err(err) => {
                txn.rollback().await?;
                return Err(err);
            }
        };

        if changes == 0 {
            txn.rollback().await?;
            return Ok(Vec::new());
        }

        let receipt = txn.commit().await?;

        info!(
            table = %table_id,
            entries = receipt.entries.len(),
            last_sequence = ?receipt.entries.last().map(|entry| entry.sequence),
            "appended change entries"
        );

        Ok(receipt.entries)
    }

    /// Returns committed entries of `table_id` after `after`, ascending.
    pub async fn entries_after(
        &self,
        table_id: &TableId,
        after: SequenceNumber,
        limit: Option<usize>,
    ) -> ChangeflowResult<Vec<ChangeEntry>> {
        self.store.entries_after(table_id, after, limit).await
    }

    pub async fn latest_sequence(&self, table_id: &TableId) -> ChangeflowResult<SequenceNumber> {
        self.store.latest_sequence(table_id).await
    }
}

/// Writes the rows of `mutations` and stages their change entries, returning how many were staged.
async fn stage_mutations<T>(
    txn: &mut T,
    table_id: &TableId,
    mutations: Vec<Mutation>,
) -> ChangeflowResult<usize>
where
    T: TableTransaction + Send,
{
    let now = Utc::now();
    let mut changes = Vec::with_capacity(mutations.len());

    for mutation in mutations {
        let previous = txn.get_row(table_id, mutation.key()).await?;

        match mutation {
            Mutation::Insert(mut row) => {
                row.touch(now);
                txn.put_row(table_id, row.clone()).await?;
                changes.push(PendingChange::insert(row, false));
            }
            Mutation::Update(mut row) => {
                let Some(old_row) = previous else {
                    debug!(table = %table_id, key = %row.key(), "update matched no row");
                    continue;
                };

                row.touch(now);
                txn.put_row(table_id, row.clone()).await?;
                changes.push(PendingChange::delete(old_row, true));
                changes.push(PendingChange::insert(row, true));
            }
            Mutation::Delete(key) => {
                let Some(old_row) = previous else {
                    debug!(table = %table_id, %key, "delete matched no row");
                    continue;
                };

                txn.delete_row(table_id, &key).await?;
                changes.push(PendingChange::delete(old_row, false));
            }
        }
    }

    let staged = changes.len();
    if staged > 0 {
        txn.stage_changes(table_id, changes).await?;
    }

    Ok(staged)
}
