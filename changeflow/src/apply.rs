//! Applies change batches to target tables.

use std::fmt;
use std::slice;
use tracing::{debug, info, warn};

use crate::bail;
use crate::changeflow_error;
use crate::error::{ChangeflowError, ChangeflowResult, ErrorKind};
#[cfg(feature = "failpoints")]
use crate::failpoints::{MERGE_APPLY_BEFORE_COMMIT, changeflow_fail_point};
use crate::store::table::{TableStore, TableTransaction};
use crate::types::{ChangeAction, ChangeBatch, SequenceNumber, TableId};

/// Effect of one change entry on the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Remove the target row.
    Delete,
    /// Replace the target row with the entry's snapshot.
    Overwrite,
    /// Insert the entry's snapshot as a new row.
    Insert,
    /// Leave the target untouched.
    Skip,
}

/// Picks the effect of an entry given whether the target currently holds its key.
///
/// A delete that is half of an update is skipped since the matching insert overwrites the row. A
/// plain insert of a key the target already holds is applied as an upsert.
pub fn select_merge_action(
    action: ChangeAction,
    is_update_pair: bool,
    target_has_key: bool,
) -> MergeAction {
    match (action, is_update_pair, target_has_key) {
        (ChangeAction::Delete, false, true) => MergeAction::Delete,
        (ChangeAction::Insert, _, true) => MergeAction::Overwrite,
        (ChangeAction::Insert, false, false) => MergeAction::Insert,
        _ => MergeAction::Skip,
    }
}

/// Counts of what a merge did to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub overwritten: usize,
    pub deleted: usize,
    pub skipped: usize,
    /// Highest sequence of the applied batch, `None` for an empty batch.
    pub last_sequence: Option<SequenceNumber>,
}

impl MergeSummary {
    /// Number of entries that changed the target.
    pub fn applied(&self) -> usize {
        self.inserted + self.overwritten + self.deleted
    }

    pub fn entries(&self) -> usize {
        self.applied() + self.skipped
    }
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} overwritten, {} deleted, {} skipped",
            self.inserted, self.overwritten, self.deleted, self.skipped
        )
    }
}

/// Merges change batches into target tables, one transaction per batch.
#[derive(Debug, Clone)]
pub struct MergeApplier<S> {
    store: S,
}

impl<S> MergeApplier<S>
where
    S: TableStore + Send + Sync,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies `batch` to `target` in ascending sequence order.
    ///
    /// Key lookups see the writes of earlier entries of the same batch. If anything fails the
    /// transaction is rolled back and [`ErrorKind::TransactionAbort`] is returned; the target is then
    /// exactly as before the call. Applying the same batch again yields the same target.
    pub async fn apply(
        &self,
        target: &TableId,
        batch: &ChangeBatch,
    ) -> ChangeflowResult<MergeSummary> {
        if batch.is_empty() {
            return Ok(MergeSummary::default());
        }

        if let Some(first) = batch.entries().first() {
            if let Some(other) = batch.iter().find(|entry| entry.table_id != first.table_id) {
                bail!(
                    ErrorKind::InvalidData,
                    "Batch spans several source tables",
                    format!(
                        "Entries of `{}` and `{}` cannot be merged together",
                        first.table_id, other.table_id
                    )
                );
            }
        }

        let mut txn = self.store.begin_txn(slice::from_ref(target)).await?;

        let summary = match apply_entries(&mut txn, target, batch).await {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(table = %target, error = %rollback_err, "rollback of merge transaction failed");
                }
                return Err(abort(target, err));
            }
        };

        txn.commit().await.map_err(|err| abort(target, err))?;

        info!(
            table = %target,
            inserted = summary.inserted,
            overwritten = summary.overwritten,
            deleted = summary.deleted,
            skipped = summary.skipped,
            "merged change batch"
        );

        Ok(summary)
    }
}

async fn apply_entries<T>(
    txn: &mut T,
    target: &TableId,
    batch: &ChangeBatch,
) -> ChangeflowResult<MergeSummary>
where
    T: TableTransaction + Send,
{
    let mut summary = MergeSummary::default();

    for entry in batch.iter() {
        let target_has_key = txn.get_row(target, &entry.key).await?.is_some();

        match select_merge_action(entry.action, entry.is_update_pair, target_has_key) {
            MergeAction::Delete => {
                txn.delete_row(target, &entry.key).await?;
                summary.deleted += 1;
            }
            MergeAction::Overwrite => {
                txn.put_row(target, entry.row_snapshot.clone()).await?;
                summary.overwritten += 1;
            }
            MergeAction::Insert => {
                txn.put_row(target, entry.row_snapshot.clone()).await?;
                summary.inserted += 1;
            }
            MergeAction::Skip => {
                debug!(
                    table = %target,
                    sequence = %entry.sequence,
                    key = %entry.key,
                    action = %entry.action,
                    is_update_pair = entry.is_update_pair,
                    target_has_key,
                    "change entry has no effect on target"
                );
                summary.skipped += 1;
            }
        }

        summary.last_sequence = Some(entry.sequence);
    }

    #[cfg(feature = "failpoints")]
    changeflow_fail_point(MERGE_APPLY_BEFORE_COMMIT)?;

    Ok(summary)
}

fn abort(target: &TableId, err: ChangeflowError) -> ChangeflowError {
    if err.kind() == ErrorKind::TransactionAbort {
        return err;
    }

    changeflow_error!(
        ErrorKind::TransactionAbort,
        "Merge transaction aborted",
        format!(
            "No change was applied to `{target}`: {}",
            err.description().unwrap_or("aggregated failure")
        ),
        source: err
    )
}
