use std::future::Future;

use crate::error::ChangeflowResult;
use crate::types::{ChangeEntry, SequenceNumber, TableId};

/// Read access to the per-table change logs.
///
/// Entries are appended through [`crate::store::table::TableTransaction::stage_changes`]; this
/// trait only exposes what was committed.
pub trait ChangeLogStore {
    /// Starts recording change entries for the table. Enabling it twice is a no-op.
    fn enable_change_tracking(
        &self,
        table_id: &TableId,
    ) -> impl Future<Output = ChangeflowResult<()>> + Send;

    fn is_change_tracked(
        &self,
        table_id: &TableId,
    ) -> impl Future<Output = ChangeflowResult<bool>> + Send;

    /// Returns entries with a sequence strictly greater than `after`, ascending, at most `limit`.
    fn entries_after(
        &self,
        table_id: &TableId,
        after: SequenceNumber,
        limit: Option<usize>,
    ) -> impl Future<Output = ChangeflowResult<Vec<ChangeEntry>>> + Send;

    /// Returns the sequence of the newest entry, or [`SequenceNumber::ZERO`] for an empty log.
    fn latest_sequence(
        &self,
        table_id: &TableId,
    ) -> impl Future<Output = ChangeflowResult<SequenceNumber>> + Send;
}
