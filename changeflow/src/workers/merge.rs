use tracing::debug;

use crate::apply::{MergeApplier, MergeSummary};
use crate::error::ChangeflowResult;
#[cfg(feature = "failpoints")]
use crate::failpoints::{MERGE_CYCLE_BEFORE_CURSOR_COMMIT, changeflow_fail_point};
use crate::scheduler::registry::JobDefinition;
use crate::store::cursor::CursorStore;
use crate::store::log::ChangeLogStore;
use crate::store::table::TableStore;
use crate::view::ChangeView;

/// Result of one merge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The job is gated on data and there was nothing to merge.
    NoData,
    Merged(MergeSummary),
}

/// The unit of work run on every tick of a job: read the consumer's batch, merge it into the target,
/// then move the cursor.
///
/// The cursor only moves after the target transaction committed. If the cycle fails or is dropped
/// before that point the batch stays pending and the next cycle merges it again, which the applier
/// tolerates since merging a batch is idempotent.
#[derive(Debug, Clone)]
pub struct MergeCycle<S, C> {
    view: ChangeView<S, C>,
    applier: MergeApplier<S>,
    batch_limit: Option<usize>,
}

impl<S, C> MergeCycle<S, C>
where
    S: TableStore + ChangeLogStore + Clone + Send + Sync,
    C: CursorStore + Clone + Send + Sync,
{
    pub fn new(view: ChangeView<S, C>, applier: MergeApplier<S>, batch_limit: Option<usize>) -> Self {
        Self {
            view,
            applier,
            batch_limit,
        }
    }

    pub async fn run(&self, definition: &JobDefinition) -> ChangeflowResult<CycleOutcome> {
        if definition.when_has_data && !self.view.has_data(&definition.consumer).await? {
            debug!(job = %definition.id, consumer = %definition.consumer, "no pending changes");
            return Ok(CycleOutcome::NoData);
        }

        let pending = self
            .view
            .begin_consume(&definition.consumer, self.batch_limit)
            .await?;

        let summary = self
            .applier
            .apply(&definition.target_table, pending.batch())
            .await?;

        #[cfg(feature = "failpoints")]
        changeflow_fail_point(MERGE_CYCLE_BEFORE_CURSOR_COMMIT)?;

        pending.commit().await?;

        Ok(CycleOutcome::Merged(summary))
    }
}
