use fail::fail_point;

use crate::bail;
use crate::error::{ChangeflowResult, ErrorKind};

pub const MERGE_APPLY_BEFORE_COMMIT: &str = "merge_apply.before_commit";
pub const MERGE_CYCLE_BEFORE_CURSOR_COMMIT: &str = "merge_cycle.before_cursor_commit";

/// Returns an error when the fail point `name` is configured with `return`.
///
/// The optional parameter picks the error kind: `abort`, `storage` or `conflict`. Anything else
/// raises [`ErrorKind::FailPointInjected`].
pub fn changeflow_fail_point(name: &str) -> ChangeflowResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("abort") => ErrorKind::TransactionAbort,
            Some("storage") => ErrorKind::StorageError,
            Some("conflict") => ErrorKind::ConcurrentCursorConflict,
            _ => ErrorKind::FailPointInjected,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
