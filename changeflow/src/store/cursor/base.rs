use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::bail;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::types::{ConsumerId, SequenceNumber};

/// Offset of one consumer in the change log of its source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub consumer_id: ConsumerId,
    /// Highest sequence already handed to the consumer.
    pub last_consumed_sequence: SequenceNumber,
    pub updated_at: DateTime<Utc>,
}

impl Cursor {
    pub fn new(consumer_id: ConsumerId, last_consumed_sequence: SequenceNumber) -> Self {
        Self {
            consumer_id,
            last_consumed_sequence,
            updated_at: Utc::now(),
        }
    }
}

/// Durable per-consumer offsets.
///
/// A cursor never moves backwards: [`CursorStore::advance`] keeps the larger of the stored and the
/// requested sequence, and [`CursorStore::compare_and_advance`] refuses to move a cursor that changed
/// since the caller last read it.
pub trait CursorStore {
    /// Returns the stored cursor of `consumer_id`, or `None` if it never advanced.
    fn get_cursor(
        &self,
        consumer_id: &ConsumerId,
    ) -> impl Future<Output = ChangeflowResult<Option<Cursor>>> + Send;

    /// Returns every stored cursor ordered by consumer.
    fn get_cursors(&self) -> impl Future<Output = ChangeflowResult<Vec<Cursor>>> + Send;

    /// Moves the cursor to `max(current, sequence)` and returns the resulting cursor.
    fn advance(
        &self,
        consumer_id: &ConsumerId,
        sequence: SequenceNumber,
    ) -> impl Future<Output = ChangeflowResult<Cursor>> + Send;

    /// Moves the cursor to `sequence` only if it still stands at `expected`.
    ///
    /// Fails with [`crate::error::ErrorKind::ConcurrentCursorConflict`] when the stored sequence
    /// differs from `expected`. A `sequence` lower than `expected` leaves the cursor where it is.
    fn compare_and_advance(
        &self,
        consumer_id: &ConsumerId,
        expected: SequenceNumber,
        sequence: SequenceNumber,
    ) -> impl Future<Output = ChangeflowResult<Cursor>> + Send;

    /// Returns the last consumed sequence, [`SequenceNumber::ZERO`] for unknown consumers.
    fn get(
        &self,
        consumer_id: &ConsumerId,
    ) -> impl Future<Output = ChangeflowResult<SequenceNumber>> + Send
    where
        Self: Sync,
    {
        async move {
            Ok(self
                .get_cursor(consumer_id)
                .await?
                .map(|cursor| cursor.last_consumed_sequence)
                .unwrap_or(SequenceNumber::ZERO))
        }
    }
}

/// Computes the cursor resulting from advancing `current` to `sequence`.
///
/// Returns `None` when the cursor would not move.
pub(super) fn advanced_cursor(
    consumer_id: &ConsumerId,
    current: Option<&Cursor>,
    sequence: SequenceNumber,
) -> Option<Cursor> {
    let current_sequence = current
        .map(|cursor| cursor.last_consumed_sequence)
        .unwrap_or(SequenceNumber::ZERO);

    if sequence <= current_sequence && current.is_some() {
        return None;
    }

    Some(Cursor::new(
        consumer_id.clone(),
        sequence.max(current_sequence),
    ))
}

/// Checks that `current` still stands at `expected` before advancing it.
pub(super) fn checked_advanced_cursor(
    consumer_id: &ConsumerId,
    current: Option<&Cursor>,
    expected: SequenceNumber,
    sequence: SequenceNumber,
) -> ChangeflowResult<Option<Cursor>> {
    let current_sequence = current
        .map(|cursor| cursor.last_consumed_sequence)
        .unwrap_or(SequenceNumber::ZERO);

    if current_sequence != expected {
        bail!(
            ErrorKind::ConcurrentCursorConflict,
            "Cursor moved concurrently",
            format!(
                "The cursor of consumer `{consumer_id}` is at {current_sequence}, expected {expected}"
            )
        );
    }

    Ok(advanced_cursor(consumer_id, current, sequence))
}
