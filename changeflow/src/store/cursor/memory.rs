use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ChangeflowResult;
use crate::store::cursor::base::{advanced_cursor, checked_advanced_cursor};
use crate::store::cursor::{Cursor, CursorStore};
use crate::types::{ConsumerId, SequenceNumber};

/// In-memory cursor store.
///
/// Cursors are lost when the process exits; use [`crate::store::cursor::file::JsonFileCursorStore`]
/// when consumers must resume where they stopped.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursors: Arc<Mutex<BTreeMap<ConsumerId, Cursor>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    async fn get_cursor(&self, consumer_id: &ConsumerId) -> ChangeflowResult<Option<Cursor>> {
        let cursors = self.cursors.lock().await;

        Ok(cursors.get(consumer_id).cloned())
    }

    async fn get_cursors(&self) -> ChangeflowResult<Vec<Cursor>> {
        let cursors = self.cursors.lock().await;

        Ok(cursors.values().cloned().collect())
    }

    async fn advance(
        &self,
        consumer_id: &ConsumerId,
        sequence: SequenceNumber,
    ) -> ChangeflowResult<Cursor> {
        let mut cursors = self.cursors.lock().await;
        let current = cursors.get(consumer_id);

        match advanced_cursor(consumer_id, current, sequence) {
            Some(cursor) => {
                cursors.insert(consumer_id.clone(), cursor.clone());
                Ok(cursor)
            }
            None => Ok(current
                .cloned()
                .unwrap_or_else(|| Cursor::new(consumer_id.clone(), sequence))),
        }
    }

    async fn compare_and_advance(
        &self,
        consumer_id: &ConsumerId,
        expected: SequenceNumber,
        sequence: SequenceNumber,
    ) -> ChangeflowResult<Cursor> {
        let mut cursors = self.cursors.lock().await;
        let current = cursors.get(consumer_id);

        match checked_advanced_cursor(consumer_id, current, expected, sequence)? {
            Some(cursor) => {
                cursors.insert(consumer_id.clone(), cursor.clone());
                Ok(cursor)
            }
            None => Ok(current
                .cloned()
                .unwrap_or_else(|| Cursor::new(consumer_id.clone(), expected))),
        }
    }
}
