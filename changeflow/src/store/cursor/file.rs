use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::changeflow_error;
use crate::error::{ChangeflowResult, ErrorKind};
use crate::store::cursor::base::{advanced_cursor, checked_advanced_cursor};
use crate::store::cursor::{Cursor, CursorStore};
use crate::types::{ConsumerId, SequenceNumber};

/// On-disk layout of the cursor document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorDocument {
    cursors: Vec<Cursor>,
}

/// Cursor store persisting every cursor in a single JSON document.
///
/// The document is rewritten on each advance through a temporary file renamed over the previous
/// version, so a crash leaves either the old or the new document on disk. The in-memory copy is only
/// updated once the rename succeeded.
#[derive(Debug, Clone)]
pub struct JsonFileCursorStore {
    path: Arc<PathBuf>,
    cursors: Arc<Mutex<BTreeMap<ConsumerId, Cursor>>>,
}

impl JsonFileCursorStore {
    /// Opens the store at `path`, loading the cursors it already holds.
    ///
    /// A missing file is treated as an empty store and created on the first advance.
    pub async fn open(path: impl Into<PathBuf>) -> ChangeflowResult<Self> {
        let path = path.into();

        let cursors = match fs::read(&path).await {
            Ok(contents) => {
                let document: CursorDocument = serde_json::from_slice(&contents)?;
                document
                    .cursors
                    .into_iter()
                    .map(|cursor| (cursor.consumer_id.clone(), cursor))
                    .collect()
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        info!(
            path = %path.display(),
            cursors = cursors.len(),
            "opened cursor store"
        );

        Ok(Self {
            path: Arc::new(path),
            cursors: Arc::new(Mutex::new(cursors)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, cursors: &BTreeMap<ConsumerId, Cursor>) -> ChangeflowResult<()> {
        let document = CursorDocument {
            cursors: cursors.values().cloned().collect(),
        };
        let contents = serde_json::to_vec_pretty(&document).map_err(|err| {
            changeflow_error!(
                ErrorKind::SerializationError,
                "Cursor serialization failed",
                err.to_string(),
                source: err
            )
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).await?;
        fs::rename(&temp_path, self.path.as_path()).await?;

        debug!(path = %self.path.display(), "persisted cursors");

        Ok(())
    }

    async fn store(
        &self,
        cursors: &mut BTreeMap<ConsumerId, Cursor>,
        cursor: Cursor,
    ) -> ChangeflowResult<Cursor> {
        let mut updated = cursors.clone();
        updated.insert(cursor.consumer_id.clone(), cursor.clone());
        self.persist(&updated).await?;
        *cursors = updated;

        Ok(cursor)
    }
}

impl CursorStore for JsonFileCursorStore {
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
        let current = cursors.get(consumer_id).cloned();

        match advanced_cursor(consumer_id, current.as_ref(), sequence) {
            Some(cursor) => self.store(&mut cursors, cursor).await,
            None => Ok(current.unwrap_or_else(|| Cursor::new(consumer_id.clone(), sequence))),
        }
    }

    async fn compare_and_advance(
        &self,
        consumer_id: &ConsumerId,
        expected: SequenceNumber,
        sequence: SequenceNumber,
    ) -> ChangeflowResult<Cursor> {
        let mut cursors = self.cursors.lock().await;
        let current = cursors.get(consumer_id).cloned();

        match checked_advanced_cursor(consumer_id, current.as_ref(), expected, sequence)? {
            Some(cursor) => self.store(&mut cursors, cursor).await,
            None => Ok(current.unwrap_or_else(|| Cursor::new(consumer_id.clone(), expected))),
        }
    }
}
