use chrono::{DateTime, Utc};
use std::fmt;

use crate::types::{RowKey, SequenceNumber, TableId, TableRow};

/// A mutation requested against a source table.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Writes the row, replacing any existing row with the same key.
    ///
    /// Replacing an existing row this way is recorded as a plain insert, not as an update.
    Insert(TableRow),
    /// Replaces an existing row; affects nothing if the key is absent.
    Update(TableRow),
    /// Removes the row with the key; affects nothing if the key is absent.
    Delete(RowKey),
}

impl Mutation {
    pub fn key(&self) -> &RowKey {
        match self {
            Mutation::Insert(row) | Mutation::Update(row) => row.key(),
            Mutation::Delete(key) => key,
        }
    }
}

/// Kind of a change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Insert,
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Insert => f.write_str("INSERT"),
            ChangeAction::Delete => f.write_str("DELETE"),
        }
    }
}

/// A change staged in a transaction, before the log assigns it a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub action: ChangeAction,
    pub is_update_pair: bool,
    pub row_snapshot: TableRow,
}

impl PendingChange {
    pub fn insert(row_snapshot: TableRow, is_update_pair: bool) -> Self {
        Self {
            action: ChangeAction::Insert,
            is_update_pair,
            row_snapshot,
        }
    }

    pub fn delete(row_snapshot: TableRow, is_update_pair: bool) -> Self {
        Self {
            action: ChangeAction::Delete,
            is_update_pair,
            row_snapshot,
        }
    }
}

/// An immutable record of one row mutation in a table's change log.
///
/// An update is recorded as a [`ChangeAction::Delete`] of the old row followed by a
/// [`ChangeAction::Insert`] of the new one, both with `is_update_pair` set.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub table_id: TableId,
    pub sequence: SequenceNumber,
    pub key: RowKey,
    pub action: ChangeAction,
    pub is_update_pair: bool,
    pub row_snapshot: TableRow,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEntry {
    /// Returns `true` for inserts that are not half of an update.
    pub fn is_plain_insert(&self) -> bool {
        self.action == ChangeAction::Insert && !self.is_update_pair
    }
}

/// An ordered batch of change entries handed from the change view to the merge applier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    entries: Vec<ChangeEntry>,
}

impl ChangeBatch {
    /// Builds a batch, sorting the entries by ascending sequence.
    pub fn new(mut entries: Vec<ChangeEntry>) -> Self {
        entries.sort_by_key(|entry| entry.sequence);
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ChangeEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the highest sequence in the batch.
    pub fn max_sequence(&self) -> Option<SequenceNumber> {
        self.entries.last().map(|entry| entry.sequence)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter()
    }
}
