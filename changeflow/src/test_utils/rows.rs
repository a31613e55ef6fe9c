use crate::types::{Mutation, RowKey, TableRow};

/// Builds a member row with a `name` and a `score` column.
pub fn member(id: i64, name: &str, score: i64) -> TableRow {
    TableRow::new(id).with("name", name).with("score", score)
}

pub fn insert_member(id: i64, name: &str, score: i64) -> Mutation {
    Mutation::Insert(member(id, name, score))
}

pub fn update_member(id: i64, name: &str, score: i64) -> Mutation {
    Mutation::Update(member(id, name, score))
}

pub fn delete_member(id: i64) -> Mutation {
    Mutation::Delete(RowKey::from(id))
}

