// ABOUTME: Change event model - operation tag, ordered row images, table identity
// ABOUTME: Exactly one of before/after is populated, determined by the operation tag

use serde_json::{Map, Value as JsonValue};

use crate::value::Value;

/// Operation tag of a captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    /// Wire code: "c", "u" or "d".
    pub fn code(self) -> &'static str {
        match self {
            Self::Create => "c",
            Self::Update => "u",
            Self::Delete => "d",
        }
    }

    /// Parse the derived operation tag selected from the change log.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(Self::Create),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// An ordered name/value projection of one row.
///
/// Order matches the catalog scan order it was built from; lookups by
/// name are incidental, iteration order is the contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage {
    entries: Vec<(String, Value)>,
}

impl RowImage {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Render as a JSON object in image order.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            map.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

/// One captured row-level change.
///
/// Delete events carry a primary-key-only before-image; create and
/// update events carry a full-row after-image. Never both.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub owner: String,
    pub table: String,
    pub op: ChangeOp,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    /// Monotonically increasing per-row version token from the source.
    pub row_version: i64,
    /// Capture timestamp, epoch milliseconds.
    pub ts_ms: i64,
    /// Change-log sequence number; ordering within the table.
    pub sequence: i64,
}

impl ChangeEvent {
    /// Message key for push delivery: `<owner>.<table>-<sequence>`.
    pub fn message_key(&self) -> String {
        format!("{}.{}-{}", self.owner, self.table, self.sequence)
    }

    /// The image the sink applies: after for create/update, before for delete.
    pub fn image(&self) -> Option<&RowImage> {
        match self.op {
            ChangeOp::Create | ChangeOp::Update => self.after.as_ref(),
            ChangeOp::Delete => self.before.as_ref(),
        }
    }
}
