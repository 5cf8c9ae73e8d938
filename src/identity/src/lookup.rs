//! Reverse-lookup rows: `(type, value) -> userId`.

use cluster::{Row, row};
use serde_json::Value;

use crate::model::{FreedIdentifier, IdentifierKind};

pub const TYPE_COLUMN: &str = "type";
pub const VALUE_COLUMN: &str = "value";
pub const OWNER_COLUMN: &str = "userId";

/// Primary key of a reverse-lookup row.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub kind: IdentifierKind,
    pub value: String,
}

impl LookupKey {
    pub fn new(kind: IdentifierKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn to_row(&self) -> Row {
        row([
            (TYPE_COLUMN, Value::from(self.kind.as_str())),
            (VALUE_COLUMN, Value::from(self.value.as_str())),
        ])
    }

    /// Key of a stored lookup row; `None` when the row is malformed.
    pub fn from_row(row: &Row) -> Option<Self> {
        let kind = row.get(TYPE_COLUMN)?.as_str()?.parse().ok()?;
        let value = row.get(VALUE_COLUMN)?.as_str()?;
        Some(Self::new(kind, value))
    }
}

impl From<&FreedIdentifier> for LookupKey {
    fn from(freed: &FreedIdentifier) -> Self {
        Self::new(freed.kind, freed.value.clone())
    }
}

impl std::fmt::Display for LookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Owning user id stored in a lookup row.
pub fn owner(row: &Row) -> Option<&str> {
    row.get(OWNER_COLUMN).and_then(Value::as_str)
}

/// Delete condition holding the owner column of `stored` as read, so the
/// delete misses a row rebound after that read.
pub fn owner_unchanged(stored: &Row) -> Row {
    let owner = stored.get(OWNER_COLUMN).cloned().unwrap_or(Value::Null);
    row([(OWNER_COLUMN, owner)])
}
