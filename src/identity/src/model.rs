//! User identity records and the identifier kinds they bind.

use std::fmt;
use std::str::FromStr;

use cluster::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of contact identifier bound to a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Email,
    Phone,
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown identifier kind: {0}")]
pub struct UnknownIdentifierKind(pub String);

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 2] = [IdentifierKind::Email, IdentifierKind::Phone];

    /// Name used in requests and as the `type` column of lookup rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Email => "email",
            IdentifierKind::Phone => "phone",
        }
    }

    pub fn value_column(&self) -> &'static str {
        self.as_str()
    }

    pub fn masked_column(&self) -> &'static str {
        match self {
            IdentifierKind::Email => "maskedEmail",
            IdentifierKind::Phone => "maskedPhone",
        }
    }

    pub fn previous_column(&self) -> &'static str {
        match self {
            IdentifierKind::Email => "prevUsedEmail",
            IdentifierKind::Phone => "prevUsedPhone",
        }
    }

    /// Flag bit that is set while an identifier of this kind is bound.
    pub fn flag(&self) -> UserFlags {
        match self {
            IdentifierKind::Email => UserFlags::EMAIL_VERIFIED,
            IdentifierKind::Phone => UserFlags::PHONE_VERIFIED,
        }
    }
}

impl FromStr for IdentifierKind {
    type Err = UnknownIdentifierKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(IdentifierKind::Email),
            "phone" => Ok(IdentifierKind::Phone),
            _ => Err(UnknownIdentifierKind(s.to_string())),
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `flagsValue` bitmask of a user record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserFlags(u32);

impl UserFlags {
    pub const PHONE_VERIFIED: UserFlags = UserFlags(1);
    pub const EMAIL_VERIFIED: UserFlags = UserFlags(2);
    pub const STATE_VALIDATED: UserFlags = UserFlags(4);

    pub fn from_bits(bits: u32) -> Self {
        UserFlags(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: UserFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: UserFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: UserFlags) {
        self.0 &= !other.0;
    }
}

/// The persisted identity state of one user (table `user`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentityRecord {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub masked_email: Option<String>,
    #[serde(default)]
    pub masked_phone: Option<String>,
    #[serde(default)]
    pub prev_used_email: Option<String>,
    #[serde(default)]
    pub prev_used_phone: Option<String>,
    #[serde(default)]
    pub flags_value: UserFlags,
}

/// An identifier value released by a free-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreedIdentifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl UserIdentityRecord {
    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(row))
    }

    pub fn to_row(&self) -> Result<Row, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            _ => Ok(Row::new()),
        }
    }

    pub fn identifier(&self, kind: IdentifierKind) -> Option<&str> {
        let value = match kind {
            IdentifierKind::Email => self.email.as_deref(),
            IdentifierKind::Phone => self.phone.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn masked(&self, kind: IdentifierKind) -> Option<&str> {
        match kind {
            IdentifierKind::Email => self.masked_email.as_deref(),
            IdentifierKind::Phone => self.masked_phone.as_deref(),
        }
    }

    pub fn previous(&self, kind: IdentifierKind) -> Option<&str> {
        match kind {
            IdentifierKind::Email => self.prev_used_email.as_deref(),
            IdentifierKind::Phone => self.prev_used_phone.as_deref(),
        }
    }

    pub fn is_bound(&self, kind: IdentifierKind) -> bool {
        self.identifier(kind).is_some()
    }

    /// Release the identifier of `kind`: its value moves to the single
    /// previous-value slot, value and mask are cleared and the flag bit is
    /// dropped. Returns `None` when nothing was bound.
    pub fn free(&mut self, kind: IdentifierKind) -> Option<FreedIdentifier> {
        let value = self.identifier(kind)?.to_string();
        let (current, masked, previous) = match kind {
            IdentifierKind::Email => (
                &mut self.email,
                &mut self.masked_email,
                &mut self.prev_used_email,
            ),
            IdentifierKind::Phone => (
                &mut self.phone,
                &mut self.masked_phone,
                &mut self.prev_used_phone,
            ),
        };
        *current = None;
        *masked = None;
        *previous = Some(value.clone());
        self.flags_value.remove(kind.flag());
        Some(FreedIdentifier { kind, value })
    }
}

/// Changes computed for one free-up request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FreeUpPlan {
    pub freed: Vec<FreedIdentifier>,
    /// Columns of the user row to write.
    pub changes: Row,
    /// Fields mirrored to the search index.
    pub projection: Row,
}

impl FreeUpPlan {
    /// Apply `kinds` to `record` and collect the resulting column changes.
    /// Kinds that are not bound are skipped.
    pub fn compute(record: &mut UserIdentityRecord, kinds: &[IdentifierKind]) -> Self {
        let mut plan = FreeUpPlan::default();
        for &kind in kinds {
            if plan.freed.iter().any(|f| f.kind == kind) {
                continue;
            }
            let Some(freed) = record.free(kind) else {
                continue;
            };
            plan.changes.insert(kind.value_column().into(), Value::Null);
            plan.changes.insert(kind.masked_column().into(), Value::Null);
            plan.changes.insert(
                kind.previous_column().into(),
                Value::String(freed.value.clone()),
            );
            plan.projection.insert(kind.masked_column().into(), Value::Null);
            plan.freed.push(freed);
        }

        if !plan.freed.is_empty() {
            let flags = Value::from(record.flags_value.bits());
            plan.changes.insert("flagsValue".into(), flags.clone());
            plan.projection.insert("flagsValue".into(), flags);
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.freed.is_empty()
    }
}
