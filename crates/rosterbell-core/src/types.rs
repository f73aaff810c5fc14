//! Shared notification types: kinds, recipients and flat payload snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RosterbellError;

/// Logical notification type. Also the default template id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DigestDaily,
    DigestWeekly,
    Reminder,
    Overdue,
    Escalation,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 5] = [
        NotificationKind::DigestDaily,
        NotificationKind::DigestWeekly,
        NotificationKind::Reminder,
        NotificationKind::Overdue,
        NotificationKind::Escalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::DigestDaily => "digest_daily",
            NotificationKind::DigestWeekly => "digest_weekly",
            NotificationKind::Reminder => "reminder",
            NotificationKind::Overdue => "overdue",
            NotificationKind::Escalation => "escalation",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = RosterbellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            "digest_daily" => Ok(NotificationKind::DigestDaily),
            "digest_weekly" => Ok(NotificationKind::DigestWeekly),
            "reminder" => Ok(NotificationKind::Reminder),
            "overdue" => Ok(NotificationKind::Overdue),
            "escalation" => Ok(NotificationKind::Escalation),
            other => Err(RosterbellError::Config(format!(
                "Unknown notification kind: '{other}'"
            ))),
        }
    }
}

/// Who a notification goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Linked employee record id.
    pub employee_id: i64,
    pub email: String,
    pub name: String,
}

impl Recipient {
    pub fn new(employee_id: i64, email: &str, name: &str) -> Self {
        Self {
            employee_id,
            email: email.to_string(),
            name: name.to_string(),
        }
    }
}

/// A primitive payload value. There is no nested variant, so a payload can
/// never hold a live reference into entity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Flat, ordered mapping of field name to primitive value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, FieldValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    /// Copy every field of `other` into this payload, prefixing keys.
    pub fn merge_prefixed(&mut self, prefix: &str, other: &Payload) {
        for (k, v) in other.iter() {
            self.0.insert(format!("{prefix}{k}"), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

/// Row-of-primitives view of an entity, taken at call time.
///
/// Job payloads, broadcast events and export collaborators all consume
/// entities through this contract.
pub trait Snapshot {
    fn snapshot(&self) -> Payload;
}

impl Snapshot for Recipient {
    fn snapshot(&self) -> Payload {
        Payload::new()
            .with("employee_id", self.employee_id)
            .with("email", self.email.as_str())
            .with("name", self.name.as_str())
    }
}
