//! Shared protocol types and well-known queue names.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Durable queue the orchestrator publishes job requests to.
pub const WORK_QUEUE: &str = "hpc-jobs";

/// Durable queue workers publish responses to. Shared by every
/// outstanding request; responses are told apart by correlation id.
pub const REPLY_QUEUE: &str = "hpc-results";

/// Named binary slots (job inputs or outputs), keyed by wire name.
pub type NamedBlobs = BTreeMap<String, Vec<u8>>;

/// Named job settings, keyed by the setting's display name.
pub type Settings = BTreeMap<String, SettingValue>;

// ---------------------------------------------------------------------------
// CorrelationId
// ---------------------------------------------------------------------------

/// Opaque token linking a response back to the request that produced it.
///
/// Carried in the broker's `correlation_id` message property, never in the
/// message body. Generated ids are random UUID v4 strings, so two
/// concurrently outstanding requests never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// SettingValue
// ---------------------------------------------------------------------------

/// A scalar job setting as it appears on the wire.
///
/// Deserialization tries the variants in order, so JSON `10` becomes
/// [`SettingValue::Integer`] and `10.5` becomes [`SettingValue::Float`].
/// Arrays, objects and `null` are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
