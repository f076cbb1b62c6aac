//! Per-request execution context and chain state.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::unit::UnitId;

/// Insertion-ordered key/value map shared by the units of one run.
///
/// Replacing an existing key keeps its original position. Removing a key
/// shifts later entries down so the remaining order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainState(IndexMap<String, Value>);

impl ChainState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert or replace a value. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the state is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mutable request state passed through a chain run.
///
/// Exactly one run owns a context at a time. Background tasks receive a
/// serialized snapshot, never the live value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Request id, generated per context.
    pub request_id: Uuid,
    /// Caller identity, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Session identity, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Request payload. Preprocessors may rewrite it.
    #[serde(default)]
    pub input: Value,
    /// Outputs recorded by units, keyed by unit id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Free-form request metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// State shared between the units of one run.
    #[serde(default)]
    pub chain_state: ChainState,
}

impl ExecutionContext {
    /// New context with a fresh request id.
    #[must_use]
    pub fn new(input: Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: None,
            session_id: None,
            input,
            output: None,
            metadata: Map::new(),
            chain_state: ChainState::new(),
        }
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Record a unit's output under its id.
    pub fn record_output(&mut self, unit_id: &UnitId, value: Value) {
        let output = self
            .output
            .get_or_insert_with(|| Value::Object(Map::new()));
        if !output.is_object() {
            *output = Value::Object(Map::new());
        }
        if let Value::Object(map) = output {
            map.insert(unit_id.to_string(), value);
        }
    }

    /// JSON snapshot for handing to background tasks.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild a context from a [`snapshot`](Self::snapshot).
    ///
    /// # Errors
    ///
    /// Returns the deserialization error if `snapshot` is not a context.
    pub fn from_snapshot(snapshot: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(snapshot)
    }
}
