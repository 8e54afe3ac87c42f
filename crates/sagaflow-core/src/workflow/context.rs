//! Workflow execution context: a typed key/value store shared by every step.
//!
//! `WorkflowContext` maps string keys to JSON values. Typed access goes
//! through serde, so a step can `put` any `Serialize` value and a later step
//! can read it back as any compatible `DeserializeOwned` type. The executor is
//! the only writer during a run; steps receive immutable snapshots.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

/// Errors from typed context access.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    /// A required key is absent.
    #[error("missing required context value '{key}'")]
    MissingValue { key: String },

    /// The stored value does not deserialize into the requested type.
    #[error("context value '{key}' has unexpected type: {message}")]
    TypeMismatch { key: String, message: String },

    /// A value could not be converted to or from JSON.
    #[error("context serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// String-keyed store of JSON values flowing through a workflow run.
///
/// Keys are never removed during a run. A key holding JSON `null` is present;
/// only a key that was never written is absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowContext {
    values: BTreeMap<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a context from a persisted JSON object snapshot.
    ///
    /// `null` is accepted as an empty context.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            other => Err(ContextError::Serialization(format!(
                "expected a JSON object for context snapshot, got {other}"
            ))),
        }
    }

    /// Snapshot the context as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Store a typed value under `key`, overwriting any previous value.
    pub fn put<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), ContextError> {
        let value =
            serde_json::to_value(value).map_err(|e| ContextError::Serialization(e.to_string()))?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    /// Store a raw JSON value under `key`.
    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Read `key` as `T`. Returns `Ok(None)` if the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContextError> {
        self.values
            .get(key)
            .map(|value| decode(key, value))
            .transpose()
    }

    /// Read `key` as `T`, failing with `MissingValue` if it is absent.
    ///
    /// A present `null` is not missing: `get_required::<Option<T>>` yields
    /// `None` for it.
    pub fn get_required<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ContextError::MissingValue {
                key: key.to_string(),
            })?;
        decode(key, value)
    }

    /// Raw JSON value for `key`.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, ContextError> {
    T::deserialize(value).map_err(|e| ContextError::TypeMismatch {
        key: key.to_string(),
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
