//! Fixed-schema, typed, timestamped key-value store.
//!
//! Both the registry (observed state) and the flag (requested state) are built on
//! [`Store`]. The key set and each key's value kind are fixed when the store is
//! created; every entry has its own lock so a value and its timestamp are always
//! read and written together.

use crate::clock::get_current_timestamp_ms;
use engine_control_shared::{ActuationRequest, ActuationType, LogEntry, Stage, Status};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Most entries a `Logs` value holds; appending past this drops the oldest.
pub const LOG_QUEUE_CAPACITY: usize = 4096;

/// Every kind of value a store entry can hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Float(f64),
    Status(Status),
    Stage(Stage),
    Actuation(ActuationType),
    Request(ActuationRequest),
    Bool(bool),
    Logs(Vec<LogEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Float,
    Status,
    Stage,
    Actuation,
    Request,
    Bool,
    Logs,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Status(_) => ValueKind::Status,
            Value::Stage(_) => ValueKind::Stage,
            Value::Actuation(_) => ValueKind::Actuation,
            Value::Request(_) => ValueKind::Request,
            Value::Bool(_) => ValueKind::Bool,
            Value::Logs(_) => ValueKind::Logs,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<Status> {
        match self {
            Value::Status(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_stage(&self) -> Option<Stage> {
        match self {
            Value::Stage(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_actuation(&self) -> Option<ActuationType> {
        match self {
            Value::Actuation(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<ActuationRequest> {
        match self {
            Value::Request(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PutError {
    #[error("put rejected for {key}: expected {expected:?}, got {got:?}")]
    UnknownKeyOrTypeMismatch {
        key: String,
        /// `None` when the key was never declared.
        expected: Option<ValueKind>,
        got: ValueKind,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("unknown key {key}")]
    UnknownKey { key: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("key {key} declared more than once")]
    DuplicateKey { key: String },
}

/// Result of a read: the value is `None` until the key is first written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp_ms: Option<u64>,
    pub value: Option<Value>,
}

/// Key set of a store with the value kind declared for each key.
#[derive(Debug, Clone)]
pub struct Schema<K> {
    kinds: Vec<(K, ValueKind)>,
}

impl<K> Default for Schema<K> {
    fn default() -> Self {
        Self { kinds: Vec::new() }
    }
}

impl<K: Eq + Debug> Schema<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, key: K, kind: ValueKind) -> Result<Self, SchemaError> {
        if self.kinds.iter().any(|(k, _)| *k == key) {
            return Err(SchemaError::DuplicateKey {
                key: format!("{key:?}"),
            });
        }
        self.kinds.push((key, kind));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }
}

#[derive(Debug)]
struct Entry {
    kind: ValueKind,
    value: Option<Value>,
    timestamp_ms: Option<u64>,
    /// Log entries dropped since the last take.
    dropped: usize,
}

/// The key map is built once and never resized, so only the entries need locks.
#[derive(Debug)]
pub struct Store<K> {
    entries: HashMap<K, Mutex<Entry>>,
}

impl<K> Store<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(schema: Schema<K>) -> Self {
        let mut entries = HashMap::with_capacity(schema.len());
        for (key, kind) in schema.kinds {
            let entry = Entry {
                kind,
                value: None,
                timestamp_ms: None,
                dropped: 0,
            };
            entries.insert(key, Mutex::new(entry));
        }
        Self { entries }
    }

    pub fn put(&self, key: &K, value: Value) -> Result<(), PutError> {
        let Some(slot) = self.entries.get(key) else {
            return Err(PutError::UnknownKeyOrTypeMismatch {
                key: format!("{key:?}"),
                expected: None,
                got: value.kind(),
            });
        };
        let mut entry = lock(slot);
        if entry.kind != value.kind() {
            return Err(PutError::UnknownKeyOrTypeMismatch {
                key: format!("{key:?}"),
                expected: Some(entry.kind),
                got: value.kind(),
            });
        }
        entry.value = Some(value);
        entry.timestamp_ms = Some(get_current_timestamp_ms());
        Ok(())
    }

    pub fn get(&self, key: &K) -> Result<Reading, LookupError> {
        let slot = self.entries.get(key).ok_or_else(|| LookupError::UnknownKey {
            key: format!("{key:?}"),
        })?;
        let entry = lock(slot);
        Ok(Reading {
            timestamp_ms: entry.timestamp_ms,
            value: entry.value.clone(),
        })
    }

    /// Appends to a `Logs` entry under its lock. Once [`LOG_QUEUE_CAPACITY`] entries are
    /// waiting the oldest is dropped, so a stalled consumer cannot grow the queue without bound.
    pub fn append_log(&self, key: &K, log: LogEntry) -> Result<(), PutError> {
        let mismatch = |expected| PutError::UnknownKeyOrTypeMismatch {
            key: format!("{key:?}"),
            expected,
            got: ValueKind::Logs,
        };
        let slot = self.entries.get(key).ok_or_else(|| mismatch(None))?;
        let mut entry = lock(slot);
        if entry.kind != ValueKind::Logs {
            return Err(mismatch(Some(entry.kind)));
        }
        let mut dropped = 0;
        match entry.value.as_mut() {
            Some(Value::Logs(queue)) => {
                if queue.len() >= LOG_QUEUE_CAPACITY {
                    dropped = queue.len() + 1 - LOG_QUEUE_CAPACITY;
                    queue.drain(..dropped);
                }
                queue.push(log);
            }
            _ => entry.value = Some(Value::Logs(vec![log])),
        }
        if dropped > 0 {
            if entry.dropped == 0 {
                tracing::warn!(key = ?key, "log queue full, dropping oldest entries");
            }
            entry.dropped += dropped;
        }
        entry.timestamp_ms = Some(get_current_timestamp_ms());
        Ok(())
    }

    /// Empties a `Logs` entry and returns what it held.
    pub fn take_logs(&self, key: &K) -> Result<Vec<LogEntry>, LookupError> {
        let slot = self.entries.get(key).ok_or_else(|| LookupError::UnknownKey {
            key: format!("{key:?}"),
        })?;
        let mut entry = lock(slot);
        if entry.dropped > 0 {
            tracing::warn!(key = ?key, dropped = entry.dropped, "log entries were dropped before draining");
            entry.dropped = 0;
        }
        match entry.value.as_mut() {
            Some(Value::Logs(queue)) => Ok(std::mem::take(queue)),
            _ => Ok(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<(K, Reading)> {
        self.entries
            .iter()
            .map(|(key, slot)| {
                let entry = lock(slot);
                (
                    key.clone(),
                    Reading {
                        timestamp_ms: entry.timestamp_ms,
                        value: entry.value.clone(),
                    },
                )
            })
            .collect()
    }
}

fn lock(slot: &Mutex<Entry>) -> MutexGuard<'_, Entry> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_control_shared::LogPriority;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum TestKey {
        Reading,
        Mode,
        Queue,
        Undeclared,
    }

    fn store() -> Store<TestKey> {
        let schema = Schema::new()
            .declare(TestKey::Reading, ValueKind::Float)
            .and_then(|s| s.declare(TestKey::Mode, ValueKind::Stage))
            .and_then(|s| s.declare(TestKey::Queue, ValueKind::Logs))
            .expect("schema");
        Store::new(schema)
    }

    fn log(header: &str) -> LogEntry {
        LogEntry {
            timestamp_ms: 0,
            header: header.to_string(),
            priority: LogPriority::Info,
            message: serde_json::json!({}),
        }
    }

    #[test]
    fn declared_but_unwritten_key_reads_absent() {
        let store = store();
        let reading = store.get(&TestKey::Reading).expect("declared key");
        assert_eq!(reading.value, None);
        assert_eq!(reading.timestamp_ms, None);
    }

    #[test]
    fn put_then_get_returns_value_and_fresh_timestamp() {
        let store = store();
        let before = get_current_timestamp_ms();
        store.put(&TestKey::Reading, Value::Float(12.5)).expect("put");
        let reading = store.get(&TestKey::Reading).expect("get");
        assert_eq!(reading.value, Some(Value::Float(12.5)));
        assert!(reading.timestamp_ms.expect("timestamp") >= before);
    }

    #[test]
    fn undeclared_key_is_rejected_both_ways() {
        let store = store();
        assert_eq!(
            store.get(&TestKey::Undeclared),
            Err(LookupError::UnknownKey {
                key: "Undeclared".to_string()
            })
        );
        assert!(matches!(
            store.put(&TestKey::Undeclared, Value::Bool(true)),
            Err(PutError::UnknownKeyOrTypeMismatch { expected: None, .. })
        ));
    }

    #[test]
    fn duplicate_declaration_fails() {
        let result = Schema::new()
            .declare(TestKey::Reading, ValueKind::Float)
            .and_then(|s| s.declare(TestKey::Reading, ValueKind::Bool));
        assert!(matches!(result, Err(SchemaError::DuplicateKey { .. })));
    }

    #[test]
    fn logs_append_and_drain() {
        let store = store();
        store.append_log(&TestKey::Queue, log("a")).expect("append");
        store.append_log(&TestKey::Queue, log("b")).expect("append");
        let drained = store.take_logs(&TestKey::Queue).expect("take");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].header, "a");
        assert!(store.take_logs(&TestKey::Queue).expect("take").is_empty());
        assert!(store.append_log(&TestKey::Reading, log("c")).is_err());
    }

    #[test]
    fn log_queue_drops_oldest_past_capacity() {
        let store = store();
        for n in 0..LOG_QUEUE_CAPACITY + 3 {
            store
                .append_log(&TestKey::Queue, log(&n.to_string()))
                .expect("append");
        }
        let drained = store.take_logs(&TestKey::Queue).expect("take");
        assert_eq!(drained.len(), LOG_QUEUE_CAPACITY);
        assert_eq!(drained[0].header, "3");
        assert_eq!(
            drained.last().map(|l| l.header.clone()),
            Some((LOG_QUEUE_CAPACITY + 2).to_string())
        );
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<f64>().prop_map(Value::Float),
            any::<bool>().prop_map(Value::Bool),
            Just(Value::Stage(Stage::Postburn)),
            Just(Value::Actuation(ActuationType::OpenVent)),
            Just(Value::Status(Status::Error)),
        ]
    }

    proptest! {
        #[test]
        fn mismatched_put_never_mutates(initial in -1.0e6f64..1.0e6, bad in arb_value()) {
            prop_assume!(bad.kind() != ValueKind::Float);
            let store = store();
            store.put(&TestKey::Reading, Value::Float(initial)).expect("put");
            let before = store.get(&TestKey::Reading).expect("get");

            let result = store.put(&TestKey::Reading, bad.clone());
            let is_mismatch = matches!(
                result,
                Err(PutError::UnknownKeyOrTypeMismatch { expected: Some(ValueKind::Float), .. })
            );
            prop_assert!(is_mismatch);
            prop_assert_eq!(store.get(&TestKey::Reading).expect("get"), before);
        }
    }
}
