//! Thin adapter over [`loro`] exposing the operations the sync layer needs:
//! local change, merge, and delta-since-position.
//!
//! A document is a single root map. Each top-level field of a handle's value
//! maps to one key of that map, so concurrent edits to different fields merge
//! without conflict and concurrent edits to one field resolve last-writer-wins.

use crate::error::{Error, Result};
use bytes::Bytes;
use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, VersionVector};
use serde_json::{Map, Value};
use std::collections::HashMap;

const ROOT: &str = "root";

/// Opaque position in a document's history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position(VersionVector);

impl Position {
    /// Fold every operation of `current` that was not authored by `local_peer`
    /// into this position.
    pub fn absorb_remote(&mut self, current: &Position, local_peer: u64) {
        for (peer, counter) in current.0.iter() {
            if *peer != local_peer {
                self.0.insert(*peer, *counter);
            }
        }
    }
}

/// A pending set of top-level field writes, applied as one committed change.
#[derive(Debug, Default)]
pub struct ChangeSet {
    ops: Vec<FieldOp>,
}

#[derive(Debug)]
enum FieldOp {
    Set(String, Value),
    Delete(String),
}

impl ChangeSet {
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.ops.push(FieldOp::Set(key.into(), value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(FieldOp::Delete(key.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub struct CrdtDoc {
    doc: LoroDoc,
}

impl CrdtDoc {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// A fresh document whose history holds `value` as one local change
    pub fn from_value(value: &Map<String, Value>) -> Result<Self> {
        let doc = Self::new();
        doc.change(|tx| {
            for (key, field) in value {
                tx.set(key.clone(), field.clone());
            }
        })?;
        Ok(doc)
    }

    /// Rebuild a document from an exported snapshot or delta
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let doc = Self::new();
        doc.merge(bytes)?;
        Ok(doc)
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    fn root(&self) -> LoroMap {
        self.doc.get_map(ROOT)
    }

    /// Apply a local change. An empty change set commits nothing.
    pub fn change<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ChangeSet),
    {
        let mut changes = ChangeSet::default();
        f(&mut changes);
        if changes.is_empty() {
            return Ok(());
        }

        let root = self.root();
        for op in changes.ops {
            match op {
                FieldOp::Set(key, value) => root
                    .insert(&key, to_loro(&value))
                    .map_err(|e| Error::Crdt(e.to_string()))?,
                FieldOp::Delete(key) => root
                    .delete(&key)
                    .map_err(|e| Error::Crdt(e.to_string()))?,
            }
        }
        self.doc.commit();
        Ok(())
    }

    /// Merge an encoded delta or snapshot. Applying the same bytes twice is a
    /// no-op; malformed bytes are rejected without touching the document.
    pub fn merge(&self, bytes: &[u8]) -> Result<()> {
        self.doc
            .import(bytes)
            .map(|_| ())
            .map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn current_position(&self) -> Position {
        Position(self.doc.oplog_vv())
    }

    /// Encoded operations not covered by `since`, or `None` if there are none
    pub fn diff_since(&self, since: &Position) -> Result<Option<Bytes>> {
        if self.current_position() == *since {
            return Ok(None);
        }
        let bytes = self
            .doc
            .export(ExportMode::updates(&since.0))
            .map_err(|e| Error::Crdt(e.to_string()))?;
        Ok(Some(bytes.into()))
    }

    /// Full snapshot of the document
    pub fn export(&self) -> Result<Bytes> {
        self.doc
            .export(ExportMode::Snapshot)
            .map(Bytes::from)
            .map_err(|e| Error::Crdt(e.to_string()))
    }

    /// Current merged value of the root map
    pub fn value(&self) -> Map<String, Value> {
        match from_loro(&self.root().get_deep_value()) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Null => LoroValue::Null,
        Value::Bool(b) => LoroValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LoroValue::I64(i),
            None => LoroValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => LoroValue::from(s.as_str()),
        Value::Array(items) => LoroValue::from(items.iter().map(to_loro).collect::<Vec<_>>()),
        Value::Object(map) => LoroValue::from(
            map.iter()
                .map(|(k, v)| (k.clone(), to_loro(v)))
                .collect::<HashMap<String, LoroValue>>(),
        ),
    }
}

fn from_loro(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::I64(i) => Value::from(*i),
        LoroValue::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::Binary(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
        LoroValue::List(items) => Value::Array(items.iter().map(from_loro).collect()),
        LoroValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), from_loro(v)))
                .collect(),
        ),
        // containers are not produced by `to_loro`
        _ => Value::Null,
    }
}
