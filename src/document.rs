// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document types.
//!
//! Two shapes of the same document travel through the protocol:
//!
//! | Type | Where | System fields |
//! |------|-------|---------------|
//! | [`StoredDocument`] | inside a storage instance | `id`, `_deleted`, `_rev`, `_meta.lwt` |
//! | [`DocumentState`] | between fork and master | `id`, `_deleted` (+ `_rev`/`_meta` with `keep_meta`) |
//!
//! The primary key is always the `id` field. Everything that is not a
//! system field lives in `data` and is carried through untouched.

use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage bookkeeping attached to every stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Last write time in milliseconds since the epoch.
    pub lwt: f64,
}

impl DocumentMeta {
    /// Meta for a write happening now.
    pub fn now() -> Self {
        Self { lwt: now() }
    }
}

static LAST_LWT: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing wall-clock milliseconds for `_meta.lwt`.
///
/// Two calls never return the same value inside one process, so
/// `(lwt, id)` ordered change scans never skip a write.
pub fn now() -> f64 {
    let wall = chrono::Utc::now().timestamp_micros() as f64 / 1000.0;
    let mut next = wall;
    // fetch_update only fails when the closure returns None
    let _ = LAST_LWT.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
        let last = f64::from_bits(bits);
        next = if wall > last { wall } else { last + 0.001 };
        Some(next.to_bits())
    });
    next
}

/// Keys with a dedicated field on [`DocumentState`].
const RESERVED_FIELDS: [&str; 4] = ["id", "_deleted", "_rev", "_meta"];

/// A document as exchanged with the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub id: String,

    #[serde(rename = "_deleted", default)]
    pub deleted: bool,

    /// Only present when the replication keeps meta fields.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DocumentMeta>,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DocumentState {
    /// Build a live document from a JSON object. Non-object values yield an empty payload.
    ///
    /// `id` and the underscore fields are dropped from the payload; use
    /// [`tombstone`](Self::tombstone) for deletions.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        let mut data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for key in RESERVED_FIELDS {
            data.remove(key);
        }
        Self {
            id: id.into(),
            deleted: false,
            rev: None,
            meta: None,
            data,
        }
    }

    /// A deletion marker for `id`.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
            rev: None,
            meta: None,
            data: Map::new(),
        }
    }

    /// Parse a full JSON document (`{"id": .., "_deleted": .., ...}`).
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Revision-free content used for hashing and equality.
    pub fn content(&self) -> Value {
        content_value(&self.id, self.deleted, &self.data)
    }

    /// Same id, tombstone flag and payload. `_rev`/`_meta` are ignored.
    pub fn content_eq(&self, other: &DocumentState) -> bool {
        self.id == other.id && self.deleted == other.deleted && self.data == other.data
    }

    /// Drop `_rev`/`_meta`.
    pub fn without_meta(mut self) -> Self {
        self.rev = None;
        self.meta = None;
        self
    }
}

/// A document as held by a storage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,

    #[serde(rename = "_deleted", default)]
    pub deleted: bool,

    #[serde(rename = "_rev")]
    pub rev: Revision,

    #[serde(rename = "_meta")]
    pub meta: DocumentMeta,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl StoredDocument {
    /// New stored state for `state`, following `previous` and stamped with the current time.
    pub fn write(state: &DocumentState, previous: Option<&Revision>) -> Self {
        Self {
            id: state.id.clone(),
            deleted: state.deleted,
            rev: Revision::next(previous, &state.content()),
            meta: DocumentMeta::now(),
            data: state.data.clone(),
        }
    }

    /// New stored state that keeps an already assigned revision.
    pub fn with_revision(state: &DocumentState, rev: Revision) -> Self {
        Self {
            id: state.id.clone(),
            deleted: state.deleted,
            rev,
            meta: DocumentMeta::now(),
            data: state.data.clone(),
        }
    }

    /// Convenience for tests and seeding: first revision of a live document.
    pub fn insert(id: impl Into<String>, data: Value) -> Self {
        Self::write(&DocumentState::new(id, data), None)
    }

    /// Master-facing state. `keep_meta` carries `_rev` and `_meta` along.
    pub fn to_state(&self, keep_meta: bool) -> DocumentState {
        DocumentState {
            id: self.id.clone(),
            deleted: self.deleted,
            rev: keep_meta.then(|| self.rev.clone()),
            meta: keep_meta.then(|| self.meta.clone()),
            data: self.data.clone(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn content(&self) -> Value {
        content_value(&self.id, self.deleted, &self.data)
    }

    pub fn content_eq(&self, state: &DocumentState) -> bool {
        self.id == state.id && self.deleted == state.deleted && self.data == state.data
    }
}

fn content_value(id: &str, deleted: bool, data: &Map<String, Value>) -> Value {
    let mut map = data.clone();
    map.insert("id".to_string(), Value::String(id.to_string()));
    map.insert("_deleted".to_string(), Value::Bool(deleted));
    Value::Object(map)
}
