// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deduplicated value store.
//!
//! Holds every value this node has observed, exactly once, together with the
//! order in which values were first seen. The order is what checkpoints index
//! into: a peer's checkpoint `k` means "the first `k` values of this log have
//! been confirmed delivered".
//!
//! Values are never removed, so a position in the log is stable for the
//! lifetime of the process.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// An opaque broadcast payload, compared only by equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(pub i64);

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

#[derive(Default)]
struct Inner {
    seen: HashSet<Value>,
    log: Vec<Value>,
}

/// Convergent set of observed values with an insertion-ordered log.
///
/// The membership check and the append happen under one lock, so concurrent
/// callers racing on the same new value see exactly one `true`.
#[derive(Default)]
pub struct ValueDedupStore {
    inner: Mutex<Inner>,
}

impl ValueDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Nothing panics while the lock is held, but a poisoned lock still holds
    // a consistent set/log pair, so keep serving it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `value`; `true` iff it was not present before.
    pub fn try_insert(&self, value: Value) -> bool {
        let mut inner = self.lock();
        if inner.seen.insert(value) {
            inner.log.push(value);
            true
        } else {
            false
        }
    }

    /// Insert many values, returning the ones that were new (in input order).
    pub fn insert_all(&self, values: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut inner = self.lock();
        let mut fresh = Vec::new();
        for value in values {
            if inner.seen.insert(value) {
                inner.log.push(value);
                fresh.push(value);
            }
        }
        fresh
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.lock().seen.contains(value)
    }

    /// Number of distinct values observed.
    pub fn size(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// All values, in first-seen order.
    pub fn snapshot(&self) -> Vec<Value> {
        self.lock().log.clone()
    }

    /// Values from position `offset` onward, plus the log length they were
    /// read at. An offset past the end yields an empty slice.
    pub fn since(&self, offset: usize) -> (Vec<Value>, usize) {
        let inner = self.lock();
        let len = inner.log.len();
        let start = offset.min(len);
        (inner.log[start..].to_vec(), len)
    }
}
