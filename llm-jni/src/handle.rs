//! Opaque handles standing in for native objects handed out to Java.
//!
//! A handle is a non-zero `u64` drawn from a per-table counter. Values are
//! never reused, so a handle that outlives its object can only ever miss; it
//! cannot alias a newer object.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// `0` and negative values from Java are the invalid sentinel.
    pub fn from_raw(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().and_then(NonZeroU64::new).map(Handle)
    }

    pub fn as_raw(self) -> i64 {
        // Counters start at 1 and would take centuries to pass i64::MAX.
        self.0.get() as i64
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle -> owned object table.
pub struct HandleTable<T> {
    kind: &'static str,
    next: AtomicU64,
    entries: Mutex<HashMap<Handle, Arc<T>>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        // fetch_add started at 1, so id is never zero.
        let handle = Handle(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN));
        self.lock().insert(handle, Arc::new(value));
        handle
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        self.lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow!("unknown {} handle {}", self.kind, handle))
    }

    /// Removes the entry; in-flight users keep their `Arc` until they finish.
    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        self.lock().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Handle, Arc<T>>> {
        // The map is only touched by insert/get/remove, none of which can
        // leave it half-updated, so a poisoned lock is still consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
