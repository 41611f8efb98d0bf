//! Per-handle cancellation flags shared between a generating thread and
//! whoever wants it to stop.
//!
//! Every operation takes the same lock, so a `cancel` that returns before the
//! generation loop's next poll is seen by that poll.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::handle::Handle;

#[derive(Default)]
pub struct CancellationTable {
    flags: Mutex<HashMap<Handle, bool>>,
}

impl CancellationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flag(&self, handle: Handle, value: bool) {
        self.lock().insert(handle, value);
    }

    /// False when no request is registered for `handle`.
    pub fn check_flag(&self, handle: Handle) -> bool {
        self.lock().get(&handle).copied().unwrap_or(false)
    }

    pub fn clear_flag(&self, handle: Handle) {
        self.lock().remove(&handle);
    }

    /// Flags the active request on `handle`, if there is one.
    ///
    /// Returns whether a request was found. A cancel with nothing running
    /// leaves the table untouched.
    pub fn cancel(&self, handle: Handle) -> bool {
        match self.lock().get_mut(&handle) {
            Some(flag) => {
                *flag = true;
                true
            }
            None => false,
        }
    }

    /// Starts a request on `handle` with a cleared flag. The entry is removed
    /// when the returned guard drops, whichever way the request ends.
    pub fn register(&self, handle: Handle) -> CancelGuard<'_> {
        self.set_flag(handle, false);
        CancelGuard {
            table: self,
            handle,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Handle, bool>> {
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct CancelGuard<'a> {
    table: &'a CancellationTable,
    handle: Handle,
}

impl CancelGuard<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.table.check_flag(self.handle)
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.table.clear_flag(self.handle);
        debug!("Cancellation entry for {} cleared", self.handle);
    }
}
