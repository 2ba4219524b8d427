//! Finalization queue.
//!
//! Collections push entries for objects they proved unreachable; the
//! allocating mutator drains the queue every `finalization_interval`
//! allocations and runs the per-type finalizers. Entries waiting in the
//! queue are exact roots: the object must stay alive (and follow any
//! moves) until its finalizer has run.

use crate::collector::FinalizableEntry;

#[derive(Default)]
pub(crate) struct FinalizerQueue {
    pending: Vec<FinalizableEntry>,
}

impl FinalizerQueue {
    /// Queue entries discovered dead by a collection.
    pub fn extend(&mut self, entries: Vec<FinalizableEntry>) {
        self.pending.extend(entries);
    }

    /// Take everything currently queued.
    pub fn take(&mut self) -> Vec<FinalizableEntry> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Object slots of queued entries, scanned as exact roots so queued
    /// objects survive and track moves until drained.
    pub fn slots(&mut self) -> Vec<*mut *mut u8> {
        self.pending
            .iter_mut()
            .map(|e| &mut e.obj as *mut *mut u8)
            .collect()
    }
}
