//! Root registration.
//!
//! A root is a client-managed array of pointer slots the collector
//! treats as always reachable. Exact roots hold client pointers and are
//! updated when objects move; ambiguous roots hold arbitrary words and
//! pin whatever they happen to reference.

use crate::error::{GcError, Result};
use indexmap::IndexMap;

/// Handle returned from root creation; required to destroy the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub(crate) id: u64,
}

pub(crate) struct RootEntry {
    pub base: *mut *mut u8,
    pub count: usize,
    pub ambiguous: bool,
}

/// All registered roots, in registration order.
#[derive(Default)]
pub(crate) struct RootSet {
    entries: IndexMap<u64, RootEntry>,
    next_id: u64,
}

impl RootSet {
    pub fn register(&mut self, base: *mut *mut u8, count: usize, ambiguous: bool) -> Result<Root> {
        if self
            .entries
            .values()
            .any(|e| e.base == base && e.count == count)
        {
            return Err(GcError::RootError(format!(
                "root at {:p} is already registered",
                base
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            RootEntry {
                base,
                count,
                ambiguous,
            },
        );
        Ok(Root { id })
    }

    pub fn unregister(&mut self, root: Root) -> Result<()> {
        self.entries
            .shift_remove(&root.id)
            .map(|_| ())
            .ok_or_else(|| {
                GcError::RootError(format!("root {} was not created by this arena", root.id))
            })
    }

    pub fn exact(&self) -> impl Iterator<Item = &RootEntry> {
        self.entries.values().filter(|e| !e.ambiguous)
    }

    pub fn ambiguous(&self) -> impl Iterator<Item = &RootEntry> {
        self.entries.values().filter(|e| e.ambiguous)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
