//! Location-dependent watch objects.
//!
//! A watch records a set of addresses and answers whether any of them
//! may have moved since it was armed. Hash containers keyed on object
//! identity use this to invalidate themselves after a moving collection.
//!
//! Moves are recorded per collection epoch in a versioned history. The
//! writer is the collector, inside the stop-the-world window; readers
//! are mutators, which validate the version word around every read and
//! retry on a change (seqlock).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Epochs of move ranges retained before watches degrade to "assume
/// moved".
const KEPT_EPOCHS: usize = 32;

struct EpochMoves {
    epoch: u64,
    /// `(from, to, size)` ranges; `to` is unused by queries but kept for
    /// diagnostics.
    moves: Vec<(usize, usize, usize)>,
}

struct HistoryInner {
    /// Current collection epoch. Bumped by every collection that may
    /// move objects.
    epoch: u64,
    recent: VecDeque<EpochMoves>,
}

/// Versioned history of object moves.
pub struct History {
    /// Seqlock word: odd while a writer is active.
    version: AtomicU64,
    inner: UnsafeCell<HistoryInner>,
}

// Writers run single-threaded inside the stop-the-world window; readers
// only ever read, guarded by the version word.
unsafe impl Sync for History {}
unsafe impl Send for History {}

impl History {
    pub fn new() -> History {
        History {
            version: AtomicU64::new(0),
            inner: UnsafeCell::new(HistoryInner {
                epoch: 0,
                recent: VecDeque::new(),
            }),
        }
    }

    /// Current collection epoch.
    pub fn epoch(&self) -> u64 {
        self.read(|inner| inner.epoch)
    }

    /// Begin recording a new epoch of moves. Collector only, world
    /// stopped.
    pub fn begin_epoch(&self) {
        let v = self.version.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(v % 2, 0, "nested history write");
        let inner = unsafe { &mut *self.inner.get() };
        inner.epoch += 1;
        inner.recent.push_back(EpochMoves {
            epoch: inner.epoch,
            moves: Vec::new(),
        });
        while inner.recent.len() > KEPT_EPOCHS {
            inner.recent.pop_front();
        }
    }

    /// Record one move. Collector only, between `begin_epoch` and
    /// `end_epoch`.
    pub fn record(&self, from: usize, to: usize, size: usize) {
        debug_assert_eq!(self.version.load(Ordering::Relaxed) % 2, 1);
        let inner = unsafe { &mut *self.inner.get() };
        inner
            .recent
            .back_mut()
            .expect("record outside an epoch")
            .moves
            .push((from, to, size));
    }

    /// Finish the epoch and republish to readers.
    pub fn end_epoch(&self) {
        let v = self.version.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(v % 2, 1, "end_epoch without begin_epoch");
    }

    /// Did any address in `addrs` land inside a moved range after
    /// `since`? Degrades to true when the history no longer reaches back
    /// that far.
    pub fn any_moved(&self, addrs: &[usize], since: u64) -> bool {
        self.read(|inner| {
            if inner.epoch == since {
                return false;
            }
            // If the oldest retained epoch is newer than `since + 1`,
            // moves have been dropped; be conservative.
            match inner.recent.front() {
                Some(front) if front.epoch > since + 1 => return true,
                None if inner.epoch > since => return true,
                _ => {}
            }
            for e in inner.recent.iter().filter(|e| e.epoch > since) {
                for &(from, _, size) in &e.moves {
                    for &a in addrs {
                        if a >= from && a < from + size {
                            return true;
                        }
                    }
                }
            }
            false
        })
    }

    fn read<R>(&self, f: impl Fn(&HistoryInner) -> R) -> R {
        let backoff = crossbeam::utils::Backoff::new();
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 % 2 == 1 {
                backoff.snooze();
                continue;
            }
            let result = f(unsafe { &*self.inner.get() });
            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 {
                return result;
            }
            backoff.snooze();
        }
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of watched addresses tied to an arena's history.
pub struct Watch {
    history: Arc<History>,
    addrs: Vec<usize>,
    armed: u64,
}

impl Watch {
    pub(crate) fn new(history: Arc<History>) -> Watch {
        let armed = history.epoch();
        Watch {
            history,
            addrs: Vec::new(),
            armed,
        }
    }

    /// Watch the location of `ptr`.
    pub fn add(&mut self, ptr: *const u8) {
        self.addrs.push(ptr as usize);
    }

    /// Has any watched address possibly moved since the watch was armed
    /// (or last cleared)?
    pub fn moved(&self) -> bool {
        self.history.any_moved(&self.addrs, self.armed)
    }

    /// Forget all addresses and re-arm at the current epoch.
    pub fn clear(&mut self) {
        self.addrs.clear();
        self.armed = self.history.epoch();
    }

    /// Number of watched addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
