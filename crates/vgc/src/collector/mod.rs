//! Collector implementations behind the arena.
//!
//! All three collectors share the chunked [`Space`] machinery and the
//! object format; they differ in what `collect` does. The arena hands a
//! [`World`] view into each collection: the roots to scan, the
//! finalizable registry, and the move history for watch objects.

pub mod bump;
pub mod copying;
pub mod marksweep;

use crate::error::{GcError, Result};
use crate::fmt::{self, Finalizer};
use crate::vm::Chunk;
use crate::watch::History;
use std::time::Duration;
use vela_util::align_up;

/// An array-of-pointers root range.
#[derive(Clone, Copy)]
pub struct RootRange {
    /// First pointer slot.
    pub base: *mut *mut u8,
    /// Number of slots.
    pub count: usize,
}

/// One object registered for finalization.
#[derive(Clone, Copy)]
pub struct FinalizableEntry {
    /// Client pointer; updated by moving collectors.
    pub obj: *mut u8,
    /// Per-type finalizer recorded at allocation.
    pub finalize: Finalizer,
}

/// Everything outside the dynamic space that a collection must consult.
pub struct World<'a> {
    /// Exact pointer slots: registered exact roots, type-pool
    /// back-references, pending finalization-queue entries.
    pub exact: Vec<RootRange>,
    /// Ambiguous byte ranges, scanned word by word: thread stacks and
    /// spilled register buffers, plus ambiguous roots. References found
    /// here pin objects in place.
    pub ambiguous: Vec<(usize, usize)>,
    /// Objects that are always live and never move (static space); their
    /// contents are scanned and updated like roots.
    pub pinned_objects: Vec<*mut u8>,
    /// Registry of objects whose type carries a finalizer.
    pub finalizable: &'a mut Vec<FinalizableEntry>,
    /// Entries the collection proved unreachable; the arena moves them
    /// onto the finalization queue afterwards.
    pub newly_dead: &'a mut Vec<FinalizableEntry>,
    /// Receives every object move, versioned for watch readers.
    pub history: &'a History,
}

/// Statistics from one collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectStats {
    /// Bytes returned to the space.
    pub reclaimed: usize,
    /// Live bytes after the cycle.
    pub live: usize,
    /// Objects moved.
    pub moved: usize,
}

/// The collector half of the arena. Called with the arena lock held and
/// the world stopped.
pub trait CollectorImpl: Send {
    /// Reserve `size` bytes of allocation memory (uninitialized). The
    /// caller runs the format init and the commit/epoch check.
    fn reserve(&mut self, size: usize, exec: bool) -> Result<*mut u8>;

    /// Heuristic: should an automatic collection run before the next
    /// refill?
    fn should_collect(&self) -> bool;

    /// Full stop-the-world collection.
    fn collect(&mut self, world: &mut World) -> CollectStats;

    /// Bounded-effort collection. Returns true when more work remains.
    fn collect_budget(&mut self, world: &mut World, budget: Duration) -> bool;

    /// Visit every live client pointer in the dynamic space.
    fn walk(&self, f: &mut dyn FnMut(*mut u8));

    /// Is `addr` inside the dynamic space? May say yes for dead slots.
    fn contains(&self, addr: usize) -> bool;

    /// Committed bytes in the dynamic space.
    fn committed(&self) -> usize;

    /// Bytes handed out since the last collection.
    fn allocated(&self) -> usize;
}

/// A chunk with a bump offset and an optional free list threaded through
/// padding left by a sweep.
pub struct SpaceChunk {
    pub chunk: Chunk,
    /// Bytes used from the chunk base.
    pub top: usize,
    /// Free runs `(offset, size)` inside `[0, top)`, kept sorted.
    pub free: Vec<(usize, usize)>,
    /// Copying collector: chunk kept alive by pinned objects only.
    pub pinned: bool,
}

impl SpaceChunk {
    /// Walk the initialized objects of this chunk.
    ///
    /// # Safety
    /// `[base, base + top)` must hold back-to-back initialized
    /// allocations.
    pub unsafe fn walk(&self, f: &mut dyn FnMut(*mut u8)) {
        let base = self.chunk.base() as usize;
        let mut at = fmt::to_client(base as *mut u8);
        while (at as usize) < base + self.top + fmt::HEADER_SIZE {
            f(at);
            at = fmt::skip(at);
        }
    }

    /// Client pointer bounds of the object region.
    pub fn object_range(&self) -> (*mut u8, *mut u8) {
        let base = self.chunk.base() as usize;
        (
            (base + fmt::HEADER_SIZE) as *mut u8,
            (base + self.top + fmt::HEADER_SIZE) as *mut u8,
        )
    }
}

/// A growable set of chunks with bump allocation and optional free-list
/// reuse.
pub struct Space {
    pub chunks: Vec<SpaceChunk>,
    chunk_size: usize,
    max_size: usize,
    committed: usize,
    allocated: usize,
}

impl Space {
    pub fn new(chunk_size: usize, max_size: usize) -> Space {
        Space {
            chunks: Vec::new(),
            chunk_size,
            max_size,
            committed: 0,
            allocated: 0,
        }
    }

    /// Reserve `size` bytes (already allocation-aligned). Tries bump
    /// space, then free lists, then commits a new chunk.
    pub fn reserve(&mut self, size: usize, exec: bool) -> Result<*mut u8> {
        debug_assert_eq!(size, fmt::align_alloc(size));

        for c in self.chunks.iter_mut() {
            if c.chunk.executable() != exec {
                continue;
            }
            if c.top + size <= c.chunk.size() {
                let at = (c.chunk.base() as usize + c.top) as *mut u8;
                c.top += size;
                self.allocated += size;
                return Ok(at);
            }
            // First fit in the swept free runs.
            for i in 0..c.free.len() {
                let (offset, run) = c.free[i];
                if run >= size {
                    let rest = run - size;
                    if rest >= fmt::HEADER_SIZE {
                        c.free[i] = (offset + size, rest);
                        // Keep the walk consistent over the shrunk run.
                        unsafe {
                            fmt::make_pad(
                                fmt::to_client((c.chunk.base() as usize + offset + size) as *mut u8),
                                rest,
                            );
                        }
                    } else {
                        c.free.remove(i);
                    }
                    self.allocated += size;
                    return Ok((c.chunk.base() as usize + offset) as *mut u8);
                }
            }
        }

        self.grow(size, exec)
    }

    fn grow(&mut self, size: usize, exec: bool) -> Result<*mut u8> {
        let chunk_size = align_up(size.max(self.chunk_size), self.chunk_size);
        if self.committed + chunk_size > self.max_size {
            return Err(GcError::OutOfHeap {
                requested: size,
                limit: self.max_size,
            });
        }
        let chunk = if exec {
            Chunk::alloc_exec(chunk_size)?
        } else {
            Chunk::alloc(chunk_size)?
        };
        self.committed += chunk.size();
        let at = chunk.base();
        self.chunks.push(SpaceChunk {
            chunk,
            top: size,
            free: Vec::new(),
            pinned: false,
        });
        self.allocated += size;
        Ok(at)
    }

    /// Visit every object, padding and forwarders included.
    pub fn walk_all(&self, f: &mut dyn FnMut(*mut u8)) {
        for c in &self.chunks {
            unsafe { c.walk(f) };
        }
    }

    /// Visit client-kind objects only.
    pub fn walk_objects(&self, f: &mut dyn FnMut(*mut u8)) {
        self.walk_all(&mut |obj| unsafe {
            if fmt::is_code(obj) || fmt::header_kind(obj) < 0x100 {
                f(obj);
            }
        });
    }

    /// Does any chunk contain `addr`?
    pub fn contains(&self, addr: usize) -> bool {
        self.chunks.iter().any(|c| c.chunk.contains(addr))
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn reset_allocated(&mut self) {
        self.allocated = 0;
    }

    /// Drop every chunk, returning the number of bytes released.
    pub fn clear(&mut self) -> usize {
        let released = self.committed;
        self.chunks.clear();
        self.committed = 0;
        released
    }

    /// Move all chunks of `other` into this space.
    pub fn absorb(&mut self, other: &mut Space) {
        self.committed += other.committed;
        self.allocated += other.allocated;
        other.committed = 0;
        other.allocated = 0;
        self.chunks.append(&mut other.chunks);
    }
}

/// Address index over a space: resolves arbitrary words (including
/// interior pointers) to the client pointer of the containing object.
pub struct ObjectIndex {
    /// Sorted `(client, end)` pairs where `end` is one past the client
    /// data.
    spans: Vec<(usize, usize)>,
}

impl ObjectIndex {
    /// Build an index over every non-special object in `space`.
    pub fn build(space: &Space) -> ObjectIndex {
        let mut spans = Vec::new();
        space.walk_all(&mut |obj| unsafe {
            if !fmt::is_code(obj) && fmt::is_special(obj) {
                return;
            }
            let end = obj as usize + fmt::size(obj) - fmt::HEADER_SIZE;
            spans.push((obj as usize, end));
        });
        spans.sort_unstable();
        ObjectIndex { spans }
    }

    /// Resolve `addr` to the client pointer of the object containing it,
    /// if any. Accepts the client pointer itself and any interior
    /// address up to (but not including) the end of the client data.
    pub fn resolve(&self, addr: usize) -> Option<*mut u8> {
        let i = self.spans.partition_point(|&(start, _)| start <= addr);
        if i == 0 {
            return None;
        }
        let (start, end) = self.spans[i - 1];
        if addr < end {
            Some(start as *mut u8)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}
