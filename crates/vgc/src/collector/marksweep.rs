//! Mark-sweep collector: tracing, non-moving.
//!
//! Marking runs to completion inside one stop-the-world window; sweeping
//! may be split across bounded increments. The sweep plan records each
//! chunk's extent at mark time, so memory handed out after marking is
//! never swept with stale liveness information.

use super::{CollectStats, CollectorImpl, ObjectIndex, Space, World};
use crate::error::Result;
use crate::fmt::{self, ScanAction, Scanner};
use rustc_hash::FxHashSet;
use std::time::{Duration, Instant};

pub struct MarkSweep {
    space: Space,
    collect_threshold: f64,
    /// Chunks still to sweep from the last cycle: `(chunk_base, extent)`.
    sweep_plan: Vec<(usize, usize)>,
    /// Mark set of the cycle the sweep plan belongs to.
    marked: FxHashSet<usize>,
}

struct MarkScanner<'a> {
    ranges: &'a [(usize, usize)],
    marked: &'a mut FxHashSet<usize>,
    grey: &'a mut Vec<*mut u8>,
}

impl MarkScanner<'_> {
    fn in_space(&self, addr: usize) -> bool {
        self.ranges.iter().any(|&(lo, hi)| addr >= lo && addr < hi)
    }
}

impl Scanner for MarkScanner<'_> {
    type Error = ();

    fn fix1(&mut self, ptr: *const u8) -> bool {
        self.in_space(ptr as usize)
    }

    unsafe fn fix2(&mut self, slot: *mut *mut u8) -> std::result::Result<(), ()> {
        let p = *slot;
        if self.marked.insert(p as usize) {
            self.grey.push(p);
        }
        Ok(())
    }
}

/// Nulls weak slots whose referents did not survive the cycle.
struct WeakScanner<'a> {
    ranges: &'a [(usize, usize)],
    marked: &'a FxHashSet<usize>,
}

impl Scanner for WeakScanner<'_> {
    type Error = ();

    fn fix1(&mut self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.ranges.iter().any(|&(lo, hi)| addr >= lo && addr < hi)
    }

    unsafe fn fix2(&mut self, slot: *mut *mut u8) -> std::result::Result<(), ()> {
        let p = *slot;
        if !self.marked.contains(&(p as usize)) || fmt::is_finalized(p) {
            *slot = std::ptr::null_mut();
        }
        Ok(())
    }
}

impl MarkSweep {
    pub fn new(chunk_size: usize, max_size: usize, collect_threshold: f64) -> MarkSweep {
        MarkSweep {
            space: Space::new(chunk_size, max_size),
            collect_threshold,
            sweep_plan: Vec::new(),
            marked: FxHashSet::default(),
        }
    }

    fn ranges(&self) -> Vec<(usize, usize)> {
        self.space
            .chunks
            .iter()
            .map(|c| {
                let (lo, hi) = c.object_range();
                (lo as usize, hi as usize)
            })
            .collect()
    }

    /// Mark everything reachable from the world, handle finalization and
    /// weak references, and lay down the sweep plan.
    fn mark(&mut self, world: &mut World) {
        // A pending sweep from an earlier budgeted cycle must finish
        // before liveness information is replaced.
        self.finish_sweep();

        let mut marked = FxHashSet::default();
        let mut grey: Vec<*mut u8> = Vec::new();
        let ranges = self.ranges();
        let index = ObjectIndex::build(&self.space);

        {
            let mut s = MarkScanner {
                ranges: &ranges,
                marked: &mut marked,
                grey: &mut grey,
            };

            // Exact roots.
            for r in &world.exact {
                unsafe { fmt::scan_array(&mut s, r.base as *mut u8, r.count).ok() };
            }
            // Ambiguous roots: every word that resolves to an object.
            for &(lo, hi) in &world.ambiguous {
                let mut at = lo;
                while at + std::mem::size_of::<usize>() <= hi {
                    let word = unsafe { *(at as *const usize) };
                    if let Some(obj) = index.resolve(word) {
                        if s.marked.insert(obj as usize) {
                            s.grey.push(obj);
                        }
                    }
                    at += std::mem::size_of::<usize>();
                }
            }
        }

        // Static-space objects are always live; their contents are
        // ordinary roots.
        for &obj in &world.pinned_objects {
            grey.push(obj);
        }

        self.trace(&ranges, &mut marked, &mut grey);

        // Unreachable finalizable objects stay alive for their
        // finalizer; everything they reach survives with them.
        let mut retained = Vec::new();
        for entry in world.finalizable.drain(..) {
            if marked.contains(&(entry.obj as usize)) {
                retained.push(entry);
            } else {
                marked.insert(entry.obj as usize);
                grey.push(entry.obj);
                self.trace(&ranges, &mut marked, &mut grey);
                world.newly_dead.push(entry);
            }
        }
        *world.finalizable = retained;

        // Weak phase: null slots to dead or finalized objects.
        {
            let mut weak = WeakScanner {
                ranges: &ranges,
                marked: &marked,
            };
            for c in &self.space.chunks {
                let (lo, hi) = c.object_range();
                unsafe {
                    fmt::scan_objects_if(
                        &mut weak,
                        |at, _| unsafe {
                            if !fmt::is_code(at)
                                && !fmt::is_special(at)
                                && fmt::header_kind(at) == fmt::kind::WEAK_ARRAY
                            {
                                ScanAction::All
                            } else {
                                ScanAction::None
                            }
                        },
                        lo,
                        hi,
                    )
                    .ok();
                }
            }
        }

        self.sweep_plan = self
            .space
            .chunks
            .iter()
            .map(|c| (c.chunk.base() as usize, c.top))
            .collect();
        self.marked = marked;
        self.space.reset_allocated();
    }

    fn trace(
        &self,
        ranges: &[(usize, usize)],
        marked: &mut FxHashSet<usize>,
        grey: &mut Vec<*mut u8>,
    ) {
        while let Some(obj) = grey.pop() {
            let mut s = MarkScanner {
                ranges,
                marked: &mut *marked,
                grey: &mut *grey,
            };
            unsafe {
                fmt::scan_objects_if(
                    &mut s,
                    |at, _| unsafe {
                        if !fmt::is_code(at)
                            && !fmt::is_special(at)
                            && fmt::header_kind(at) == fmt::kind::WEAK_ARRAY
                        {
                            ScanAction::HeaderOnly
                        } else {
                            ScanAction::All
                        }
                    },
                    obj,
                    fmt::skip(obj),
                )
                .ok();
            }
        }
    }

    /// Sweep one chunk extent, padding dead objects and threading free
    /// runs. Returns the bytes reclaimed.
    fn sweep_chunk(&mut self, chunk_base: usize, extent: usize) -> usize {
        let Some(ci) = self
            .space
            .chunks
            .iter()
            .position(|c| c.chunk.base() as usize == chunk_base)
        else {
            return 0;
        };

        let mut reclaimed = 0;
        let mut free: Vec<(usize, usize)> = Vec::new();
        let mut run: Option<(usize, usize)> = None;

        unsafe {
            let mut at = fmt::to_client(chunk_base as *mut u8);
            while (at as usize) < chunk_base + extent + fmt::HEADER_SIZE {
                let next = fmt::skip(at);
                let size = next as usize - at as usize;
                let base_offset = fmt::from_client(at) as usize - chunk_base;

                let live = self.marked.contains(&(at as usize));
                if live {
                    if let Some(r) = run.take() {
                        free.push(r);
                    }
                } else {
                    // Dead code blocks release their unwind side table.
                    if fmt::is_code(at) && crate::code::need_finalization() {
                        crate::code::finalize(at);
                    }
                    if fmt::is_code(at) || !fmt::is_special(at) {
                        reclaimed += size;
                    }
                    fmt::make_pad(at, size);
                    run = match run.take() {
                        Some((offset, len)) => Some((offset, len + size)),
                        None => Some((base_offset, size)),
                    };
                }
                at = next;
            }
        }
        if let Some(r) = run.take() {
            free.push(r);
        }

        // Coalesced runs get one pad each so walks stay cheap.
        unsafe {
            for &(offset, len) in &free {
                fmt::make_pad(fmt::to_client((chunk_base + offset) as *mut u8), len);
            }
        }

        self.space.chunks[ci].free = free;
        reclaimed
    }

    fn finish_sweep(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Some((base, extent)) = self.sweep_plan.pop() {
            reclaimed += self.sweep_chunk(base, extent);
        }
        reclaimed
    }
}

impl CollectorImpl for MarkSweep {
    fn reserve(&mut self, size: usize, exec: bool) -> Result<*mut u8> {
        self.space.reserve(size, exec)
    }

    fn should_collect(&self) -> bool {
        let committed = self.space.committed();
        committed > 0 && self.space.allocated() as f64 > self.collect_threshold * committed as f64
    }

    fn collect(&mut self, world: &mut World) -> CollectStats {
        self.mark(world);
        let reclaimed = self.finish_sweep();
        let live: usize = self.marked.len();
        log::debug!(
            "mark-sweep cycle: {} live objects, {} bytes reclaimed",
            live,
            reclaimed
        );
        CollectStats {
            reclaimed,
            live,
            moved: 0,
        }
    }

    fn collect_budget(&mut self, world: &mut World, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        if self.sweep_plan.is_empty() {
            // Marking is atomic; only sweeping can pause.
            self.mark(world);
        }
        while let Some(&(base, extent)) = self.sweep_plan.last() {
            if Instant::now() >= deadline {
                return true;
            }
            self.sweep_plan.pop();
            self.sweep_chunk(base, extent);
        }
        false
    }

    fn walk(&self, f: &mut dyn FnMut(*mut u8)) {
        self.space.walk_objects(f);
    }

    fn contains(&self, addr: usize) -> bool {
        self.space.contains(addr)
    }

    fn committed(&self) -> usize {
        self.space.committed()
    }

    fn allocated(&self) -> usize {
        self.space.allocated()
    }
}
