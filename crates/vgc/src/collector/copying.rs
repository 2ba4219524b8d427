//! Copying collector: tracing and moving.
//!
//! Live objects are evacuated into fresh chunks; each moved object
//! leaves a forwarder behind so every remaining reference can be
//! rewritten on sight. Ambiguous references (thread stacks, ambiguous
//! roots) pin their objects: pinned objects are traced in place, their
//! chunk survives the cycle with everything else in it padded over, and
//! the compaction gap left by every move is padded so regions stay
//! walkable.
//!
//! Code allocations move like everything else. Their trailer self
//! pointer is scanned first, which re-anchors the trailer at the new
//! address, and the scan finishes by rewriting the instruction bytes
//! from the updated reference pointers.

use super::{CollectStats, CollectorImpl, ObjectIndex, Space, World};
use crate::error::Result;
use crate::fmt::{self, ScanAction, Scanner};
use crate::watch::History;
use rustc_hash::FxHashSet;
use std::time::Duration;

pub struct Copying {
    space: Space,
    chunk_size: usize,
    max_size: usize,
    collect_threshold: f64,
}

/// Scanner state for the evacuation phase.
struct CopyState<'a> {
    /// From-space object ranges.
    from: Vec<(usize, usize)>,
    to: &'a mut Space,
    pinned: &'a FxHashSet<usize>,
    /// Pinned objects already queued for tracing.
    traced_pins: FxHashSet<usize>,
    grey: Vec<*mut u8>,
    history: &'a History,
    moved: usize,
    /// Objects that could not be evacuated (to-space exhausted) and were
    /// left in place instead.
    emergency_pins: FxHashSet<usize>,
}

impl CopyState<'_> {
    fn in_from(&self, addr: usize) -> bool {
        self.from.iter().any(|&(lo, hi)| addr >= lo && addr < hi)
    }

    fn is_pinned(&self, addr: usize) -> bool {
        self.pinned.contains(&addr) || self.emergency_pins.contains(&addr)
    }

    /// Keep a pinned object alive in place.
    fn keep_pinned(&mut self, obj: *mut u8) {
        if self.traced_pins.insert(obj as usize) {
            self.grey.push(obj);
        }
    }

    /// Evacuate one object, leaving a forwarder. Returns the new client
    /// pointer.
    unsafe fn evacuate(&mut self, obj: *mut u8) -> *mut u8 {
        let total = fmt::size(obj);
        let exec = fmt::is_code(obj);
        let at = match self.to.reserve(total, exec) {
            Ok(at) => at,
            Err(e) => {
                // No room to move it: pin in place and carry on.
                log::warn!("evacuation failed ({}); pinning {:p}", e, obj);
                self.emergency_pins.insert(obj as usize);
                self.keep_pinned(obj);
                return obj;
            }
        };
        std::ptr::copy_nonoverlapping(fmt::from_client(obj), at, total);
        let new_client = fmt::to_client(at);
        self.history
            .record(obj as usize, new_client as usize, total - fmt::HEADER_SIZE);
        if exec && crate::code::need_finalization() {
            // The new location re-registers its unwind info when it is
            // scanned; drop the registration of the old address now.
            crate::code::finalize(obj);
        }
        fmt::make_fwd(obj, new_client);
        self.moved += 1;
        self.grey.push(new_client);
        new_client
    }
}

impl Scanner for CopyState<'_> {
    type Error = ();

    fn fix1(&mut self, ptr: *const u8) -> bool {
        self.in_from(ptr as usize)
    }

    unsafe fn fix2(&mut self, slot: *mut *mut u8) -> std::result::Result<(), ()> {
        let p = *slot;
        if let Some(to) = fmt::is_fwd(p) {
            *slot = to;
            return Ok(());
        }
        if self.is_pinned(p as usize) {
            self.keep_pinned(p);
            return Ok(());
        }
        *slot = self.evacuate(p);
        Ok(())
    }
}

/// Post-trace weak processing: follows forwarders, nulls everything
/// else still pointing into from-space, and nulls finalized referents.
struct WeakFix<'a> {
    from: &'a [(usize, usize)],
    live_pins: &'a FxHashSet<usize>,
}

impl Scanner for WeakFix<'_> {
    type Error = ();

    fn fix1(&mut self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.from.iter().any(|&(lo, hi)| addr >= lo && addr < hi)
    }

    unsafe fn fix2(&mut self, slot: *mut *mut u8) -> std::result::Result<(), ()> {
        let p = *slot;
        if let Some(to) = fmt::is_fwd(p) {
            *slot = if fmt::is_finalized(to) {
                std::ptr::null_mut()
            } else {
                to
            };
        } else if self.live_pins.contains(&(p as usize)) {
            if fmt::is_finalized(p) {
                *slot = std::ptr::null_mut();
            }
        } else {
            // Dead: splat.
            *slot = std::ptr::null_mut();
        }
        Ok(())
    }
}

/// Per-object predicate shared by the trace and weak phases: weak
/// arrays keep their elements out of the strong trace.
fn weak_aware(at: *const u8, _end: *const u8) -> ScanAction {
    unsafe {
        if !fmt::is_code(at)
            && !fmt::is_special(at)
            && fmt::header_kind(at) == fmt::kind::WEAK_ARRAY
        {
            ScanAction::HeaderOnly
        } else {
            ScanAction::All
        }
    }
}

impl Copying {
    pub fn new(chunk_size: usize, max_size: usize, collect_threshold: f64) -> Copying {
        Copying {
            space: Space::new(chunk_size, max_size),
            chunk_size,
            max_size,
            collect_threshold,
        }
    }

    fn from_ranges(&self) -> Vec<(usize, usize)> {
        self.space
            .chunks
            .iter()
            .map(|c| {
                let (lo, hi) = c.object_range();
                (lo as usize, hi as usize)
            })
            .collect()
    }

    unsafe fn drain_grey(state: &mut CopyState<'_>) {
        while let Some(obj) = state.grey.pop() {
            let end = fmt::skip(obj);
            fmt::scan_objects_if(&mut *state, weak_aware, obj, end).ok();
        }
    }
}

impl CollectorImpl for Copying {
    fn reserve(&mut self, size: usize, exec: bool) -> Result<*mut u8> {
        self.space.reserve(size, exec)
    }

    fn should_collect(&self) -> bool {
        let committed = self.space.committed();
        committed > 0 && self.space.allocated() as f64 > self.collect_threshold * committed as f64
    }

    fn collect(&mut self, world: &mut World) -> CollectStats {
        world.history.begin_epoch();

        let from = self.from_ranges();
        let index = ObjectIndex::build(&self.space);

        // Ambiguous references pin. Interior pointers (return addresses
        // into code blocks included) resolve to their object.
        let mut pinned: FxHashSet<usize> = FxHashSet::default();
        for &(lo, hi) in &world.ambiguous {
            let mut at = lo;
            while at + std::mem::size_of::<usize>() <= hi {
                let word = unsafe { *(at as *const usize) };
                if let Some(obj) = index.resolve(word) {
                    pinned.insert(obj as usize);
                }
                at += std::mem::size_of::<usize>();
            }
        }

        let mut to = Space::new(self.chunk_size, self.max_size);
        let mut state = CopyState {
            from,
            to: &mut to,
            pinned: &pinned,
            traced_pins: FxHashSet::default(),
            grey: Vec::new(),
            history: world.history,
            moved: 0,
            emergency_pins: FxHashSet::default(),
        };

        unsafe {
            // Pinned objects are roots scanned in place.
            let pins: Vec<usize> = pinned.iter().copied().collect();
            for p in pins {
                state.keep_pinned(p as *mut u8);
            }

            // Exact roots relocate their referents.
            for r in &world.exact {
                fmt::scan_array(&mut state, r.base as *mut u8, r.count).ok();
            }

            // Static-space objects: always live, contents are roots.
            for &obj in &world.pinned_objects {
                state.grey.push(obj);
            }

            Self::drain_grey(&mut state);

            // Unreachable finalizable objects are evacuated for their
            // finalizer and queued.
            let mut retained = Vec::new();
            let entries: Vec<_> = world.finalizable.drain(..).collect();
            for mut entry in entries {
                let in_from = state.in_from(entry.obj as usize);
                let forwarded = in_from && fmt::is_fwd(entry.obj).is_some();
                let pinned_live = state.traced_pins.contains(&(entry.obj as usize));
                if forwarded || pinned_live || !in_from {
                    if let Some(new_addr) = fmt::is_fwd(entry.obj) {
                        entry.obj = new_addr;
                    }
                    retained.push(entry);
                } else {
                    fmt::scan_array(&mut state, &mut entry.obj as *mut *mut u8 as *mut u8, 1)
                        .ok();
                    Self::drain_grey(&mut state);
                    world.newly_dead.push(entry);
                }
            }
            *world.finalizable = retained;
        }

        let moved = state.moved;
        let from = std::mem::take(&mut state.from);
        let CopyState {
            traced_pins: live_pins,
            ..
        } = state;

        // Weak phase over everything that survived.
        unsafe {
            let mut weak = WeakFix {
                from: &from,
                live_pins: &live_pins,
            };
            let weak_only = |at: *const u8, _end: *const u8| unsafe {
                if !fmt::is_code(at)
                    && !fmt::is_special(at)
                    && fmt::header_kind(at) == fmt::kind::WEAK_ARRAY
                {
                    ScanAction::All
                } else {
                    ScanAction::None
                }
            };
            for c in &to.chunks {
                let (lo, hi) = c.object_range();
                fmt::scan_objects_if(&mut weak, weak_only, lo, hi).ok();
            }
            for &p in &live_pins {
                let obj = p as *mut u8;
                fmt::scan_objects_if(&mut weak, weak_only, obj, fmt::skip(obj)).ok();
            }
            for &obj in &world.pinned_objects {
                fmt::scan_objects_if(&mut weak, weak_only, obj, fmt::skip(obj)).ok();
            }
        }

        // Retain chunks that hold pinned survivors; pad everything else
        // in them. Unpinned chunks are released wholesale, after letting
        // any dead code blocks in them drop their unwind registration.
        let mut reclaimed = 0;
        let old_chunks = std::mem::take(&mut self.space.chunks);
        for mut c in old_chunks {
            let (lo, hi) = c.object_range();
            let has_pins = live_pins
                .iter()
                .any(|&p| p >= lo as usize && p < hi as usize);
            if !has_pins {
                if crate::code::need_finalization() {
                    unsafe {
                        let mut at = lo;
                        while at < hi {
                            let next = fmt::skip(at);
                            if fmt::is_code(at) {
                                crate::code::finalize(at);
                            }
                            at = next;
                        }
                    }
                }
                reclaimed += c.top;
                continue;
            }
            unsafe {
                let mut at = lo;
                while at < hi {
                    let next = fmt::skip(at);
                    if !live_pins.contains(&(at as usize)) {
                        let total = next as usize - at as usize;
                        if fmt::is_code(at) && crate::code::need_finalization() {
                            crate::code::finalize(at);
                        }
                        reclaimed += total;
                        fmt::make_pad(at, total);
                    }
                    at = next;
                }
            }
            c.pinned = true;
            to.committed += c.chunk.size();
            to.chunks.push(c);
        }

        self.space = to;
        self.space.reset_allocated();

        world.history.end_epoch();

        log::debug!(
            "copying cycle: {} moved, {} pinned, {} bytes reclaimed",
            moved,
            live_pins.len(),
            reclaimed
        );

        CollectStats {
            reclaimed,
            live: moved + live_pins.len(),
            moved,
        }
    }

    fn collect_budget(&mut self, world: &mut World, _budget: Duration) -> bool {
        // Evacuation is all-or-nothing; a budgeted request runs one full
        // cycle and reports completion.
        self.collect(world);
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

