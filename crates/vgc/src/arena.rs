//! The arena: public interface to the collector.
//!
//! One arena owns one dynamic space (behind a pluggable collector), one
//! non-moving static space, the type-descriptor pool, roots, watches and
//! the finalization machinery. There is no process-wide singleton; every
//! call site takes an arena handle.
//!
//! Locking: a single arena lock protects all collector metadata. Threads
//! mark themselves safe (and spill their callee-saved registers) before
//! any acquisition, so a collection holding the lock can stop the world
//! by waiting for every other attached thread to be parked at such a
//! safepoint. Allocation normally stays on a thread-local allocation
//! point and touches neither the lock nor the safepoint flag.

use crate::collector::{
    bump::Bump, copying::Copying, marksweep::MarkSweep, CollectorImpl, FinalizableEntry,
    RootRange, Space, World,
};
use crate::config::{CollectorKind, GcConfig};
use crate::error::{GcError, Result};
use crate::finalizer::FinalizerQueue;
use crate::fmt::{self, GcType};
use crate::roots::{Root, RootSet};
use crate::stack::{self, SpilledRegs, StackSource};
use crate::summary::MemorySummary;
use crate::watch::{History, Watch};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use vela_util::WORD_SIZE;

static NEXT_ARENA_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Attached arenas of this thread: `(arena id, state)`.
    static TLS: RefCell<Vec<(usize, Arc<ThreadShared>)>> = const { RefCell::new(Vec::new()) };
}

/// Thread-local allocation point: a reservation carved from the shared
/// pool, bumped without locking.
#[derive(Default, Clone, Copy)]
struct Tlab {
    cur: usize,
    end: usize,
    epoch: u64,
}

/// Per attached thread state. Owner-only fields are `UnsafeCell`s that
/// the collector may also touch, but only while the owner is parked at a
/// safepoint.
pub(crate) struct ThreadShared {
    attach_count: AtomicUsize,
    at_safepoint: AtomicBool,
    /// High end of the thread's native stack, captured at attach.
    stack_base: usize,
    tlab: UnsafeCell<Tlab>,
    /// Callee-saved registers and stack pointer, captured at every
    /// safepoint entry. Scanned ambiguously.
    spilled: UnsafeCell<SpilledRegs>,
    allocs_since_drain: AtomicUsize,
}

unsafe impl Send for ThreadShared {}
unsafe impl Sync for ThreadShared {}

/// Pool of semi-managed type descriptors. Descriptors outlive all
/// objects referring to them; `free` only quarantines, and the memory is
/// reclaimed when the arena is dropped.
#[derive(Default)]
struct TypePool {
    records: Vec<TypeRecord>,
}

struct TypeRecord {
    mem: Box<[usize]>,
    dead: bool,
}

impl TypePool {
    fn alloc(
        &mut self,
        kind: usize,
        type_obj: *mut u8,
        stride: usize,
        offsets: &[usize],
    ) -> *mut GcType {
        let words = fmt::gc_type_size(offsets.len()).div_ceil(WORD_SIZE);
        let mut mem = vec![0usize; words].into_boxed_slice();
        let ty = mem.as_mut_ptr() as *mut GcType;
        unsafe {
            (*ty).kind = kind;
            (*ty).type_obj = type_obj;
            (*ty).finalize = None;
            (*ty).stride = stride;
            (*ty).count = offsets.len();
            (*ty).offsets_mut().copy_from_slice(offsets);
        }
        self.records.push(TypeRecord { mem, dead: false });
        ty
    }

    fn free(&mut self, ty: *const GcType) -> Result<()> {
        for r in self.records.iter_mut() {
            if r.mem.as_ptr() as *const GcType == ty {
                r.dead = true;
                return Ok(());
            }
        }
        Err(GcError::Gc(format!(
            "free_type: {:p} was not allocated from this arena",
            ty
        )))
    }

    /// Back-reference slots of live descriptors, for exact scanning.
    fn slots(&mut self) -> Vec<*mut *mut u8> {
        self.records
            .iter_mut()
            .filter(|r| !r.dead)
            .map(|r| unsafe { &mut (*(r.mem.as_mut_ptr() as *mut GcType)).type_obj as *mut *mut u8 })
            .collect()
    }
}

/// Built-in descriptors, layout-compatible with `GcType` + one offset.
#[repr(C)]
struct StaticType {
    ty: GcType,
    offsets: [usize; 1],
}

unsafe impl Sync for StaticType {}

static WEAK_ARRAY_TYPE: StaticType = StaticType {
    ty: GcType {
        kind: fmt::kind::WEAK_ARRAY,
        type_obj: std::ptr::null_mut(),
        finalize: None,
        stride: WORD_SIZE,
        count: 1,
        offsets: [],
    },
    offsets: [0],
};

static BYTE_ARRAY_TYPE: StaticType = StaticType {
    ty: GcType {
        kind: fmt::kind::ARRAY,
        type_obj: std::ptr::null_mut(),
        finalize: None,
        stride: 1,
        count: 0,
        offsets: [],
    },
    offsets: [0],
};

/// Everything behind the arena lock.
struct ArenaState {
    collector: Box<dyn CollectorImpl>,
    statics: Space,
    static_objs: Vec<*mut u8>,
    types: TypePool,
    roots: RootSet,
    finalizable: Vec<FinalizableEntry>,
    fin_queue: FinalizerQueue,
    threads: FxHashMap<ThreadId, Arc<ThreadShared>>,
    stack_source: Option<Box<dyn StackSource>>,
    collections: u64,
    ramp: usize,
}

unsafe impl Send for ArenaState {}

/// A garbage-collected arena.
pub struct Arena {
    id: usize,
    config: GcConfig,
    state: Mutex<ArenaState>,
    history: Arc<History>,
    /// Bumped by every collection; the allocation commit protocol
    /// compares against the epoch captured at reservation.
    epoch: AtomicU64,
}

/// Scope hint: a burst of mostly short-lived allocation is coming.
/// Automatic collections are deferred while any ramp is active.
pub struct RampAlloc<'a> {
    arena: &'a Arena,
}

impl Drop for RampAlloc<'_> {
    fn drop(&mut self) {
        self.arena.state.lock().ramp -= 1;
    }
}

/// Unmarks the safepoint flag when an arena operation completes.
struct SafepointGuard<'a> {
    ts: &'a ThreadShared,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.ts.at_safepoint.store(false, Ordering::SeqCst);
    }
}

impl Arena {
    /// Create an arena with the given configuration.
    pub fn new(config: GcConfig) -> Result<Arena> {
        config.validate()?;
        let collector: Box<dyn CollectorImpl> = match config.collector {
            CollectorKind::Copying => Box::new(Copying::new(
                config.chunk_size,
                config.max_heap_size,
                config.collect_threshold,
            )),
            CollectorKind::MarkSweep => Box::new(MarkSweep::new(
                config.chunk_size,
                config.max_heap_size,
                config.collect_threshold,
            )),
            CollectorKind::Bump => {
                Box::new(Bump::new(config.chunk_size, config.max_heap_size))
            }
        };
        Ok(Arena {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ArenaState {
                collector,
                statics: Space::new(config.chunk_size, config.max_heap_size),
                static_objs: Vec::new(),
                types: TypePool::default(),
                roots: RootSet::default(),
                finalizable: Vec::new(),
                fin_queue: FinalizerQueue::default(),
                threads: FxHashMap::default(),
                stack_source: None,
                collections: 0,
                ramp: 0,
            }),
            history: Arc::new(History::new()),
            config,
            epoch: AtomicU64::new(0),
        })
    }

    // === Thread management ===

    /// Register the calling thread. Re-entrant: attach counts nest.
    pub fn attach_thread(&self) {
        let existing = TLS.with(|tls| {
            tls.borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map(|(_, ts)| ts.clone())
        });
        if let Some(ts) = existing {
            ts.attach_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let ts = Arc::new(ThreadShared {
            attach_count: AtomicUsize::new(1),
            at_safepoint: AtomicBool::new(false),
            stack_base: stack::approx_sp(),
            tlab: UnsafeCell::new(Tlab::default()),
            spilled: UnsafeCell::new(SpilledRegs::capture()),
            allocs_since_drain: AtomicUsize::new(0),
        });
        {
            let _safe = self.mark_safe(&ts);
            let mut state = self.state.lock();
            state.threads.insert(std::thread::current().id(), ts.clone());
        }
        TLS.with(|tls| tls.borrow_mut().push((self.id, ts)));
    }

    /// Unregister the calling thread. Must pair with `attach_thread`.
    pub fn detach_thread(&self) {
        let ts = match self.thread_state() {
            Ok(ts) => ts,
            Err(_) => return,
        };
        if ts.attach_count.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }

        unsafe { Self::flush_tlab(&ts) };
        {
            let _safe = self.mark_safe(&ts);
            let mut state = self.state.lock();
            state.threads.remove(&std::thread::current().id());
        }
        TLS.with(|tls| tls.borrow_mut().retain(|(id, _)| *id != self.id));
    }

    /// Cooperative stop point. Attached threads that run long without
    /// allocating should call this periodically.
    pub fn safepoint(&self) {
        if let Ok(ts) = self.thread_state() {
            let _safe = self.mark_safe(&ts);
            // Taking and releasing the lock parks us behind any active
            // collection.
            drop(self.state.lock());
        }
    }

    fn thread_state(&self) -> Result<Arc<ThreadShared>> {
        TLS.with(|tls| {
            tls.borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map(|(_, ts)| ts.clone())
                .ok_or(GcError::ThreadNotRegistered)
        })
    }

    fn mark_safe<'a>(&self, ts: &'a ThreadShared) -> SafepointGuard<'a> {
        unsafe { *ts.spilled.get() = SpilledRegs::capture() };
        ts.at_safepoint.store(true, Ordering::SeqCst);
        SafepointGuard { ts }
    }

    /// Wait until every other attached thread is parked at a safepoint.
    fn stop_threads(&self, state: &ArenaState) {
        let me = std::thread::current().id();
        let backoff = crossbeam::utils::Backoff::new();
        loop {
            let all_stopped = state
                .threads
                .iter()
                .all(|(tid, ts)| *tid == me || ts.at_safepoint.load(Ordering::SeqCst));
            if all_stopped {
                return;
            }
            backoff.snooze();
        }
    }

    /// Flush the thread's allocation point back to the pool, padding the
    /// unused tail so region walks stay valid.
    ///
    /// # Safety
    /// Caller must be the owning thread, or the owner must be parked.
    unsafe fn flush_tlab(ts: &ThreadShared) {
        let tlab = &mut *ts.tlab.get();
        if tlab.end > tlab.cur {
            fmt::make_pad(fmt::to_client(tlab.cur as *mut u8), tlab.end - tlab.cur);
        }
        *tlab = Tlab::default();
    }

    // === Allocation ===

    /// Allocate an object described by `ty` (a `FIXED`, `FIXED_OBJ` or
    /// `TYPE` descriptor). Memory is zeroed; the header is set.
    pub fn alloc(&self, ty: *const GcType) -> Result<*mut u8> {
        let size = unsafe { fmt::size_obj(&*ty) };
        let client = self.alloc_raw(size, false, |mem| unsafe { fmt::init_obj(mem, ty, size) })?;
        unsafe { self.register_finalizer(client, ty) };
        Ok(client)
    }

    /// Allocate an array of `count` elements. `ty.kind` must be `ARRAY`.
    pub fn alloc_array(&self, ty: *const GcType, count: usize) -> Result<*mut u8> {
        let size = unsafe { fmt::size_array(&*ty, count) };
        let client =
            self.alloc_raw(size, false, |mem| unsafe { fmt::init_array(mem, ty, size, count) })?;
        unsafe { self.register_finalizer(client, ty) };
        Ok(client)
    }

    /// Allocate a weak array of `count` pointer slots.
    pub fn alloc_weak_array(&self, count: usize) -> Result<*mut u8> {
        let ty = &WEAK_ARRAY_TYPE.ty as *const GcType;
        let size = unsafe { fmt::size_array(&*ty, count) };
        self.alloc_raw(size, false, |mem| unsafe {
            fmt::init_weak_array(mem, ty, size, count)
        })
    }

    /// Allocate an object in the non-moving static space. The object is
    /// treated as always reachable.
    pub fn alloc_static(&self, ty: *const GcType) -> Result<*mut u8> {
        let size = unsafe { fmt::size_obj(&*ty) };
        let ts = self.thread_state()?;
        let _safe = self.mark_safe(&ts);
        let mut state = self.state.lock();
        let mem = state.statics.reserve(size, false)?;
        let client = unsafe { fmt::init_obj(mem, ty, size) };
        state.static_objs.push(client);
        Ok(client)
    }

    /// Allocate a byte buffer that never moves and is safe to hand to
    /// foreign code or threads unknown to the collector.
    pub fn alloc_buffer(&self, count: usize) -> Result<*mut u8> {
        let ty = &BYTE_ARRAY_TYPE.ty as *const GcType;
        let size = unsafe { fmt::size_array(&*ty, count) };
        let ts = self.thread_state()?;
        let _safe = self.mark_safe(&ts);
        let mut state = self.state.lock();
        let mem = state.statics.reserve(size, false)?;
        let client = unsafe { fmt::init_array(mem, ty, size, count) };
        state.static_objs.push(client);
        Ok(client)
    }

    /// Allocate an executable code block with `code` bytes of machine
    /// code and `refs` reference-trailer entries.
    pub fn alloc_code(&self, code: usize, refs: usize) -> Result<*mut u8> {
        let code = fmt::align_alloc(code.max(WORD_SIZE));
        let size = fmt::size_code(code, refs);
        self.alloc_raw(size, true, |mem| unsafe {
            fmt::init_code(mem, size, code, refs)
        })
    }

    unsafe fn register_finalizer(&self, client: *mut u8, ty: *const GcType) {
        if let Some(finalize) = (*ty).finalize {
            let ts = self.thread_state().expect("allocating thread detached");
            let _safe = self.mark_safe(&ts);
            self.state.lock().finalizable.push(FinalizableEntry {
                obj: client,
                finalize,
            });
        }
    }

    /// Clear the finalized mark and re-register the object, re-arming
    /// its finalizer after a resurrection.
    pub fn resurrect(&self, client: *mut u8, ty: *const GcType) {
        unsafe {
            fmt::clear_finalized(client);
            self.register_finalizer(client, ty);
        }
    }

    fn alloc_raw(
        &self,
        size: usize,
        exec: bool,
        init: impl Fn(*mut u8) -> *mut u8,
    ) -> Result<*mut u8> {
        let ts = self.thread_state()?;
        self.maybe_drain_finalizers(&ts);

        loop {
            let (mem, epoch) = self.reserve(&ts, size, exec)?;
            let client = init(mem);
            // Commit: a collection between reserve and here invalidates
            // the reservation; the initializer reruns on fresh memory.
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return Ok(client);
            }
        }
    }

    fn reserve(&self, ts: &Arc<ThreadShared>, size: usize, exec: bool) -> Result<(*mut u8, u64)> {
        let use_tlab = !exec && size <= self.config.alloc_point_size / 4;
        if use_tlab {
            unsafe {
                let tlab = &mut *ts.tlab.get();
                if tlab.cur + size <= tlab.end {
                    let at = tlab.cur;
                    tlab.cur += size;
                    return Ok((at as *mut u8, tlab.epoch));
                }
            }
        }

        // Slow path: refill or direct reservation under the arena lock.
        let _safe = self.mark_safe(ts);
        let mut state = self.state.lock();

        if state.ramp == 0 && state.collector.should_collect() {
            self.collect_locked(&mut state);
        }

        if use_tlab {
            unsafe { Self::flush_tlab(ts) };
            let span = self.config.alloc_point_size.max(size);
            let mem = self.reserve_in(&mut state, span, exec)?;
            let epoch = self.epoch.load(Ordering::SeqCst);
            unsafe {
                let tlab = &mut *ts.tlab.get();
                *tlab = Tlab {
                    cur: mem as usize + size,
                    end: mem as usize + span,
                    epoch,
                };
            }
            Ok((mem, epoch))
        } else {
            let mem = self.reserve_in(&mut state, size, exec)?;
            Ok((mem, self.epoch.load(Ordering::SeqCst)))
        }
    }

    /// Reserve from the collector, retrying once after a forced
    /// collection when the heap is exhausted.
    fn reserve_in(
        &self,
        state: &mut ArenaState,
        size: usize,
        exec: bool,
    ) -> Result<*mut u8> {
        match state.collector.reserve(size, exec) {
            Ok(mem) => Ok(mem),
            Err(e) if e.is_recoverable() => {
                self.collect_locked(state);
                state.collector.reserve(size, exec)
            }
            Err(e) => Err(e),
        }
    }

    // === Finalization ===

    fn maybe_drain_finalizers(&self, ts: &Arc<ThreadShared>) {
        let n = ts.allocs_since_drain.fetch_add(1, Ordering::Relaxed) + 1;
        if n < self.config.finalization_interval {
            return;
        }
        ts.allocs_since_drain.store(0, Ordering::Relaxed);
        self.drain_finalizers();
    }

    /// Run every queued finalizer on the calling thread. The finalized
    /// mark is set before the finalizer runs, so weak references observe
    /// the object as dead even if it transiently stays reachable.
    pub fn drain_finalizers(&self) {
        let pending = {
            let ts = match self.thread_state() {
                Ok(ts) => ts,
                Err(_) => return,
            };
            let _safe = self.mark_safe(&ts);
            self.state.lock().fin_queue.take()
        };
        for entry in pending {
            unsafe {
                fmt::set_finalized(entry.obj);
                (entry.finalize)(entry.obj);
            }
        }
    }

    // === Collection ===

    /// Full stop-the-world collection.
    pub fn collect(&self) {
        self.with_attached(|ts| {
            let _safe = self.mark_safe(&ts);
            let mut state = self.state.lock();
            self.collect_locked(&mut state);
        });
    }

    /// Spend roughly `budget_ms` milliseconds collecting. Returns true
    /// when more work remains.
    pub fn collect_ms(&self, budget_ms: u64) -> bool {
        let mut more = false;
        self.with_attached(|ts| {
            let _safe = self.mark_safe(&ts);
            let mut state = self.state.lock();
            self.stop_threads(&state);
            unsafe { self.flush_all_tlabs(&state) };
            more = self.run_collection(&mut state, |collector, world| {
                collector.collect_budget(world, std::time::Duration::from_millis(budget_ms))
            });
        });
        more
    }

    fn with_attached(&self, f: impl FnOnce(Arc<ThreadShared>)) {
        match self.thread_state() {
            Ok(ts) => f(ts),
            Err(_) => {
                self.attach_thread();
                let ts = self.thread_state().expect("attach failed");
                f(ts);
                self.detach_thread();
            }
        }
    }

    fn collect_locked(&self, state: &mut ArenaState) {
        self.stop_threads(state);
        unsafe { self.flush_all_tlabs(state) };
        let stats = self.run_collection(state, |collector, world| collector.collect(world));
        log::debug!(
            "collection finished: {} reclaimed, {} live, {} moved",
            stats.reclaimed,
            stats.live,
            stats.moved
        );
    }

    /// # Safety
    /// World must be stopped: every other attached thread parked.
    unsafe fn flush_all_tlabs(&self, state: &ArenaState) {
        for ts in state.threads.values() {
            Self::flush_tlab(ts);
        }
    }

    fn run_collection<R>(
        &self,
        state: &mut ArenaState,
        f: impl FnOnce(&mut dyn CollectorImpl, &mut World) -> R,
    ) -> R {
        let ArenaState {
            collector,
            static_objs,
            types,
            roots,
            finalizable,
            fin_queue,
            threads,
            stack_source,
            collections,
            ..
        } = state;

        let mut exact: Vec<RootRange> = Vec::new();
        for r in roots.exact() {
            exact.push(RootRange {
                base: r.base,
                count: r.count,
            });
        }
        for slot in types.slots() {
            exact.push(RootRange {
                base: slot,
                count: 1,
            });
        }
        for slot in fin_queue.slots() {
            exact.push(RootRange {
                base: slot,
                count: 1,
            });
        }

        let mut ambiguous: Vec<(usize, usize)> = Vec::new();
        for r in roots.ambiguous() {
            let base = r.base as usize;
            ambiguous.push((base, base + r.count * WORD_SIZE));
        }

        let mut running_low: FxHashMap<ThreadId, usize> = FxHashMap::default();
        for (tid, ts) in threads.iter() {
            let spilled = unsafe { &*ts.spilled.get() };
            // Registers were spilled when the thread last entered the
            // arena; for the collecting thread that is this collection.
            let sp = spilled.sp;
            running_low.insert(*tid, sp);
            if !self.config.conservative_stacks {
                continue;
            }
            let buf = ts.spilled.get() as usize;
            ambiguous.push((buf, buf + std::mem::size_of::<SpilledRegs>()));
            if sp != 0 && sp < ts.stack_base {
                ambiguous.push((sp, ts.stack_base));
            }
        }

        // Fiber stacks from the threading runtime, if registered.
        if let Some(source) = stack_source.as_ref() {
            for set in source.thread_stacks() {
                let low = set
                    .thread
                    .and_then(|tid| running_low.get(&tid).copied())
                    .unwrap_or(usize::MAX);
                for range in stack::thread_scan_ranges(&set, low) {
                    ambiguous.push(range);
                }
            }
        }

        let mut newly_dead: Vec<FinalizableEntry> = Vec::new();
        let result = {
            let mut world = World {
                exact,
                ambiguous,
                pinned_objects: static_objs.clone(),
                finalizable,
                newly_dead: &mut newly_dead,
                history: self.history.as_ref(),
            };
            f(collector.as_mut(), &mut world)
        };

        fin_queue.extend(newly_dead);
        *collections += 1;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        result
    }

    // === Types ===

    /// Allocate a type descriptor. The descriptor must outlive every
    /// object referring to it; `free_type` only quarantines it.
    pub fn alloc_type(
        &self,
        kind: usize,
        type_obj: *mut u8,
        stride: usize,
        offsets: &[usize],
    ) -> *mut GcType {
        self.state.lock().types.alloc(kind, type_obj, stride, offsets)
    }

    /// Release a descriptor. Reclamation is deferred until the arena is
    /// dropped.
    pub fn free_type(&self, ty: *const GcType) -> Result<()> {
        self.state.lock().types.free(ty)
    }

    /// The descriptor of an allocation.
    ///
    /// # Safety
    /// `client` must be a live regular allocation of this arena.
    pub unsafe fn type_of(client: *const u8) -> *const GcType {
        fmt::header(client)
    }

    /// Replace the descriptor of an allocation. The new descriptor must
    /// describe an object of identical size and kind.
    ///
    /// # Safety
    /// Same as [`Arena::type_of`], plus the size/kind contract.
    pub unsafe fn switch_type(client: *mut u8, ty: *const GcType) {
        debug_assert_eq!((*fmt::header(client)).kind, (*ty).kind);
        debug_assert_eq!((*fmt::header(client)).stride, (*ty).stride);
        fmt::replace_header(client, ty);
    }

    // === Roots, watches, queries ===

    /// Register `count` pointer slots at `base` as a root.
    pub fn create_root(&self, base: *mut *mut u8, count: usize, ambiguous: bool) -> Result<Root> {
        self.state.lock().roots.register(base, count, ambiguous)
    }

    /// Destroy a root created by this arena.
    pub fn destroy_root(&self, root: Root) -> Result<()> {
        self.state.lock().roots.unregister(root)
    }

    /// Create a watch that reports whether watched addresses may have
    /// moved.
    pub fn create_watch(&self) -> Watch {
        Watch::new(self.history.clone())
    }

    /// Is `ptr` inside memory managed by this arena? May return false
    /// positives for dead slots.
    pub fn is_code_alloc(&self, ptr: *const u8) -> bool {
        let state = self.state.lock();
        state.collector.contains(ptr as usize)
    }

    /// An object is live until it has been finalized; finalized objects
    /// may linger in weak structures before they are collected.
    pub fn live_object(client: *const u8) -> bool {
        unsafe { !fmt::is_finalized(client) }
    }

    /// Walk every object on the heap, stopping the world for the
    /// duration. The callback may only touch the presented object and
    /// the stack.
    pub fn walk_objects(&self, f: &mut dyn FnMut(*mut u8)) {
        self.with_attached(|ts| {
            let _safe = self.mark_safe(&ts);
            let state = self.state.lock();
            self.stop_threads(&state);
            state.collector.walk(f);
            state.statics.walk_objects(f);
        });
    }

    /// Register the adapter exposing fiber stacks to the collector.
    pub fn set_stack_source(&self, source: Box<dyn StackSource>) {
        self.state.lock().stack_source = Some(source);
    }

    /// Hint that a burst of short-lived allocation follows. May be
    /// ignored by the implementation.
    pub fn ramp_alloc(&self) -> RampAlloc<'_> {
        self.state.lock().ramp += 1;
        RampAlloc { arena: self }
    }

    /// Snapshot the arena's memory accounting.
    pub fn memory_summary(&self) -> MemorySummary {
        let state = self.state.lock();
        MemorySummary {
            taken_at: chrono::Utc::now(),
            allocated: state.collector.allocated(),
            committed: state.collector.committed(),
            static_bytes: state.statics.committed(),
            finalizable: state.finalizable.len(),
            pending_finalizers: state.fin_queue.len(),
            collections: state.collections,
            roots: state.roots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(kind: CollectorKind) -> Arena {
        let config = GcConfig {
            collector: kind,
            ..Default::default()
        };
        Arena::new(config).unwrap()
    }

    #[test]
    fn test_alloc_requires_attach() {
        let a = arena(CollectorKind::Bump);
        let ty = a.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 16, &[]);
        let err = a.alloc(ty);
        assert!(matches!(err, Err(GcError::ThreadNotRegistered)));
    }

    #[test]
    fn test_alloc_zeroed() {
        let a = arena(CollectorKind::Bump);
        a.attach_thread();
        let ty = a.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 32, &[]);
        let obj = a.alloc(ty).unwrap();
        unsafe {
            for i in 0..4 {
                assert_eq!(*(obj as *const usize).add(i), 0);
            }
        }
        a.detach_thread();
    }

    #[test]
    fn test_reentrant_attach() {
        let a = arena(CollectorKind::Bump);
        a.attach_thread();
        a.attach_thread();
        a.detach_thread();
        // Still attached.
        let ty = a.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 8, &[]);
        assert!(a.alloc(ty).is_ok());
        a.detach_thread();
    }

    #[test]
    fn test_buffer_is_static() {
        let a = arena(CollectorKind::Copying);
        a.attach_thread();
        let buf = a.alloc_buffer(100).unwrap();
        unsafe {
            std::ptr::write_bytes(buf, 0xAB, 100);
        }
        a.collect();
        unsafe {
            assert_eq!(*buf, 0xAB);
        }
        a.detach_thread();
    }

    #[test]
    fn test_free_foreign_type_fails() {
        let a = arena(CollectorKind::Bump);
        let bogus = 0x1000 as *const GcType;
        assert!(a.free_type(bogus).is_err());
    }
}
