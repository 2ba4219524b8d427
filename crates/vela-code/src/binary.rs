//! Binaries: listings turned into executable, collector-owned code.
//!
//! A binary transforms a listing through a backend, encodes it into a
//! code allocation, fills the reference trailer, and keeps the per-part
//! variable records the unwinder needs to run destructors while an
//! exception passes through the frame.
//!
//! Exception-aware binaries participate in the runtime unwind path in
//! [`unwind`]: their prologs link a frame record into a thread-local
//! chain and store the code base in the frame, so a non-local exit can
//! find every live generated frame, resolve its binary, and run the
//! destructors recorded for the active part before control leaves the
//! frames.

use crate::backend::Backend;
use crate::error::{CodeError, Result};
use crate::label::Label;
use crate::listing::{FreeOpt, Listing, Part};
use crate::output::RefTarget;
use crate::size::Size;
use std::cell::UnsafeCell;
use std::sync::Arc;
use vgc::code::GcCodeRef;

pub mod unwind {
    //! Thread-local chain of active exception-aware frames, and the
    //! non-local exit that consumes it.
    //!
    //! Generated prologs link their frame base into this chain and
    //! epilogs unlink it. A throw from code called by a generated
    //! function goes through [`raise`]: it walks the chain innermost
    //! first via [`cleanup_frames`], running each frame's destructors
    //! while the frame memory is still live, and then transfers control
    //! back to the [`Binary::call_protected`] boundary with a
    //! register-restoring jump. Rust panics are never unwound through
    //! generated frames; the jump steps over them instead.
    //!
    //! The platform unwinders themselves are not driven here: nothing
    //! registers OS-level function tables or intercepts the C++
    //! exception allocator. On 32-bit frames the handler record is laid
    //! out for an SEH chain, but the glue that would let the OS call
    //! [`cleanup_frame`] is left to the embedder.

    use super::{BinaryShared, RecordFrame};
    use crate::listing::Part;
    use once_cell::sync::Lazy;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::sync::{Arc, Weak};

    #[cfg(target_pointer_width = "64")]
    use crate::backend::x64::layout::{OWNER_OFFSET, PART_ID_OFFSET};
    #[cfg(target_pointer_width = "32")]
    use crate::backend::x86::layout::{OWNER_OFFSET, PART_ID_OFFSET};

    thread_local! {
        /// Frame bases of live exception-aware generated frames,
        /// outermost first.
        static FRAMES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    /// Every installed binary, so a frame record can be resolved back to
    /// its cleanup metadata through the code base stored in the frame.
    static BINARIES: Lazy<Mutex<Vec<Weak<BinaryShared>>>> = Lazy::new(|| Mutex::new(Vec::new()));

    pub(super) fn register_binary(shared: &Arc<BinaryShared>) {
        let mut all = BINARIES.lock();
        all.retain(|w| w.strong_count() > 0);
        all.push(Arc::downgrade(shared));
    }

    fn resolve(code_base: usize) -> Option<Arc<BinaryShared>> {
        BINARIES
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .find(|s| s.address() as usize == code_base)
    }

    /// Link a frame record (called from generated prologs with the
    /// frame base).
    pub extern "C" fn push_frame(frame_base: *mut usize) {
        FRAMES.with(|f| f.borrow_mut().push(frame_base as usize));
    }

    /// Unlink the innermost frame (called from generated epilogs).
    pub extern "C" fn pop_frame() {
        FRAMES.with(|f| {
            f.borrow_mut().pop();
        });
    }

    /// Run the destructors of one generated frame. This is the entry the
    /// 32-bit handler records point at; platform glue calls it with the
    /// frame base while the frame is still live.
    pub extern "C" fn cleanup_frame(frame_base: *mut usize) {
        let base = frame_base as usize;
        cleanup_one(base);
        FRAMES.with(|f| {
            let mut f = f.borrow_mut();
            if let Some(pos) = f.iter().rposition(|&r| r == base) {
                f.remove(pos);
            }
        });
    }

    /// Number of linked frames on this thread. Doubles as the mark a
    /// protected-call boundary records at entry.
    pub fn depth() -> usize {
        FRAMES.with(|f| f.borrow().len())
    }

    /// The live frame bases, innermost first.
    pub fn frames() -> Vec<usize> {
        FRAMES.with(|f| f.borrow().iter().rev().copied().collect())
    }

    /// Drain every frame linked after `mark` and run its destructors,
    /// innermost first. Must run while the frames are still below the
    /// current stack extent, before any jump past them.
    pub fn cleanup_frames(mark: usize) {
        let drained: Vec<usize> = FRAMES.with(|f| {
            let mut f = f.borrow_mut();
            if f.len() <= mark {
                Vec::new()
            } else {
                f.split_off(mark)
            }
        });
        for frame_base in drained.into_iter().rev() {
            cleanup_one(frame_base);
        }
    }

    /// Destructors for one frame: the frame stores its code base and the
    /// active part id at fixed offsets shared with the prolog layout.
    fn cleanup_one(frame_base: usize) {
        let code_base = unsafe { *((frame_base as isize + OWNER_OFFSET as isize) as *const usize) };
        let Some(shared) = resolve(code_base) else {
            log::warn!(
                "no installed binary for frame {:#x} (code base {:#x}); skipping cleanup",
                frame_base,
                code_base
            );
            return;
        };
        let part = unsafe { *((frame_base as isize + PART_ID_OFFSET as isize) as *const i32) };
        let frame = RecordFrame {
            frame_base,
            part: Part(part as u32),
        };
        shared.cleanup(&frame);
    }

    pub fn push_frame_addr() -> usize {
        push_frame as usize
    }

    pub fn pop_frame_addr() -> usize {
        pop_frame as usize
    }

    pub fn cleanup_frame_addr() -> usize {
        cleanup_frame as usize
    }

    // === Protected calls (x86-64 SysV) ===
    //
    // Entering generated code goes through a small assembly shim that
    // snapshots the callee-saved register file, like the register spill
    // an arena entry performs. `vela_raise` restores the snapshot and
    // jumps back to the shim's recovery point: a longjmp that steps
    // over the generated frames instead of unwinding through them.

    /// Register snapshot for one protected-call boundary.
    /// Layout fixed by the assembly: rsp, rbp, rbx, r12..r15, recovery
    /// rip, then the raised flag.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[repr(C)]
    #[derive(Default)]
    pub struct JmpBuf {
        pub regs: [usize; 8],
        pub raised: usize,
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    impl JmpBuf {
        /// Did control come back through `vela_raise`?
        pub fn raised(&self) -> bool {
            self.raised != 0
        }
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    std::arch::global_asm!(
        ".text",
        ".balign 16",
        ".globl vela_enter",
        "vela_enter:",
        // Snapshot into the buffer in rdx; rsp still points at our
        // return address, which is where recovery resumes.
        "mov [rdx + 0], rsp",
        "mov [rdx + 8], rbp",
        "mov [rdx + 16], rbx",
        "mov [rdx + 24], r12",
        "mov [rdx + 32], r13",
        "mov [rdx + 40], r14",
        "mov [rdx + 48], r15",
        "lea rax, [rip + .Lvela_recover]",
        "mov [rdx + 56], rax",
        "mov qword ptr [rdx + 64], 0",
        // call code(arg): shift the argument into place and realign.
        "mov rax, rdi",
        "mov rdi, rsi",
        "sub rsp, 8",
        "call rax",
        "add rsp, 8",
        "ret",
        ".Lvela_recover:",
        // Arrived from vela_raise with the payload already in rax and
        // rsp restored to our entry value.
        "ret",
        ".globl vela_raise",
        "vela_raise:",
        "mov rax, rsi",
        "mov qword ptr [rdi + 64], 1",
        "mov rsp, [rdi + 0]",
        "mov rbp, [rdi + 8]",
        "mov rbx, [rdi + 16]",
        "mov r12, [rdi + 24]",
        "mov r13, [rdi + 32]",
        "mov r14, [rdi + 40]",
        "mov r15, [rdi + 48]",
        "jmp qword ptr [rdi + 56]",
    );

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    extern "C" {
        fn vela_enter(code: *const u8, arg: i64, buf: *mut JmpBuf) -> i64;
        fn vela_raise(buf: *mut JmpBuf, payload: i64) -> !;
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    thread_local! {
        /// Active protected-call boundaries: `(jmpbuf, frame mark)`,
        /// outermost first.
        static ENTRIES: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    }

    /// Call `code` with one integer argument under a boundary that
    /// [`raise`] can return to.
    ///
    /// # Safety
    /// `code` must be the entry of a generated function taking at most
    /// one integer argument.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub(super) unsafe fn enter(code: *const u8, arg: i64, buf: &mut JmpBuf) -> i64 {
        ENTRIES.with(|e| {
            e.borrow_mut()
                .push((buf as *mut JmpBuf as usize, depth()))
        });
        let result = vela_enter(code, arg, buf);
        ENTRIES.with(|e| {
            e.borrow_mut().pop();
        });
        result
    }

    /// Throw out of generated code: run the destructors of every
    /// generated frame entered since the innermost protected call, then
    /// transfer control back to that boundary with `payload`.
    ///
    /// # Safety
    /// Must be called (directly or through plain calls) from code
    /// entered via a protected call on this thread. The jump skips the
    /// intervening frames without unwinding them, so no frame between
    /// the boundary and the caller may hold pending Rust destructors.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub unsafe fn raise(payload: i64) -> ! {
        let (buf, mark) = ENTRIES
            .with(|e| e.borrow().last().copied())
            .expect("raise without a protected call on this thread");
        // Destructors run here, while the generated frames are still
        // live stack memory above us.
        cleanup_frames(mark);
        vela_raise(buf as *mut JmpBuf, payload)
    }
}

/// One variable as the unwinder sees it.
#[derive(Debug, Clone, Copy)]
pub struct VarRecord {
    pub id: u32,
    pub free_opt: FreeOpt,
    pub size: Size,
}

/// Per-part unwind record: the previous part in the chain and the
/// variables introduced here, in declaration order.
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub prev: u32,
    pub vars: Vec<VarRecord>,
}

/// A frame under unwinding, as presented by the platform glue.
pub trait StackFrame {
    /// The part that was active when the exception passed the frame.
    fn active_part(&self) -> Part;

    /// Map a metadata frame offset to an address inside this frame.
    fn to_ptr(&self, offset: isize) -> *mut u8;
}

/// A live generated frame described by its frame base; the unwind chain
/// stores these bases and the prolog layout fixes where the part id
/// lives.
struct RecordFrame {
    frame_base: usize,
    part: Part,
}

impl StackFrame for RecordFrame {
    fn active_part(&self) -> Part {
        self.part
    }

    fn to_ptr(&self, offset: isize) -> *mut u8 {
        (self.frame_base as isize + offset) as *mut u8
    }
}

/// The parts of a binary the unwind path needs after installation. Kept
/// behind an `Arc` so a frame record can reach it through the process
/// registry while the owning `Binary` lives elsewhere.
pub(crate) struct BinaryShared {
    /// Rooted slot holding the current client pointer of the code
    /// block; the collector rewrites it on moves.
    code_slot: UnsafeCell<*mut u8>,
    len: usize,
    meta_offset: usize,
    parts: Vec<PartRecord>,
}

// The slot is only written by the collector inside its own
// synchronization; everything else is immutable after installation.
unsafe impl Send for BinaryShared {}
unsafe impl Sync for BinaryShared {}

impl BinaryShared {
    fn address(&self) -> *const u8 {
        unsafe { *self.code_slot.get() }
    }

    fn metadata_entry(&self, var_id: u32) -> Option<(usize, isize)> {
        if self.meta_offset == 0 {
            return None;
        }
        unsafe {
            let table = self.address().add(self.meta_offset) as *const usize;
            let fn_ptr = *table.add(var_id as usize * 2);
            let offset = *table.add(var_id as usize * 2 + 1) as isize;
            Some((fn_ptr, offset))
        }
    }

    /// Run destructors for an exception unwinding through `frame`: from
    /// the active part toward the root, within each part in reverse
    /// declaration order, for every variable marked to be freed on
    /// exceptions.
    fn cleanup(&self, frame: &dyn StackFrame) {
        if self.meta_offset == 0 {
            log::warn!(
                "binary at {:p} has no metadata; skipping cleanup",
                self.address()
            );
            return;
        }

        let mut part = frame.active_part();
        while part.valid() {
            let Some(rec) = self.parts.get(part.key() as usize) else {
                break;
            };
            for v in rec.vars.iter().rev() {
                if v.free_opt.contains(FreeOpt::ON_EXCEPTION) {
                    self.cleanup_var(frame, v);
                }
            }
            part = if rec.prev == u32::MAX {
                Part::INVALID
            } else {
                Part(rec.prev)
            };
        }
    }

    fn cleanup_var(&self, frame: &dyn StackFrame, v: &VarRecord) {
        let Some((fn_ptr, offset)) = self.metadata_entry(v.id) else {
            return;
        };
        if fn_ptr == 0 {
            return;
        }
        let mut ptr = frame.to_ptr(offset);

        unsafe {
            if v.free_opt.contains(FreeOpt::INDIRECTION) {
                // The slot stores a pointer to the real value.
                ptr = *(ptr as *const *mut u8);
            }

            type FPtr = extern "C" fn(*mut u8);
            type FByte = extern "C" fn(u8);
            type FInt = extern "C" fn(i32);
            type FLong = extern "C" fn(i64);

            let ptr64 = cfg!(target_pointer_width = "64");
            if v.free_opt.contains(FreeOpt::PTR) {
                std::mem::transmute::<usize, FPtr>(fn_ptr)(ptr);
            } else if v.size == Size::PTR {
                std::mem::transmute::<usize, FPtr>(fn_ptr)(*(ptr as *const *mut u8));
            } else {
                match v.size.current(ptr64) {
                    1 => std::mem::transmute::<usize, FByte>(fn_ptr)(*ptr),
                    4 => std::mem::transmute::<usize, FInt>(fn_ptr)(*(ptr as *const i32)),
                    8 => std::mem::transmute::<usize, FLong>(fn_ptr)(*(ptr as *const i64)),
                    n => {
                        log::warn!("unsupported size {} for destruction; use the pointer flag", n)
                    }
                }
            }
        }
    }
}

/// A listing lowered, encoded and installed in collector-owned
/// executable memory.
pub struct Binary {
    shared: Arc<BinaryShared>,
    root: vgc::Root,
    arena: Arc<vgc::Arena>,
}

impl Binary {
    /// Build a binary from a listing.
    pub fn new(
        backend: &dyn Backend,
        arena: Arc<vgc::Arena>,
        listing: &Listing,
    ) -> Result<Binary> {
        let tfm = backend.transform(listing)?;
        let encoded = backend.encode(&tfm)?;

        let meta_offset = encoded.label_offsets[Label::META.id() as usize];
        if meta_offset == 0 {
            log::warn!("no metadata was generated by the backend");
            log::warn!("exception cleanup will not work for this binary");
        }

        let parts = fill_parts(listing);

        // Install into a code allocation and link once.
        let code = arena.alloc_code(encoded.bytes.len(), encoded.refs.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(encoded.bytes.as_ptr(), code, encoded.bytes.len());
            let trailer = vgc::fmt::code_refs(code);
            for (i, r) in encoded.refs.iter().enumerate() {
                let pointer = match r.target {
                    RefTarget::Addr(a) => a as *mut u8,
                    RefTarget::Inside(l) => encoded.label_offsets[l.id() as usize] as *mut u8,
                };
                (*trailer).refs_mut()[i] = GcCodeRef {
                    offset: r.offset,
                    kind: r.kind,
                    pointer,
                };
            }
            vgc::code::update_ptrs(code, trailer);
        }

        let shared = Arc::new(BinaryShared {
            code_slot: UnsafeCell::new(code),
            len: encoded.bytes.len(),
            meta_offset,
            parts,
        });
        let root = arena
            .create_root(shared.code_slot.get() as *mut *mut u8, 1, false)
            .map_err(CodeError::Gc)?;
        unwind::register_binary(&shared);

        Ok(Binary {
            shared,
            root,
            arena,
        })
    }

    /// Entry point of the generated code.
    ///
    /// A moving collector may relocate the block; this always reads the
    /// rooted slot, which tracks moves.
    pub fn address(&self) -> *const u8 {
        self.shared.address()
    }

    /// Machine-code byte length.
    pub fn len(&self) -> usize {
        self.shared.len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len == 0
    }

    /// Byte offset of the variable metadata table.
    pub fn meta_offset(&self) -> usize {
        self.shared.meta_offset
    }

    /// The per-part unwind records.
    pub fn parts(&self) -> &[PartRecord] {
        &self.shared.parts
    }

    /// Read the `(destructor, offset)` pair recorded for a variable.
    pub fn metadata_entry(&self, var_id: u32) -> Option<(usize, isize)> {
        self.shared.metadata_entry(var_id)
    }

    /// Run destructors for an exception unwinding through `frame`. See
    /// [`unwind::cleanup_frames`] for the runtime path that feeds real
    /// frames in here.
    pub fn cleanup(&self, frame: &dyn StackFrame) {
        self.shared.cleanup(frame);
    }

    /// Call the generated code with one integer argument under an
    /// unwind boundary. Returns the function's result, or the payload
    /// passed to [`unwind::raise`] if a throw crossed the frames;
    /// destructors of every abandoned frame have run by then.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn call_protected(&self, arg: i64) -> std::result::Result<i64, i64> {
        let mut buf = unwind::JmpBuf::default();
        let result = unsafe { unwind::enter(self.address(), arg, &mut buf) };
        if buf.raised() {
            Err(result)
        } else {
            Ok(result)
        }
    }
}

impl Drop for Binary {
    fn drop(&mut self) {
        // The code block becomes collectable on the next cycle; the
        // registry entry dies with the shared state.
        let _ = self.arena.destroy_root(self.root);
    }
}

// The code pointer is only written by the collector inside its own
// synchronization; sharing the binary between threads is safe.
unsafe impl Send for Binary {}
unsafe impl Sync for Binary {}

/// Build the per-part variable records from the source listing.
fn fill_parts(src: &Listing) -> Vec<PartRecord> {
    src.all_parts()
        .into_iter()
        .map(|p| PartRecord {
            prev: src.prev_part(p).key(),
            vars: src
                .part_vars(p)
                .iter()
                .map(|&v| VarRecord {
                    id: v.key(),
                    free_opt: src.free_opt(v),
                    size: src.var_size(v),
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::Listing;
    use crate::size::Size;

    #[test]
    fn test_fill_parts_structure() {
        let mut l = Listing::new();
        let root = l.root().part();
        let p1 = l.create_part(root);
        let b = l.create_block(p1);
        let _v0 = l.create_int_var(root);
        let _v1 = l.create_int_var(p1);
        let _v2 = l.create_int_var(b.part());

        let parts = fill_parts(&l);
        assert_eq!(parts.len(), 3);
        // Root part has no predecessor.
        assert_eq!(parts[0].prev, u32::MAX);
        // p1 follows the root part.
        assert_eq!(parts[1].prev, 0);
        // The block's first part chains to its parent part.
        assert_eq!(parts[2].prev, 1);
        assert_eq!(parts[0].vars.len(), 1);
        assert_eq!(parts[2].vars[0].size, Size::INT);
    }

    #[test]
    fn test_unwind_chain() {
        let mut record = [0usize; 2];
        assert_eq!(unwind::depth(), 0);
        unwind::push_frame(record.as_mut_ptr());
        assert_eq!(unwind::depth(), 1);
        assert_eq!(unwind::frames()[0], record.as_ptr() as usize);
        unwind::pop_frame();
        assert_eq!(unwind::depth(), 0);
    }

    #[test]
    fn test_cleanup_frames_skips_unknown_frames() {
        // A frame whose stored code base matches no installed binary is
        // dropped from the chain with a diagnostic, not a crash.
        let mut fake = [0usize; 8];
        let base = fake.as_mut_ptr() as usize + 4 * std::mem::size_of::<usize>();
        unwind::push_frame(base as *mut usize);
        unwind::cleanup_frames(0);
        assert_eq!(unwind::depth(), 0);
        let _ = &mut fake;
    }
}
