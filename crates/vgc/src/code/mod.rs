//! Code allocations and their reference trailers.
//!
//! A code allocation is executable memory owned by the collector. Its
//! trailer ([`GcCode`]) describes every place inside the machine code
//! that encodes a pointer, so the collector can rewrite the instruction
//! bytes after the block (or any referent) moves.
//!
//! The writes performed here must each be visible as one store to the
//! instruction decoder. Atomicity beyond that is the collector's
//! responsibility; callers never race on the same block.

pub mod x64;
mod x86;

use vela_util::atomic::{unaligned_write_u32, unaligned_write_word};
use vela_util::WORD_SIZE;

/// How one trailer entry patches the code.
///
/// The least significant bit tells the scanners whether `pointer` is a
/// managed pointer that must be fixed during collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RefKind {
    /// Entry not in use.
    Disabled = 0x00,
    /// Absolute pointer value at `offset`.
    RawPtr = 0x01,
    /// Word-sized offset relative to the end of the slot.
    Relative = 0x03,
    /// Pointer-sized relative offset. Identical to `Relative` on the
    /// targets supported here; kept distinct for the encoders.
    RelativePtr = 0x05,
    /// `pointer` holds an offset inside this very blob; the slot gets
    /// the absolute address `code_base + pointer`. Not scanned.
    Inside = 0x02,
    /// 32-bit offset, relative to the end of the slot, to the trailer
    /// entry's own `pointer` field. The code reads the target through
    /// the trailer, so the trailer value is scanned and the instruction
    /// bytes never need repatching for target motion.
    RelativeHere = 0x07,
    /// Architecture specific: the blob contains unwind information at
    /// `offset` which must be registered with the platform unwinder.
    /// Not scanned.
    UnwindInfo = 0x04,
}

impl RefKind {
    /// Must the collector scan (and possibly update) `pointer`?
    #[inline]
    pub fn scanned(self) -> bool {
        (self as usize) & 1 != 0
    }
}

/// One typed reference inside a code allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GcCodeRef {
    /// Byte offset of the patched slot inside the code.
    pub offset: usize,
    /// How the slot is patched.
    pub kind: RefKind,
    /// The referent. Scanned when `kind.scanned()`.
    pub pointer: *mut u8,
}

/// Trailer stored immediately after the code bytes of a code allocation.
#[repr(C)]
pub struct GcCode {
    /// Number of reference entries.
    pub ref_count: usize,
    /// Self-pointer to the allocation's client pointer. Scanned first so
    /// a moved block is re-found through its forwarder.
    pub reserved: *mut u8,
    /// Inline entries, `ref_count` long.
    pub refs: [GcCodeRef; 0],
}

impl GcCode {
    /// Bytes needed for a trailer with `refs` entries.
    #[inline]
    pub const fn size_for(refs: usize) -> usize {
        std::mem::size_of::<GcCode>() + refs * std::mem::size_of::<GcCodeRef>()
    }

    /// The reference entries.
    ///
    /// # Safety
    /// The trailer must have been initialized with `ref_count` entries.
    #[inline]
    pub unsafe fn refs(&self) -> &[GcCodeRef] {
        std::slice::from_raw_parts(self.refs.as_ptr(), self.ref_count)
    }

    /// Mutable view of the reference entries.
    ///
    /// # Safety
    /// Same as [`GcCode::refs`].
    #[inline]
    pub unsafe fn refs_mut(&mut self) -> &mut [GcCodeRef] {
        std::slice::from_raw_parts_mut(self.refs.as_mut_ptr(), self.ref_count)
    }
}

/// Patch the slot described by entry `id`.
///
/// # Safety
/// `code` must be the current client pointer of the allocation owning
/// `refs`, writable at every referenced offset.
unsafe fn write_ref(code: *mut u8, refs: *const GcCode, id: usize) {
    let r = &(*refs).refs()[id];
    let write = code.add(r.offset);
    let ptr = r.pointer as usize;

    match r.kind {
        RefKind::Disabled => {}
        RefKind::RawPtr => unaligned_write_word(write, ptr),
        RefKind::Relative | RefKind::RelativePtr => {
            unaligned_write_word(write, ptr.wrapping_sub(write as usize + WORD_SIZE));
        }
        RefKind::Inside => unaligned_write_word(write, ptr.wrapping_add(code as usize)),
        RefKind::RelativeHere => {
            // Relative pointer to the trailer slot itself; the offset is
            // not exposed conveniently anywhere else.
            let slot = &r.pointer as *const *mut u8 as usize;
            unaligned_write_u32(write, slot.wrapping_sub(write as usize + 4) as u32);
        }
        RefKind::UnwindInfo => {
            #[cfg(target_pointer_width = "64")]
            x64::update_unwind(code, r);
            #[cfg(target_pointer_width = "32")]
            x86::update_unwind(code, r);
        }
    }
}

/// Rewrite every slot referenced by the trailer so the code addresses
/// the current value of each `pointer`. Run after initial linking and
/// after any motion of the block. Idempotent.
///
/// # Safety
/// `code` must be the current client pointer of the allocation owning
/// `refs`; no other thread may execute or patch the block concurrently.
pub unsafe fn update_ptrs(code: *mut u8, refs: *const GcCode) {
    for i in 0..(*refs).ref_count {
        write_ref(code, refs, i);
    }
}

/// Patch a single entry after its `pointer` changed.
///
/// # Safety
/// Same as [`update_ptrs`].
pub unsafe fn write_ptr(code: *mut u8, id: usize) {
    let refs = crate::fmt::code_refs(code);
    write_ref(code, refs, id);
}

/// Does this platform need per-block finalization?
pub fn need_finalization() -> bool {
    #[cfg(target_pointer_width = "64")]
    {
        x64::need_finalization()
    }
    #[cfg(target_pointer_width = "32")]
    {
        x86::need_finalization()
    }
}

/// Release side-table state held for a dead code allocation.
///
/// # Safety
/// `code` must be the client pointer of a code allocation that will
/// never run again.
pub unsafe fn finalize(code: *mut u8) {
    #[cfg(target_pointer_width = "64")]
    x64::finalize(code);
    #[cfg(target_pointer_width = "32")]
    x86::finalize(code);
}
