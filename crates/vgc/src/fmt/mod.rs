//! Object format shared by all collector implementations.
//!
//! Every managed allocation carries a one-word `info` header immediately
//! in front of the client pointer:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │   info (1 word)      │   client data ...            │
//! └──────────────────────┴──────────────────────────────┘
//!                        ▲ client pointer
//!
//! info layout:
//!   bit 0 = 1: code allocation; remaining bits hold the machine-code
//!             byte length shifted left by one.
//!   bit 0 = 0: pointer to an immutable GcType header describing the
//!             object. Headers are word aligned, so bits 0-1 are free.
//!   bit 1    : finalized mark. Weak scanning treats marked objects as
//!             dead even while they are transiently reachable.
//! ```
//!
//! The header either points to a client-visible kind (`Fixed`, `FixedObj`,
//! `Type`, `Array`, `WeakArray`) or to one of the statically allocated
//! internal headers (`Pad0`, `Pad`, `Fwd1`, `Fwd`, `GcType`, `GcTypeFwd`)
//! that the collectors use for padding and forwarding.

pub mod scan;

pub use scan::{scan_array, scan_objects, scan_objects_if, traverse, ScanAction, Scanner};

use std::sync::atomic::{AtomicUsize, Ordering};
use vela_util::{align_up, WORD_SIZE};

/// Size of the object header in bytes (one word in front of the client
/// pointer).
pub const HEADER_SIZE: usize = WORD_SIZE;

/// Alignment required for header records such as [`GcType`].
pub const HEADER_ALIGN: usize = WORD_SIZE;

/// Code-allocation flag in `info`.
const INFO_CODE: usize = 0x1;
/// Finalized flag in `info`.
const INFO_FINALIZED: usize = 0x2;
/// All flag bits in `info`.
const INFO_FLAGS: usize = 0x3;

/// Header kinds. Values below 0x100 are client-visible; the rest are
/// internal to the collectors.
pub mod kind {
    /// Fixed-size object without a descriptor slot.
    pub const FIXED: usize = 0x00;
    /// Fixed-size object with a type descriptor pointer at offset 0.
    pub const FIXED_OBJ: usize = 0x01;
    /// An object that itself describes other types. Has a descriptor
    /// pointer at offset 0 and a `GcType` pointer in its first field.
    pub const TYPE: usize = 0x02;
    /// Array of elements, each `stride` bytes.
    pub const ARRAY: usize = 0x03;
    /// Array of weakly referenced pointers.
    pub const WEAK_ARRAY: usize = 0x04;

    /// Padding object, zero words of payload.
    pub const PAD0: usize = 0x100;
    /// Padding object, at least one word of payload.
    pub const PAD: usize = 0x101;
    /// Forwarding object, exactly one word of payload.
    pub const FWD1: usize = 0x102;
    /// Forwarding object, at least two words of payload.
    pub const FWD: usize = 0x103;
    /// A `GcType` descriptor allocated on the heap.
    pub const GC_TYPE: usize = 0x104;
    /// A heap `GcType` acting as a forwarder. The `type_obj` field holds
    /// the forward pointer; the descriptor stays scannable so objects it
    /// describes can still be walked while it is a forwarder.
    pub const GC_TYPE_FWD: usize = 0x105;
}

/// Finalizer invoked with the client pointer of a dead object.
pub type Finalizer = unsafe fn(*mut u8);

/// Type descriptor. One immutable record classifies every regular
/// allocation; the low bits of `info` point here.
///
/// The offset array is allocated inline after the struct, `count`
/// entries long. Descriptors are handed out by the arena's type pool and
/// must outlive every object referring to them.
#[repr(C)]
pub struct GcType {
    /// One of the `kind` constants. Shared first field with the internal
    /// headers, so a header can always be classified by reading one word.
    pub kind: usize,
    /// Back-reference to the user-level type object (a client pointer,
    /// scanned). `GC_TYPE_FWD` reuses this field as the forward pointer.
    pub type_obj: *mut u8,
    /// Finalizer to run when an object of this type becomes unreachable.
    pub finalize: Option<Finalizer>,
    /// Object size, or element size for arrays, in bytes.
    pub stride: usize,
    /// Number of pointer offsets following the struct.
    pub count: usize,
    /// Inline offset array, `count` entries.
    pub offsets: [usize; 0],
}

impl GcType {
    /// The pointer offsets described by this type.
    ///
    /// # Safety
    /// The descriptor must have been allocated with room for `count`
    /// trailing offsets.
    #[inline]
    pub unsafe fn offsets(&self) -> &[usize] {
        std::slice::from_raw_parts(self.offsets.as_ptr(), self.count)
    }

    /// Mutable view of the offset array.
    ///
    /// # Safety
    /// Same as [`GcType::offsets`]; additionally nothing may be scanning
    /// objects of this type concurrently.
    #[inline]
    pub unsafe fn offsets_mut(&mut self) -> &mut [usize] {
        std::slice::from_raw_parts_mut(self.offsets.as_mut_ptr(), self.count)
    }
}

/// Bytes needed for a `GcType` with `entries` offsets.
#[inline]
pub const fn gc_type_size(entries: usize) -> usize {
    std::mem::size_of::<GcType>() + entries * WORD_SIZE
}

/// Statically allocated internal headers. `repr(C)` layout-compatible
/// with `GcType` for the `kind` field only, which is all the scanners
/// read for these kinds.
#[repr(C)]
pub struct InternalHeader {
    pub kind: usize,
}

// The scanners classify objects by `kind` before touching any other
// field, so a bare one-word header is enough here.
pub static HEADER_PAD0: InternalHeader = InternalHeader { kind: kind::PAD0 };
pub static HEADER_PAD: InternalHeader = InternalHeader { kind: kind::PAD };
pub static HEADER_FWD1: InternalHeader = InternalHeader { kind: kind::FWD1 };
pub static HEADER_FWD: InternalHeader = InternalHeader { kind: kind::FWD };
pub static HEADER_GC_TYPE: InternalHeader = InternalHeader { kind: kind::GC_TYPE };
pub static HEADER_GC_TYPE_FWD: InternalHeader = InternalHeader {
    kind: kind::GC_TYPE_FWD,
};

/// Array payload prefix: two words before the elements.
#[repr(C)]
pub struct ArrayHeader {
    pub count: usize,
    pub filled: usize,
}

/// Weak array payload prefix. Both fields are tagged with a 1 in the low
/// bit so a scanner can never confuse them with client pointers.
#[repr(C)]
pub struct WeakHeader {
    pub count: usize,
    pub splatted: usize,
}

/// Payload of a one-word forwarder.
#[repr(C)]
pub struct Fwd1 {
    pub to: *mut u8,
}

/// Payload of a forwarder that preserves the original size.
#[repr(C)]
pub struct Fwd {
    pub to: *mut u8,
    pub size: usize,
}

/// Payload of a padding object of at least one word.
#[repr(C)]
pub struct Pad {
    pub size: usize,
}

/// Two words in front of array elements.
pub const ARRAY_HEADER_SIZE: usize = std::mem::size_of::<ArrayHeader>();

/// Extract the element count from a weak header.
#[inline]
pub fn weak_count(weak: &WeakHeader) -> usize {
    weak.count >> 1
}

/// Record another splatted slot in a weak header, keeping the tag.
#[inline]
pub fn weak_splat(weak: &mut WeakHeader) {
    weak.splatted = (weak.splatted + 0x2) | 0x1;
}

/// Splat count of a weak array, untagged.
#[inline]
pub fn weak_splatted(weak: &WeakHeader) -> usize {
    weak.splatted >> 1
}

// === Base/client pointer conversion ===

/// Base pointer of an allocation from its client pointer.
#[inline]
pub fn from_client(client: *const u8) -> *mut u8 {
    (client as usize - HEADER_SIZE) as *mut u8
}

/// Client pointer of an allocation from its base pointer.
#[inline]
pub fn to_client(base: *mut u8) -> *mut u8 {
    (base as usize + HEADER_SIZE) as *mut u8
}

#[inline]
fn info_ref(client: *const u8) -> &'static AtomicUsize {
    unsafe { &*(from_client(client) as *const AtomicUsize) }
}

// === info word primitives (client pointers throughout) ===

/// Is this a code allocation?
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
#[inline]
pub unsafe fn is_code(client: *const u8) -> bool {
    info_ref(client).load(Ordering::Relaxed) & INFO_CODE != 0
}

/// Machine-code byte length of a code allocation. Assumes [`is_code`].
///
/// # Safety
/// `client` must be a client pointer to an initialized code allocation.
#[inline]
pub unsafe fn code_size(client: *const u8) -> usize {
    (info_ref(client).load(Ordering::Relaxed) & !INFO_FLAGS) >> 1
}

/// Header of a regular allocation. Assumes `!is_code`.
///
/// # Safety
/// `client` must be a client pointer to an initialized regular
/// allocation.
#[inline]
pub unsafe fn header(client: *const u8) -> *const GcType {
    (info_ref(client).load(Ordering::Relaxed) & !INFO_FLAGS) as *const GcType
}

/// Header kind of a regular allocation.
///
/// # Safety
/// Same as [`header`].
#[inline]
pub unsafe fn header_kind(client: *const u8) -> usize {
    (*header(client)).kind
}

/// Mark the object finalized, in a single atomic instruction so the code
/// flag and header bits survive.
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
#[inline]
pub unsafe fn set_finalized(client: *mut u8) {
    info_ref(client).fetch_or(INFO_FINALIZED, Ordering::AcqRel);
}

/// Clear the finalized mark (used on resurrection).
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
#[inline]
pub unsafe fn clear_finalized(client: *mut u8) {
    info_ref(client).fetch_and(!INFO_FINALIZED, Ordering::AcqRel);
}

/// Has the object been finalized? Works for both code and regular
/// allocations.
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
#[inline]
pub unsafe fn is_finalized(client: *const u8) -> bool {
    info_ref(client).load(Ordering::Acquire) & INFO_FINALIZED != 0
}

/// Set the info word to a code allocation of `code_size` bytes.
/// `code_size` is assumed to be word aligned.
///
/// # Safety
/// `client` must point one header past writable memory.
#[inline]
pub unsafe fn set_code(client: *mut u8, code_size: usize) {
    info_ref(client).store((code_size << 1) | INFO_CODE, Ordering::Relaxed);
}

/// Set the info word to point at `header`. The header must be aligned to
/// [`HEADER_ALIGN`].
///
/// # Safety
/// `client` must point one header past writable memory.
#[inline]
pub unsafe fn set_header(client: *mut u8, header: *const GcType) {
    debug_assert!(vela_util::is_aligned(header as usize, HEADER_ALIGN));
    info_ref(client).store(header as usize, Ordering::Relaxed);
}

#[inline]
unsafe fn set_internal_header(client: *mut u8, header: &'static InternalHeader) {
    info_ref(client).store(header as *const InternalHeader as usize, Ordering::Relaxed);
}

/// Replace the header of a regular allocation, preserving the flag bits.
/// Uses CAS so a concurrent flag update is never lost.
///
/// # Safety
/// `client` must be a regular allocation; `new_header` must describe an
/// object of identical size and kind.
pub unsafe fn replace_header(client: *mut u8, new_header: *const GcType) {
    let info = info_ref(client);
    let mut old = info.load(Ordering::Acquire);
    loop {
        let replace = (old & INFO_FLAGS) | new_header as usize;
        match info.compare_exchange_weak(old, replace, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => old = actual,
        }
    }
}

/// Non-atomic header replacement for use inside a stop-the-world scan.
///
/// # Safety
/// Only while the world is stopped; same contract as [`replace_header`].
#[inline]
pub unsafe fn replace_header_unsafe(client: *mut u8, new_header: *const GcType) {
    let info = info_ref(client);
    let flags = info.load(Ordering::Relaxed) & INFO_FLAGS;
    info.store(flags | new_header as usize, Ordering::Relaxed);
}

// === Size computations ===

/// Align an allocation size.
#[inline]
pub const fn align_alloc(size: usize) -> usize {
    align_up(size, HEADER_SIZE)
}

/// Total size of a fixed object described by `ty`, header included.
#[inline]
pub fn size_obj(ty: &GcType) -> usize {
    align_alloc(HEADER_SIZE + ty.stride)
}

/// Total size of an array of `count` elements, header included.
#[inline]
pub fn size_array(ty: &GcType, count: usize) -> usize {
    align_alloc(HEADER_SIZE + ARRAY_HEADER_SIZE + ty.stride * count)
}

/// Bytes needed for the reference trailer of a code allocation.
#[inline]
pub fn size_refs(refs: usize) -> usize {
    crate::code::GcCode::size_for(refs)
}

/// Total size of a code allocation: `code` bytes of word-aligned machine
/// code plus a trailer with `refs` references.
#[inline]
pub fn size_code(code: usize, refs: usize) -> usize {
    align_alloc(HEADER_SIZE + code + size_refs(refs))
}

/// The reference trailer of a code allocation, stored immediately after
/// the code bytes.
///
/// # Safety
/// `client` must be a client pointer to an initialized code allocation.
#[inline]
pub unsafe fn code_refs(client: *mut u8) -> *mut crate::code::GcCode {
    let code = code_size(client);
    client.add(code) as *mut crate::code::GcCode
}

/// Total size of any allocation, header included, so regions can be
/// walked with [`skip`]. Constant time.
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
pub unsafe fn size(client: *const u8) -> usize {
    if is_code(client) {
        let code = code_size(client);
        let refs = (*code_refs(client as *mut u8)).ref_count;
        return size_code(code, refs);
    }

    let h = header(client);
    match (*h).kind {
        kind::FIXED | kind::FIXED_OBJ | kind::TYPE => size_obj(&*h),
        kind::ARRAY => {
            let count = (*(client as *const ArrayHeader)).count;
            size_array(&*h, count)
        }
        kind::WEAK_ARRAY => {
            let count = weak_count(&*(client as *const WeakHeader));
            size_array(&*h, count)
        }
        kind::PAD0 => HEADER_SIZE,
        kind::PAD => HEADER_SIZE + (*(client as *const Pad)).size,
        kind::FWD1 => HEADER_SIZE + std::mem::size_of::<Fwd1>(),
        kind::FWD => HEADER_SIZE + (*(client as *const Fwd)).size,
        kind::GC_TYPE | kind::GC_TYPE_FWD => {
            HEADER_SIZE + gc_type_size((*(client as *const GcType)).count)
        }
        other => {
            // Most likely the heap was corrupted.
            log::error!("unknown object kind {:#x} at {:p}", other, client);
            debug_assert!(false, "unknown object kind");
            HEADER_SIZE
        }
    }
}

/// Client pointer of whatever is stored directly after this object.
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation inside
/// a contiguous object region.
#[inline]
pub unsafe fn skip(client: *mut u8) -> *mut u8 {
    client.add(size(client))
}

// === Padding and forwarders ===

/// Overwrite `size` bytes at `client` (header included) with a padding
/// object. Required at any gap produced during compaction.
///
/// # Safety
/// `client - HEADER_SIZE` must be writable for `size` bytes and no live
/// object may overlap the range.
pub unsafe fn make_pad(client: *mut u8, size: usize) {
    debug_assert!(size >= HEADER_SIZE, "padding smaller than a header");
    if size <= HEADER_SIZE {
        set_internal_header(client, &HEADER_PAD0);
    } else {
        set_internal_header(client, &HEADER_PAD);
        (*(client as *mut Pad)).size = size - HEADER_SIZE;
    }
}

/// Is this object a padding object?
///
/// # Safety
/// `client` must be a client pointer to an initialized regular
/// allocation.
#[inline]
pub unsafe fn is_pad(client: *const u8) -> bool {
    matches!(header_kind(client), kind::PAD0 | kind::PAD)
}

/// Overwrite the object with a forwarder to `to`, preserving its size so
/// a region containing it can still be walked.
///
/// A heap `GcType` becomes a `GC_TYPE_FWD`: the forward pointer lives in
/// the `type_obj` field and the descriptor remains usable for scanning
/// objects that still point at it.
///
/// # Safety
/// `client` must be a client pointer to an initialized regular
/// allocation at least `HEADER_SIZE + size_of::<Fwd1>()` bytes large; the
/// world must be stopped or the object otherwise unreachable by other
/// scanners.
pub unsafe fn make_fwd(client: *mut u8, to: *mut u8) {
    if !is_code(client) && matches!(header_kind(client), kind::GC_TYPE | kind::GC_TYPE_FWD) {
        set_internal_header(client, &HEADER_GC_TYPE_FWD);
        (*(client as *mut GcType)).type_obj = to;
        return;
    }

    // Size must be read while the old header is intact; a forwarded code
    // allocation loses its code bit and becomes a plain Fwd.
    let total = size(client);
    debug_assert!(total >= HEADER_SIZE + std::mem::size_of::<Fwd1>());
    if total <= HEADER_SIZE + std::mem::size_of::<Fwd1>() {
        set_internal_header(client, &HEADER_FWD1);
        (*(client as *mut Fwd1)).to = to;
    } else {
        set_internal_header(client, &HEADER_FWD);
        let fwd = client as *mut Fwd;
        (*fwd).to = to;
        (*fwd).size = total - HEADER_SIZE;
    }
}

/// Is the object a forwarder? If so, to where?
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
pub unsafe fn is_fwd(client: *const u8) -> Option<*mut u8> {
    if is_code(client) {
        return None;
    }
    match header_kind(client) {
        kind::FWD1 => Some((*(client as *const Fwd1)).to),
        kind::FWD => Some((*(client as *const Fwd)).to),
        kind::GC_TYPE_FWD => Some((*(client as *const GcType)).type_obj),
        _ => None,
    }
}

/// Is this a forwarder or a padding object?
///
/// # Safety
/// `client` must be a client pointer to an initialized allocation.
pub unsafe fn is_special(client: *const u8) -> bool {
    if is_code(client) {
        return false;
    }
    matches!(
        header_kind(client),
        kind::PAD0 | kind::PAD | kind::FWD1 | kind::FWD | kind::GC_TYPE_FWD
    )
}

// === Whole-allocation initialization ===
//
// These take raw allocation memory (base pointers) and return the client
// pointer. Memory is zeroed first so partially initialized objects never
// expose stale pointers, and the header is written before any field.

/// Initialize a regular object of `size` total bytes described by `ty`.
///
/// # Safety
/// `memory` must be writable for `size` bytes; `ty` must outlive the
/// object.
pub unsafe fn init_obj(memory: *mut u8, ty: *const GcType, size: usize) -> *mut u8 {
    std::ptr::write_bytes(memory, 0, size);
    let client = to_client(memory);
    set_header(client, ty);
    client
}

/// Initialize an array of `elements` elements.
///
/// # Safety
/// Same as [`init_obj`]; `size` must come from [`size_array`].
pub unsafe fn init_array(
    memory: *mut u8,
    ty: *const GcType,
    size: usize,
    elements: usize,
) -> *mut u8 {
    std::ptr::write_bytes(memory, 0, size);
    let client = to_client(memory);
    set_header(client, ty);
    (*(client as *mut ArrayHeader)).count = elements;
    client
}

/// Initialize a weak array of `elements` slots. Count and splat counter
/// are stored tagged.
///
/// # Safety
/// Same as [`init_array`].
pub unsafe fn init_weak_array(
    memory: *mut u8,
    ty: *const GcType,
    size: usize,
    elements: usize,
) -> *mut u8 {
    std::ptr::write_bytes(memory, 0, size);
    let client = to_client(memory);
    set_header(client, ty);
    let weak = client as *mut WeakHeader;
    (*weak).count = (elements << 1) | 0x1;
    (*weak).splatted = 0x1;
    client
}

/// Initialize a code allocation: `code` bytes of machine code followed by
/// a trailer for `refs` references. The trailer's self-pointer is set so
/// scanners can find the block after a move.
///
/// # Safety
/// `memory` must be writable for `size` bytes; `size` must come from
/// [`size_code`].
pub unsafe fn init_code(memory: *mut u8, size: usize, code: usize, refs: usize) -> *mut u8 {
    std::ptr::write_bytes(memory, 0, size);
    let client = to_client(memory);
    set_code(client, code);
    let trailer = code_refs(client);
    (*trailer).ref_count = refs;
    (*trailer).reserved = client;
    client
}

/// Initialize a heap-allocated `GcType` with room for `entries` offsets.
/// Returns the descriptor (a client pointer).
///
/// # Safety
/// `memory` must be writable for `HEADER_SIZE + gc_type_size(entries)`
/// bytes.
pub unsafe fn init_gc_type(memory: *mut u8, entries: usize) -> *mut GcType {
    let size = HEADER_SIZE + gc_type_size(entries);
    std::ptr::write_bytes(memory, 0, size);
    let client = to_client(memory);
    set_internal_header(client, &HEADER_GC_TYPE);
    let ty = client as *mut GcType;
    (*ty).kind = kind::GC_TYPE;
    (*ty).count = entries;
    ty
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Tests build descriptors on the Rust heap; the real pool lives in
    // the arena. The inline offsets of `GcType` continue into the array
    // field thanks to repr(C).
    #[repr(C)]
    pub(crate) struct TestType {
        pub ty: GcType,
        offsets: [usize; 4],
    }

    pub(crate) fn fixed_type(stride: usize, offsets: &[usize]) -> Box<TestType> {
        assert!(offsets.len() <= 4);
        let mut t = Box::new(TestType {
            ty: GcType {
                kind: kind::FIXED,
                type_obj: std::ptr::null_mut(),
                finalize: None,
                stride,
                count: offsets.len(),
                offsets: [],
            },
            offsets: [0; 4],
        });
        t.offsets[..offsets.len()].copy_from_slice(offsets);
        t
    }

    // === info word ===

    #[test]
    fn test_code_info() {
        let mut mem = vec![0u8; 256];
        let client = unsafe { init_code(mem.as_mut_ptr(), size_code(64, 2), 64, 2) };
        unsafe {
            assert!(is_code(client));
            assert_eq!(code_size(client), 64);
            assert_eq!((*code_refs(client)).ref_count, 2);
            assert_eq!((*code_refs(client)).reserved, client);
        }
    }

    #[test]
    fn test_finalized_bit() {
        let ty = fixed_type(16, &[]);
        let mut mem = vec![0u8; 64];
        let client = unsafe { init_obj(mem.as_mut_ptr(), &ty.ty, size_obj(&ty.ty)) };
        unsafe {
            assert!(!is_finalized(client));
            set_finalized(client);
            assert!(is_finalized(client));
            // Header pointer survives the flag.
            assert_eq!(header(client), &ty.ty as *const GcType);
            clear_finalized(client);
            assert!(!is_finalized(client));
        }
    }

    #[test]
    fn test_replace_header_preserves_flags() {
        let a = fixed_type(16, &[]);
        let b = fixed_type(16, &[0]);
        let mut mem = vec![0u8; 64];
        let client = unsafe { init_obj(mem.as_mut_ptr(), &a.ty, size_obj(&a.ty)) };
        unsafe {
            set_finalized(client);
            replace_header(client, &b.ty);
            assert!(is_finalized(client));
            assert_eq!(header(client), &b.ty as *const GcType);
        }
    }

    // === sizes and skipping ===

    #[test]
    fn test_obj_size() {
        let ty = fixed_type(24, &[]);
        let mut mem = vec![0u8; 64];
        let client = unsafe { init_obj(mem.as_mut_ptr(), &ty.ty, size_obj(&ty.ty)) };
        unsafe {
            assert_eq!(size(client), HEADER_SIZE + 24);
            assert_eq!(skip(client) as usize, client as usize + 24);
        }
    }

    #[test]
    fn test_array_size() {
        let ty = fixed_type(WORD_SIZE, &[0]);
        let mut mem = vec![0u8; 256];
        let sz = size_array(&ty.ty, 5);
        let client = unsafe { init_array(mem.as_mut_ptr(), &ty.ty, sz, 5) };
        unsafe {
            assert_eq!(size(client), HEADER_SIZE + ARRAY_HEADER_SIZE + 5 * WORD_SIZE);
            assert_eq!((*(client as *const ArrayHeader)).count, 5);
        }
    }

    #[test]
    fn test_weak_tagging() {
        let ty = fixed_type(WORD_SIZE, &[0]);
        let mut mem = vec![0u8; 256];
        let sz = size_array(&ty.ty, 3);
        let client = unsafe { init_weak_array(mem.as_mut_ptr(), &ty.ty, sz, 3) };
        unsafe {
            let weak = &mut *(client as *mut WeakHeader);
            assert_eq!(weak.count & 1, 1);
            assert_eq!(weak_count(weak), 3);
            assert_eq!(weak_splatted(weak), 0);
            weak_splat(weak);
            weak_splat(weak);
            assert_eq!(weak_splatted(weak), 2);
            assert_eq!(weak.splatted & 1, 1);
        }
    }

    // === padding and forwarders ===

    #[test]
    fn test_make_pad() {
        let mut mem = vec![0usize; 16];
        let base = mem.as_mut_ptr() as *mut u8;
        unsafe {
            let client = to_client(base);
            make_pad(client, 4 * WORD_SIZE);
            assert!(is_pad(client));
            assert_eq!(size(client), 4 * WORD_SIZE);

            make_pad(client, HEADER_SIZE);
            assert_eq!(size(client), HEADER_SIZE);
        }
    }

    #[test]
    fn test_fwd_preserves_size() {
        let ty = fixed_type(32, &[]);
        let mut mem = vec![0u8; 128];
        let client = unsafe { init_obj(mem.as_mut_ptr(), &ty.ty, size_obj(&ty.ty)) };
        let target = 0x1000 as *mut u8;
        unsafe {
            let before = size(client);
            make_fwd(client, target);
            assert_eq!(is_fwd(client), Some(target));
            assert_eq!(size(client), before);
        }
    }

    #[test]
    fn test_fwd1_small_object() {
        let ty = fixed_type(WORD_SIZE, &[]);
        let mut mem = vec![0u8; 64];
        let client = unsafe { init_obj(mem.as_mut_ptr(), &ty.ty, size_obj(&ty.ty)) };
        unsafe {
            make_fwd(client, 0x2000 as *mut u8);
            assert_eq!(header_kind(client), kind::FWD1);
            assert_eq!(is_fwd(client), Some(0x2000 as *mut u8));
        }
    }

    #[test]
    fn test_gc_type_fwd() {
        let mut mem = vec![0u8; 256];
        unsafe {
            let ty = init_gc_type(mem.as_mut_ptr(), 2);
            let client = ty as *mut u8;
            let before = size(client);
            make_fwd(client, 0x3000 as *mut u8);
            assert_eq!(header_kind(client), kind::GC_TYPE_FWD);
            assert_eq!(is_fwd(client), Some(0x3000 as *mut u8));
            // The descriptor keeps its stride/offsets while forwarding.
            assert_eq!(size(client), before);
            assert_eq!((*ty).count, 2);
        }
    }

    #[test]
    fn test_special_classification() {
        let ty = fixed_type(16, &[]);
        let mut mem = vec![0u8; 64];
        let client = unsafe { init_obj(mem.as_mut_ptr(), &ty.ty, size_obj(&ty.ty)) };
        unsafe {
            assert!(!is_special(client));
            make_fwd(client, 0x1000 as *mut u8);
            assert!(is_special(client));
        }
    }
}
