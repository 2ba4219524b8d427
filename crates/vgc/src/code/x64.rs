//! x86-64 specifics of the code bridge.
//!
//! A process-local side table tracks which code blocks carry unwind
//! information and where it lives inside the blob, re-keyed whenever a
//! block moves and dropped when a block dies.
//!
//! This is bookkeeping only: the OS-level registration a 64-bit Windows
//! unwinder would need (`RtlAddFunctionTable`/`RtlDeleteFunctionTable`)
//! is not performed, and no `eh_frame` data is registered elsewhere.
//! The runtime exception path for generated code lives in the code
//! generator's protected-call mechanism, which never asks the platform
//! unwinder to step a generated frame; embedders that need the OS
//! integration can drive it from this table.

#![cfg_attr(not(target_pointer_width = "64"), allow(dead_code))]

use super::GcCodeRef;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Registered unwind entries: code client pointer -> offset of the
/// unwind data inside the blob.
static UNWIND_TABLE: Lazy<Mutex<FxHashMap<usize, usize>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Track (or re-track after a move) the unwind information of `code`.
/// The entry's `offset` locates the unwind data in the blob.
pub(super) fn update_unwind(code: *mut u8, r: &GcCodeRef) {
    let mut table = UNWIND_TABLE.lock();
    table.insert(code as usize, r.offset);
    log::trace!(
        "tracking unwind info for block {:p} at offset {}",
        code,
        r.offset
    );
}

/// Is an unwind entry tracked for `code`? Used by tests and by the
/// collectors' consistency checks.
pub fn has_unwind(code: *const u8) -> bool {
    UNWIND_TABLE.lock().contains_key(&(code as usize))
}

pub(super) fn need_finalization() -> bool {
    true
}

pub(super) unsafe fn finalize(code: *mut u8) {
    UNWIND_TABLE.lock().remove(&(code as usize));
}
