//! x86-32 specifics of the code bridge.
//!
//! On 32-bit Windows the exception path is the per-frame SEH chain that
//! generated prologs push themselves, so there is no per-block side
//! table to maintain and nothing to finalize.

#![cfg_attr(not(target_pointer_width = "32"), allow(dead_code))]

use super::GcCodeRef;

pub(super) fn update_unwind(code: *mut u8, r: &GcCodeRef) {
    // SEH frames live on the stack, not in a table; nothing to do here.
    let _ = (code, r);
}

pub(super) fn need_finalization() -> bool {
    false
}

pub(super) unsafe fn finalize(code: *mut u8) {
    let _ = code;
}
