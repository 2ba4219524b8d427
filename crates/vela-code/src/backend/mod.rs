//! Target backends.
//!
//! A backend lowers a machine-independent listing in a fixed order of
//! passes and encodes the result into bytes plus reference-trailer
//! entries. Two targets are provided: x86-64 (System V) and x86-32
//! (cdecl).

pub mod x64;
pub mod x86;

use crate::error::Result;
use crate::listing::Listing;
use crate::output::EncodedCode;

pub trait Backend {
    /// Human-readable target name.
    fn name(&self) -> &'static str;

    /// Does this target use 64-bit pointers?
    fn ptr64(&self) -> bool;

    /// Rewrite `src` into a lower-level listing of the same meaning:
    /// target-specific splits, operand legalization, then parameter and
    /// frame materialization.
    fn transform(&self, src: &Listing) -> Result<Listing>;

    /// Encode a fully lowered listing.
    fn encode(&self, src: &Listing) -> Result<EncodedCode>;
}

/// The backend matching the host pointer width.
pub fn native() -> Box<dyn Backend> {
    #[cfg(target_pointer_width = "64")]
    {
        Box::new(x64::X64Backend::new())
    }
    #[cfg(target_pointer_width = "32")]
    {
        Box::new(x86::X86Backend::new())
    }
}
