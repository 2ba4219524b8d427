//! Shared low-level utilities for the Vela substrate crates.
//!
//! Alignment math and atomic helpers used by both the garbage collector
//! and the code generator. Kept dependency-free so the substrate crates
//! can share it without pulling anything else in.

pub mod alignment;
pub mod atomic;

pub use alignment::{align_down, align_up, is_aligned};

/// Size of a machine word on this host.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Common byte-size constants.
pub mod constants {
    /// 1 Kilobyte
    pub const KB: usize = 1024;
    /// 1 Megabyte
    pub const MB: usize = 1024 * 1024;
    /// 1 Gigabyte
    pub const GB: usize = 1024 * 1024 * 1024;
}
