//! # VGC - Garbage collection substrate for the Vela platform
//!
//! One arena owns a garbage-collected heap behind a pluggable collector
//! (copying, mark-sweep, or plain bump allocation), together with the
//! object format every collector shares.
//!
//! ## Object format
//!
//! Every allocation carries a one-word header in front of the client
//! pointer. The header distinguishes regular objects (described by a
//! [`fmt::GcType`]), executable code blocks with a typed reference
//! trailer, forwarders left behind by moved objects, padding, arrays and
//! weak arrays. See [`fmt`] for the encoding.
//!
//! ## Quick start
//!
//! ```no_run
//! use vgc::{Arena, GcConfig};
//!
//! fn main() -> Result<(), vgc::GcError> {
//!     let arena = Arena::new(GcConfig::default())?;
//!     arena.attach_thread();
//!
//!     // Describe a two-word object whose first word is a pointer.
//!     let ty = arena.alloc_type(vgc::fmt::kind::FIXED, std::ptr::null_mut(), 16, &[0]);
//!     let obj = arena.alloc(ty)?;
//!
//!     // Keep it reachable across collections.
//!     let mut slot = obj;
//!     let root = arena.create_root(&mut slot, 1, false)?;
//!
//!     arena.collect();
//!
//!     arena.destroy_root(root)?;
//!     arena.detach_thread();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`fmt`]: object header encoding and the scanning engine
//! - [`code`]: code allocations, reference trailers, pointer fixup
//! - [`arena`]: the public collector interface
//! - [`collector`]: the three collector implementations
//! - [`stack`]: conservative stack scanning and the fiber adapter
//! - [`watch`]: location-dependent watches over the move history
//! - [`summary`]: memory accounting snapshots

pub mod arena;
pub mod code;
pub mod collector;
pub mod config;
pub mod error;
mod finalizer;
pub mod fmt;
pub mod roots;
pub mod stack;
pub mod summary;
pub mod vm;
pub mod watch;

pub use arena::{Arena, RampAlloc};
pub use config::{CollectorKind, GcConfig};
pub use error::{GcError, Result};
pub use roots::Root;
pub use summary::MemorySummary;
pub use watch::Watch;

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
