//! Collector configuration.

use crate::error::{GcError, Result};
use vela_util::constants::{KB, MB};

/// Which collector implementation backs the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    /// Tracing, moving collector. Compacts by copying into fresh chunks;
    /// ambiguous references pin objects in place.
    Copying,
    /// Tracing, non-moving mark-sweep collector.
    MarkSweep,
    /// Bump allocator. Never reclaims memory; `collect` is a no-op.
    Bump,
}

/// Configuration for an [`Arena`](crate::Arena).
///
/// # Examples
///
/// ```
/// use vgc::{CollectorKind, GcConfig};
///
/// let config = GcConfig {
///     collector: CollectorKind::MarkSweep,
///     max_heap_size: 64 * 1024 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Collector implementation to use.
    pub collector: CollectorKind,

    /// Initial arena size estimate in bytes. May be disregarded by the
    /// implementation if needed.
    pub initial_heap_size: usize,

    /// Hard limit for heap growth. Allocation fails with `OutOfHeap`
    /// beyond this.
    pub max_heap_size: usize,

    /// Size of each heap chunk handed to allocation points.
    pub chunk_size: usize,

    /// Size of a thread-local allocation point reservation.
    pub alloc_point_size: usize,

    /// How seldom the allocating thread drains the finalization queue.
    /// An interval of 500 means every 500 allocations.
    pub finalization_interval: usize,

    /// Collect when the live heap exceeds this fraction of committed
    /// memory.
    pub collect_threshold: f64,

    /// Scan attached thread stacks and spilled registers conservatively.
    /// Embedders that keep every reference in registered roots can turn
    /// this off for precise reclamation.
    pub conservative_stacks: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            collector: CollectorKind::Copying,
            initial_heap_size: 4 * MB,
            max_heap_size: 256 * MB,
            chunk_size: 256 * KB,
            alloc_point_size: 32 * KB,
            finalization_interval: 500,
            collect_threshold: 0.75,
            conservative_stacks: true,
        }
    }
}

impl GcConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_heap_size < self.initial_heap_size {
            return Err(GcError::Configuration(format!(
                "max_heap_size ({}) smaller than initial_heap_size ({})",
                self.max_heap_size, self.initial_heap_size
            )));
        }
        if !self.chunk_size.is_power_of_two() {
            return Err(GcError::Configuration(format!(
                "chunk_size ({}) must be a power of two",
                self.chunk_size
            )));
        }
        if self.alloc_point_size > self.chunk_size {
            return Err(GcError::Configuration(format!(
                "alloc_point_size ({}) larger than chunk_size ({})",
                self.alloc_point_size, self.chunk_size
            )));
        }
        if self.finalization_interval == 0 {
            return Err(GcError::Configuration(
                "finalization_interval must be nonzero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.collect_threshold) {
            return Err(GcError::Configuration(format!(
                "collect_threshold ({}) outside [0, 1]",
                self.collect_threshold
            )));
        }
        Ok(())
    }
}
