//! Bump collector: allocation without reclamation.
//!
//! The simplest implementation of the collector interface. Memory is
//! handed out linearly from chunks and never reclaimed; `collect` is a
//! no-op. Useful for short-lived processes and as the baseline the
//! tracing collectors are tested against.

use super::{CollectStats, CollectorImpl, Space, World};
use crate::error::Result;
use std::time::Duration;

pub struct Bump {
    space: Space,
}

impl Bump {
    pub fn new(chunk_size: usize, max_size: usize) -> Bump {
        Bump {
            space: Space::new(chunk_size, max_size),
        }
    }
}

impl CollectorImpl for Bump {
    fn reserve(&mut self, size: usize, exec: bool) -> Result<*mut u8> {
        self.space.reserve(size, exec)
    }

    fn should_collect(&self) -> bool {
        false
    }

    fn collect(&mut self, _world: &mut World) -> CollectStats {
        CollectStats {
            reclaimed: 0,
            live: self.space.allocated(),
            moved: 0,
        }
    }

    fn collect_budget(&mut self, _world: &mut World, _budget: Duration) -> bool {
        false
    }

    fn walk(&self, f: &mut dyn FnMut(*mut u8)) {
        self.space.walk_objects(f);
    }

    fn contains(&self, addr: usize) -> bool {
        self.space.contains(addr)
    }

    fn committed(&self) -> usize {
        self.space.committed()
    }

    fn allocated(&self) -> usize {
        self.space.allocated()
    }
}
