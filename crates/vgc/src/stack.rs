//! Stack scanning for the collectors.
//!
//! The threading runtime is out of scope here; it only has to expose the
//! set of stacks per OS thread through [`StackSource`]. Each stack is
//! either sleeping (a descriptor records the saved stack pointer) or the
//! one currently running on the thread, whose extent is taken from the
//! register state captured when the thread entered the arena.
//!
//! Every word of every live range is offered to the scanner, return
//! addresses included: on x86 an interior code pointer on the stack can
//! be the only reference keeping a code block alive.

use crate::fmt::{self, Scanner};
use vela_util::WORD_SIZE;

/// Saved context of a sleeping fiber: the lowest live stack address.
#[derive(Debug, Clone, Copy)]
pub struct StackDesc {
    pub low: usize,
}

/// One fiber stack tied to an OS thread.
#[derive(Debug, Default)]
pub struct FiberStack {
    /// Saved extent. `None` marks the fiber currently scheduled on the
    /// thread; its extent comes from the captured register state.
    pub desc: Option<StackDesc>,
    /// High end of the stack (x86 stacks grow toward lower addresses).
    pub limit: usize,
    /// The fiber takes part in a detour and is executed by another
    /// thread right now; it must not be scanned from here.
    pub detour_active: bool,
    /// Mid-initialization; contents are not sensible yet.
    pub initializing: bool,
    /// Detour stacks executed in place of this one, scanned with it.
    pub detours: Vec<FiberStack>,
}

/// All fiber stacks belonging to one OS thread.
#[derive(Debug, Default)]
pub struct ThreadStacks {
    /// The OS thread these fibers run on; used to find the register
    /// state captured for the running stack. `None` skips the running
    /// branch.
    pub thread: Option<std::thread::ThreadId>,
    pub stacks: Vec<FiberStack>,
}

/// Adapter the threading runtime implements so the collector can see
/// every fiber stack.
pub trait StackSource: Send {
    fn thread_stacks(&self) -> Vec<ThreadStacks>;
}

/// Callee-saved registers spilled into a stack-resident buffer when a
/// thread enters the arena, so references held only in registers are
/// visible to the conservative scan.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SpilledRegs {
    pub regs: [usize; 6],
    pub sp: usize,
}

impl SpilledRegs {
    /// Capture the callee-saved register file and the stack pointer.
    #[cfg(target_arch = "x86_64")]
    #[inline(never)]
    pub fn capture() -> SpilledRegs {
        let mut out = SpilledRegs::default();
        unsafe {
            std::arch::asm!(
                "mov [{0}], rbx",
                "mov [{0} + 8], rbp",
                "mov [{0} + 16], r12",
                "mov [{0} + 24], r13",
                "mov [{0} + 32], r14",
                "mov [{0} + 40], r15",
                "mov [{0} + 48], rsp",
                in(reg) &mut out as *mut SpilledRegs,
                options(nostack)
            );
        }
        out
    }

    /// Portable fallback: callers spill registers by virtue of the call
    /// itself; the stack pointer is approximated by a local.
    #[cfg(not(target_arch = "x86_64"))]
    #[inline(never)]
    pub fn capture() -> SpilledRegs {
        let probe = 0usize;
        SpilledRegs {
            regs: [0; 6],
            sp: &probe as *const usize as usize,
        }
    }

    /// The register values as words, for ambiguous scanning.
    pub fn words(&self) -> &[usize] {
        &self.regs
    }
}

/// Approximate stack pointer of the calling thread.
#[inline(never)]
pub fn approx_sp() -> usize {
    let probe = 0usize;
    &probe as *const usize as usize
}

/// Compute the byte ranges to scan for one thread's stacks.
///
/// `running_low` is the lowest stack address observed for the thread at
/// arena entry. Exactly one stack per thread is expected to have no
/// descriptor (the running one); if none does, the thread is mid
/// context-switch and every stack already carries a valid descriptor.
pub fn thread_scan_ranges(set: &ThreadStacks, running_low: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut running_limit: Option<usize> = None;

    for first in &set.stacks {
        // Used as a detour target by another thread; not ours to scan.
        if first.detour_active {
            continue;
        }

        let mut chain = std::iter::once(first)
            .chain(first.detours.iter())
            .collect::<Vec<_>>();
        for stack in chain.drain(..) {
            if stack.initializing {
                continue;
            }
            match stack.desc {
                None => {
                    debug_assert!(
                        running_limit.is_none(),
                        "two running stacks on one thread"
                    );
                    running_limit = Some(stack.limit);
                }
                Some(desc) => {
                    if desc.low < stack.limit {
                        ranges.push((desc.low, stack.limit));
                    }
                }
            }
        }
    }

    // No running stack: the thread is in the middle of a fiber switch
    // and everything was scanned through descriptors already.
    if let Some(limit) = running_limit {
        if running_low < limit {
            ranges.push((running_low, limit));
        }
    }

    ranges
}

/// Offer every word of `[low, high)` to the scanner.
///
/// # Safety
/// The range must be readable memory; slots may be rewritten by the
/// scanner.
pub unsafe fn scan_range<S: Scanner>(s: &mut S, low: usize, high: usize) -> Result<(), S::Error> {
    fmt::scan_array(s, low as *mut u8, (high - low) / WORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeping(low: usize, limit: usize) -> FiberStack {
        FiberStack {
            desc: Some(StackDesc { low }),
            limit,
            ..Default::default()
        }
    }

    #[test]
    fn test_sleeping_stacks_use_descriptor() {
        let set = ThreadStacks {
            thread: None,
            stacks: vec![sleeping(0x1000, 0x2000), sleeping(0x5000, 0x6000)],
        };
        let ranges = thread_scan_ranges(&set, 0x9000);
        assert_eq!(ranges, vec![(0x1000, 0x2000), (0x5000, 0x6000)]);
    }

    #[test]
    fn test_running_stack_uses_captured_sp() {
        let running = FiberStack {
            desc: None,
            limit: 0x8000,
            ..Default::default()
        };
        let set = ThreadStacks {
            thread: None,
            stacks: vec![sleeping(0x1000, 0x2000), running],
        };
        let ranges = thread_scan_ranges(&set, 0x7800);
        assert_eq!(ranges, vec![(0x1000, 0x2000), (0x7800, 0x8000)]);
    }

    #[test]
    fn test_mid_switch_skips_running_branch() {
        let set = ThreadStacks {
            thread: None,
            stacks: vec![sleeping(0x1000, 0x2000)],
        };
        let ranges = thread_scan_ranges(&set, 0x7800);
        assert_eq!(ranges, vec![(0x1000, 0x2000)]);
    }

    #[test]
    fn test_detour_active_is_skipped() {
        let mut host = sleeping(0x1000, 0x2000);
        host.detour_active = true;
        let set = ThreadStacks {
            thread: None,
            stacks: vec![host, sleeping(0x5000, 0x6000)],
        };
        let ranges = thread_scan_ranges(&set, 0x9000);
        assert_eq!(ranges, vec![(0x5000, 0x6000)]);
    }

    #[test]
    fn test_detour_chain_scanned_with_host() {
        let mut host = sleeping(0x1000, 0x2000);
        host.detours.push(sleeping(0x3000, 0x4000));
        let set = ThreadStacks {
            thread: None,
            stacks: vec![host],
        };
        let ranges = thread_scan_ranges(&set, 0x9000);
        assert_eq!(ranges, vec![(0x1000, 0x2000), (0x3000, 0x4000)]);
    }

    #[test]
    fn test_initializing_stack_ignored() {
        let mut init = sleeping(0, 0);
        init.initializing = true;
        let set = ThreadStacks {
            thread: None,
            stacks: vec![init, sleeping(0x5000, 0x6000)],
        };
        let ranges = thread_scan_ranges(&set, 0x9000);
        assert_eq!(ranges, vec![(0x5000, 0x6000)]);
    }

    #[test]
    fn test_capture_spilled_regs() {
        let spilled = SpilledRegs::capture();
        assert_ne!(spilled.sp, 0);
        assert_eq!(spilled.words().len(), 6);
    }
}
