//! Weak array semantics: dead referents splat to null and bump the
//! splat counter; live referents survive and follow moves.

use vgc::fmt;
use vgc::{Arena, CollectorKind, GcConfig};

fn precise_arena(kind: CollectorKind) -> Arena {
    let config = GcConfig {
        collector: kind,
        conservative_stacks: false,
        ..Default::default()
    };
    Arena::new(config).unwrap()
}

unsafe fn weak_slots(weak: *mut u8) -> *mut *mut u8 {
    weak.add(fmt::ARRAY_HEADER_SIZE) as *mut *mut u8
}

unsafe fn splat_count(weak: *mut u8) -> usize {
    fmt::weak_splatted(&*(weak as *const fmt::WeakHeader))
}

fn weak_splat_scenario(kind: CollectorKind) {
    let arena = precise_arena(kind);
    arena.attach_thread();

    let ty = arena.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 32, &[]);

    // Weak array of length 3 holding one reference to an otherwise
    // unreachable, finalizer-less object.
    let weak = arena.alloc_weak_array(3).unwrap();
    let doomed = arena.alloc(ty).unwrap();
    unsafe {
        *weak_slots(weak) = doomed;
    }

    let mut slot = weak;
    let root = arena.create_root(&mut slot, 1, false).unwrap();

    arena.collect();

    unsafe {
        let weak_now = slot;
        assert!((*weak_slots(weak_now)).is_null(), "dead slot must splat");
        assert!(splat_count(weak_now) >= 1, "splat counter must advance");
        // Raw tagged field stays odd.
        let header = &*(weak_now as *const fmt::WeakHeader);
        assert_eq!(header.splatted & 1, 1);
        assert_eq!(fmt::weak_count(header), 3);
    }

    arena.destroy_root(root).unwrap();
    arena.detach_thread();
}

#[test]
fn weak_splat_copying() {
    weak_splat_scenario(CollectorKind::Copying);
}

#[test]
fn weak_splat_marksweep() {
    weak_splat_scenario(CollectorKind::MarkSweep);
}

#[test]
fn weak_keeps_strongly_held_referents() {
    let arena = precise_arena(CollectorKind::Copying);
    arena.attach_thread();

    let ty = arena.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 32, &[]);
    let weak = arena.alloc_weak_array(2).unwrap();
    let kept = arena.alloc(ty).unwrap();
    unsafe {
        *(kept as *mut usize) = 0x5EED;
        *weak_slots(weak) = kept;
    }

    let mut roots = [weak, kept];
    let root = arena.create_root(roots.as_mut_ptr(), 2, false).unwrap();

    arena.collect();

    unsafe {
        let weak_now = roots[0];
        let kept_now = roots[1];
        // The weak slot follows the move instead of splatting.
        assert_eq!(*weak_slots(weak_now), kept_now);
        assert_eq!(*(kept_now as *const usize), 0x5EED);
        assert_eq!(splat_count(weak_now), 0);
    }

    arena.destroy_root(root).unwrap();
    arena.detach_thread();
}

#[test]
fn weak_does_not_keep_objects_alive() {
    let arena = precise_arena(CollectorKind::MarkSweep);
    arena.attach_thread();

    // Two weak arrays referencing each other's doomed cargo: nothing
    // here is strongly reachable except the arrays themselves.
    let ty = arena.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 16, &[]);
    let a = arena.alloc_weak_array(1).unwrap();
    let b = arena.alloc_weak_array(1).unwrap();
    unsafe {
        *weak_slots(a) = arena.alloc(ty).unwrap();
        *weak_slots(b) = arena.alloc(ty).unwrap();
    }

    let mut roots = [a, b];
    let root = arena.create_root(roots.as_mut_ptr(), 2, false).unwrap();

    arena.collect();

    unsafe {
        assert!((*weak_slots(roots[0])).is_null());
        assert!((*weak_slots(roots[1])).is_null());
    }

    arena.destroy_root(root).unwrap();
    arena.detach_thread();
}
