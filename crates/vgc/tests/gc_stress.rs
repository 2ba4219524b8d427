//! Stress: random allocation and root churn across many cycles.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vgc::fmt;
use vgc::{Arena, CollectorKind, GcConfig};

fn stress(kind: CollectorKind, seed: u64) {
    let arena = Arena::new(GcConfig {
        collector: kind,
        conservative_stacks: false,
        max_heap_size: 64 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    arena.attach_thread();

    let mut rng = StdRng::seed_from_u64(seed);
    let sizes = [16usize, 24, 64, 200, 1024];
    let types: Vec<_> = sizes
        .iter()
        .map(|&s| arena.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), s, &[]))
        .collect();

    // A rooted table of survivors, randomly overwritten.
    let mut survivors: Vec<*mut u8> = vec![std::ptr::null_mut(); 64];
    let root = arena
        .create_root(survivors.as_mut_ptr(), survivors.len(), false)
        .unwrap();

    for round in 0..20 {
        for _ in 0..500 {
            let ti = rng.gen_range(0..types.len());
            let obj = arena.alloc(types[ti]).unwrap();
            unsafe {
                *(obj as *mut usize) = sizes[ti];
            }
            if rng.gen_bool(0.1) {
                let slot = rng.gen_range(0..survivors.len());
                survivors[slot] = obj;
            }
        }

        arena.collect();

        // Every survivor still carries the size stamp of its type.
        for &s in survivors.iter() {
            if s.is_null() {
                continue;
            }
            unsafe {
                let stamp = *(s as *const usize);
                assert!(sizes.contains(&stamp), "corrupt survivor in round {}", round);
            }
        }
    }

    arena.destroy_root(root).unwrap();
    arena.detach_thread();
}

#[test]
fn stress_copying() {
    stress(CollectorKind::Copying, 0x5EED);
}

#[test]
fn stress_marksweep() {
    stress(CollectorKind::MarkSweep, 0x5EED);
}

#[test]
fn stress_bump_never_reclaims() {
    let arena = Arena::new(GcConfig {
        collector: CollectorKind::Bump,
        max_heap_size: 64 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    arena.attach_thread();

    let ty = arena.alloc_type(fmt::kind::FIXED, std::ptr::null_mut(), 64, &[]);
    let mut objs = Vec::new();
    for i in 0..1000usize {
        let obj = arena.alloc(ty).unwrap();
        unsafe { *(obj as *mut usize) = i };
        objs.push(obj);
    }

    arena.collect();

    // Nothing is reclaimed and nothing moves.
    for (i, &obj) in objs.iter().enumerate() {
        unsafe {
            assert_eq!(*(obj as *const usize), i);
        }
    }

    arena.detach_thread();
}
