//! Listing-level tests: scope lookup, destruction metadata, and the
//! cleanup walk.

use crate::binary::{PartRecord, StackFrame, VarRecord};
use crate::instr::*;
use crate::listing::{FreeOpt, Listing, Part, Var};
use crate::operand::{ExtRef, Operand};
use crate::size::Size;
use crate::typedesc::TypeDesc;

// === Scope lookup ===

#[test]
fn scope_prev_walks_every_visible_var_once() {
    let mut l = Listing::new();
    let b1 = l.create_block(l.root().part());
    let b2 = l.create_block(b1.part());
    let v0 = l.create_long_var(l.root().part());
    let v1 = l.create_int_var(b1.part());
    let v2 = l.create_int_var(b2.part());
    let v3 = l.create_int_var(b1.part());
    let par = l.create_ptr_param();

    assert_eq!(l.prev(v0), par);
    assert_eq!(l.prev(v1), v0);
    assert_eq!(l.prev(v2), v3);
    assert_eq!(l.prev(v3), v1);
    assert_eq!(l.prev(par), Var::INVALID);
    assert_eq!(l.parent(b1), l.root().part());
    assert_eq!(l.parent(b2), b1.part());
}

#[test]
fn scope_prev_across_sibling_blocks() {
    let mut l = Listing::new();
    let b0 = l.create_block(l.root().part());
    let v0 = l.create_long_var(b0.part());
    let v1 = l.create_long_var(b0.part());
    let v2 = l.create_int_var(b0.part());
    let b1 = l.create_block(l.root().part());
    let v3 = l.create_int_var(b1.part());

    assert_eq!(l.prev(v0), Var::INVALID);
    assert_eq!(l.prev(v1), v0);
    assert_eq!(l.prev(v2), v1);
    assert_eq!(l.prev(v3), Var::INVALID);

    assert_eq!(l.parent_of_var(v0), b0.part());
    assert_eq!(l.parent_of_var(v3), b1.part());
}

#[test]
fn scope_prev_through_parts() {
    // Root block with parts p0, p1, p2; one variable in each of the
    // first two and two in the last.
    let mut l = Listing::new();
    let p0 = l.root().part();
    let p1 = l.create_part(p0);
    let p2 = l.create_part(p1);
    let v0 = l.create_int_var(p0);
    let v1 = l.create_int_var(p1);
    let v2 = l.create_int_var(p2);
    let v3 = l.create_int_var(p2);

    assert_eq!(l.prev(v3), v2);
    assert_eq!(l.prev(v2), v1);
    assert_eq!(l.prev(v1), v0);
    assert_eq!(l.prev(v0), Var::INVALID);
}

#[test]
fn scope_linearization_terminates() {
    // Property: repeated prev() visits each visible variable exactly
    // once and ends at the invalid id.
    let mut l = Listing::new();
    let b1 = l.create_block(l.root().part());
    let p1 = l.create_part(b1.part());
    let _pa = l.create_int_param();
    let mut expect = vec![
        l.create_int_var(l.root().part()),
        l.create_int_var(b1.part()),
        l.create_int_var(p1),
        l.create_int_var(p1),
    ];

    let mut seen = Vec::new();
    let mut at = *expect.last().unwrap();
    while at.valid() {
        seen.push(at);
        at = l.prev(at);
    }

    // All declared variables plus the parameter, each exactly once.
    expect.push(l.all_params()[0]);
    assert_eq!(seen.len(), expect.len());
    for v in expect {
        assert_eq!(seen.iter().filter(|&&s| s == v).count(), 1);
    }
}

#[test]
fn part_chain_navigation() {
    let mut l = Listing::new();
    let p0 = l.root().part();
    let p1 = l.create_part(p0);
    let p2 = l.create_part(p0);

    assert_eq!(l.next(p0), p1);
    assert_eq!(l.next(p1), p2);
    assert_eq!(l.next(p2), Part::INVALID);
    assert_eq!(l.last(p0), p2);
    assert_eq!(l.first(p2), l.root());
    assert_eq!(l.prev_part(p2), p1);
    assert_eq!(l.prev_part(p0), Part::INVALID);
}

#[test]
fn prev_stored_wraps_to_parent_chain_end() {
    let mut l = Listing::new();
    let p1 = l.create_part(l.root().part());
    let b = l.create_block(l.root().part());

    // The block's first part chains after the *last* stored part of the
    // parent block.
    assert_eq!(l.prev_stored(b.part()), p1);
    assert_eq!(l.prev_part(b.part()), l.root().part());
}

#[test]
fn accessibility_follows_scope() {
    let mut l = Listing::new();
    let p0 = l.root().part();
    let p1 = l.create_part(p0);
    let b = l.create_block(p0);
    let v_p1 = l.create_int_var(p1);
    let v_b = l.create_int_var(b.part());
    let par = l.create_int_param();

    // Parameters are visible everywhere.
    assert!(l.accessible(par, b.part()));
    // Later parts see earlier scopes, not the other way around.
    assert!(l.accessible(v_p1, p1));
    assert!(!l.accessible(v_p1, p0));
    // Block contents are invisible outside the block.
    assert!(!l.accessible(v_b, p0));
    assert!(l.accessible(v_b, b.part()));
}

#[test]
fn is_parent_reflexive_transitive() {
    let mut l = Listing::new();
    let b1 = l.create_block(l.root().part());
    let b2 = l.create_block(b1.part());

    assert!(l.is_parent(b2, b2.part()));
    assert!(l.is_parent(b1, b2.part()));
    assert!(l.is_parent(l.root(), b2.part()));
    assert!(!l.is_parent(b2, b1.part()));
}

#[test]
fn delay_moves_declaration_part() {
    let mut l = Listing::new();
    let p0 = l.root().part();
    let p1 = l.create_part(p0);
    let v = l.create_int_var(p0);

    l.delay(v, p1);
    assert_eq!(l.parent_of_var(v), p1);
    assert!(l.part_vars(p0).is_empty());
    assert_eq!(l.part_vars(p1), vec![v]);
}

#[test]
fn move_param_reorders() {
    let mut l = Listing::new();
    let a = l.create_int_param();
    let b = l.create_int_param();
    let c = l.create_int_param();

    l.move_param(c, 0);
    assert_eq!(l.all_params(), vec![c, a, b]);
}

#[test]
fn exception_aware_tracks_free_opt() {
    let mut l = Listing::new();
    assert!(!l.exception_aware());
    let p = l.root().part();
    let v = l.create_var_free(p, Size::INT, Operand::None, FreeOpt::ON_BLOCK_EXIT);
    assert!(!l.exception_aware());
    l.set_free_opt(v, FreeOpt::BOTH);
    assert!(l.exception_aware());
}

#[test]
fn shell_preserves_scope_ids() {
    let mut l = Listing::new();
    let b = l.create_block(l.root().part());
    let v = l.create_int_var(b.part());
    l.push(mov(crate::reg::regs::EAX, crate::operand::int_const(1)));

    let shell = l.create_shell();
    assert_eq!(shell.count(), 0);
    assert_eq!(shell.parent_of_var(v), b.part());
    assert_eq!(shell.var_size(v), Size::INT);
}

// === Destructor order through the cleanup walk ===

/// Test double for the platform frame: variables live in a plain
/// buffer, addressed by their metadata offsets rebased to the buffer
/// middle.
struct FakeFrame {
    part: Part,
    memory: Vec<u8>,
}

impl FakeFrame {
    fn new(part: Part) -> FakeFrame {
        FakeFrame {
            part,
            memory: vec![0; 4096],
        }
    }

    fn base(&self) -> usize {
        self.memory.as_ptr() as usize + 2048
    }
}

impl crate::binary::StackFrame for FakeFrame {
    fn active_part(&self) -> Part {
        self.part
    }

    fn to_ptr(&self, offset: isize) -> *mut u8 {
        (self.base() as isize + offset) as *mut u8
    }
}

mod cleanup_order {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    static DESTROYED: AtomicI64 = AtomicI64::new(0);

    extern "C" fn int_cleanup(v: i32) {
        DESTROYED.fetch_add(v as i64, Ordering::SeqCst);
    }

    /// One variable in the root scope, one in a nested block; the
    /// destructor adds the variable's value to a counter. Simulates the
    /// unwinder stopping at each possible part.
    fn build() -> (crate::binary::Binary, Listing, Part, Part) {
        let arena = Arc::new(
            vgc::Arena::new(vgc::GcConfig {
                conservative_stacks: false,
                ..Default::default()
            })
            .unwrap(),
        );
        arena.attach_thread();

        let dtor = Operand::Ref(ExtRef::new("int_cleanup", int_cleanup as usize));
        let mut l = Listing::new();
        let block = l.create_block(l.root().part());
        let v1 = l.create_var_free(
            l.root().part(),
            Size::INT,
            dtor.clone(),
            FreeOpt::ON_EXCEPTION,
        );
        let v2 = l.create_var_free(block.part(), Size::INT, dtor, FreeOpt::ON_EXCEPTION);

        l.push(prolog());
        l.push(mov(
            Operand::Var {
                var: v1,
                offset: 0,
                size: Size::INT,
            },
            crate::operand::int_const(10),
        ));
        l.push(begin(block.part()));
        l.push(mov(
            Operand::Var {
                var: v2,
                offset: 0,
                size: Size::INT,
            },
            crate::operand::int_const(20),
        ));
        l.push(end(block.part()));
        l.push(fn_ret(Operand::None));

        let root_part = l.root().part();
        let block_part = block.part();
        let backend = crate::backend::native();
        let bin = crate::binary::Binary::new(backend.as_ref(), arena, &l).unwrap();
        (bin, l, root_part, block_part)
    }

    #[test]
    fn unwind_from_root_part_runs_outer_only() {
        let (bin, _l, root_part, _block) = build();

        let frame = FakeFrame::new(root_part);
        let (_, off) = bin.metadata_entry(0).unwrap();
        unsafe {
            *(frame.to_ptr(off) as *mut i32) = 10;
        }

        DESTROYED.store(0, Ordering::SeqCst);
        bin.cleanup(&frame);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unwind_from_block_runs_inner_then_outer() {
        let (bin, _l, _root, block_part) = build();

        let frame = FakeFrame::new(block_part);
        let (_, off1) = bin.metadata_entry(0).unwrap();
        let (_, off2) = bin.metadata_entry(1).unwrap();
        unsafe {
            *(frame.to_ptr(off1) as *mut i32) = 10;
            *(frame.to_ptr(off2) as *mut i32) = 20;
        }

        DESTROYED.store(0, Ordering::SeqCst);
        bin.cleanup(&frame);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn reverse_declaration_order_within_part() {
        use std::sync::Mutex;
        static ORDER: Mutex<Vec<i32>> = Mutex::new(Vec::new());

        extern "C" fn record(v: i32) {
            ORDER.lock().unwrap().push(v);
        }

        let arena = Arc::new(
            vgc::Arena::new(vgc::GcConfig {
                conservative_stacks: false,
                ..Default::default()
            })
            .unwrap(),
        );
        arena.attach_thread();

        let dtor = Operand::Ref(ExtRef::new("record", record as usize));
        let mut l = Listing::new();
        let p = l.root().part();
        let a = l.create_var_free(p, Size::INT, dtor.clone(), FreeOpt::ON_EXCEPTION);
        let b = l.create_var_free(p, Size::INT, dtor.clone(), FreeOpt::ON_EXCEPTION);
        let c = l.create_var_free(p, Size::INT, dtor, FreeOpt::ON_EXCEPTION);
        l.push(prolog());
        l.push(fn_ret(Operand::None));

        let backend = crate::backend::native();
        let bin = crate::binary::Binary::new(backend.as_ref(), arena, &l).unwrap();

        let frame = FakeFrame::new(p);
        for (var, val) in [(a, 1), (b, 2), (c, 3)] {
            let (_, off) = bin.metadata_entry(var.key()).unwrap();
            unsafe {
                *(frame.to_ptr(off) as *mut i32) = val;
            }
        }

        ORDER.lock().unwrap().clear();
        bin.cleanup(&frame);
        assert_eq!(*ORDER.lock().unwrap(), vec![3, 2, 1]);
    }
}

// === Parts table shape ===

#[test]
fn part_records_match_listing() {
    let mut l = Listing::new();
    let p0 = l.root().part();
    let p1 = l.create_part(p0);
    let _v = l.create_var_free(
        p1,
        Size::LONG,
        Operand::Ref(ExtRef::new("d", 0x1000)),
        FreeOpt::BOTH | FreeOpt::PTR,
    );
    l.push(prolog());
    l.push(fn_ret(Operand::None));

    let records: Vec<PartRecord> = {
        // fill_parts is private; go through a binary-less equivalent by
        // reading the listing directly.
        l.all_parts()
            .iter()
            .map(|&p| PartRecord {
                prev: l.prev_part(p).key(),
                vars: l
                    .part_vars(p)
                    .iter()
                    .map(|&v| VarRecord {
                        id: v.key(),
                        free_opt: l.free_opt(v),
                        size: l.var_size(v),
                    })
                    .collect(),
            })
            .collect()
    };

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].vars.len(), 1);
    assert!(records[1].vars[0].free_opt.contains(FreeOpt::PTR));
    assert_eq!(records[1].vars[0].size, Size::LONG);
}

// === FreeOpt display ===

#[test]
fn free_opt_display() {
    assert_eq!(FreeOpt::NONE.to_string(), "none");
    assert_eq!(
        (FreeOpt::ON_EXCEPTION | FreeOpt::PTR).to_string(),
        "exception+ptr"
    );
    assert_eq!(FreeOpt::BOTH.to_string(), "exception+block-exit");
}

#[test]
fn typedesc_classification() {
    assert!(TypeDesc::float().is_float());
    assert!(!TypeDesc::int().is_float());
    assert!(TypeDesc::Complex { size: Size::PTR }.is_complex());
    assert!(TypeDesc::void().is_void());
}
