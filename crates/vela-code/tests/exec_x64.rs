//! End-to-end execution on the x86-64 backend: listings are lowered,
//! encoded into collector-owned memory, and called through function
//! pointers.
#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::Arc;
use vela_code::backend::x64::X64Backend;
use vela_code::instr::*;
use vela_code::operand::{int_const, long_const, nat_const, ExtRef, Operand};
use vela_code::reg::regs;
use vela_code::{Binary, CondFlag, FreeOpt, Listing, Size, TypeDesc, Var};

fn arena() -> Arc<vgc::Arena> {
    let a = Arc::new(
        vgc::Arena::new(vgc::GcConfig {
            conservative_stacks: false,
            ..Default::default()
        })
        .unwrap(),
    );
    a.attach_thread();
    a
}

fn build(arena: &Arc<vgc::Arena>, l: &Listing) -> Binary {
    Binary::new(&X64Backend::new(), arena.clone(), l).unwrap()
}

fn var(v: Var, size: Size) -> Operand {
    Operand::Var {
        var: v,
        offset: 0,
        size,
    }
}

#[test]
fn basic_int_increment() {
    // One Int parameter; v := p; v := v + 1; return v.
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let p = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::INT), var(p, Size::INT)));
    l.push(add(var(v, Size::INT), int_const(1)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(10), 11);
    assert_eq!(f(-3), -2);
    a.detach_thread();
}

#[test]
fn conditional_jump_selects_branch() {
    // return if p == 0 { 100 } else { 200 }
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let p = l.create_int_param();
    let v = l.create_int_var(l.root().part());
    let zero = l.label();
    let done = l.label();

    l.push(prolog());
    l.push(cmp(var(p, Size::INT), int_const(0)));
    l.push(jmp_cond(zero, CondFlag::Equal));
    l.push(mov(var(v, Size::INT), int_const(200)));
    l.push(jmp(done));
    l.push_label(zero);
    l.push(mov(var(v, Size::INT), int_const(100)));
    l.push_label(done);
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(0), 100);
    assert_eq!(f(7), 200);
    a.detach_thread();
}

#[test]
fn long_arithmetic() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::long());
    let p = l.create_long_param();
    let v = l.create_long_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::LONG), var(p, Size::LONG)));
    l.push(add(var(v, Size::LONG), long_const(0x9999_9999_99)));
    l.push(fn_ret(var(v, Size::LONG)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(0x77_7777_7777), 0x111_1111_1110);
    a.detach_thread();
}

#[test]
fn division_truncates_toward_zero() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let pa = l.create_int_param();
    let pb = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::INT), var(pa, Size::INT)));
    l.push(idiv(var(v, Size::INT), var(pb, Size::INT)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(-8, 2), -4);
    assert_eq!(f(-8, -2), 4);
    assert_eq!(f(7, 2), 3);
    a.detach_thread();
}

#[test]
fn modulo_follows_truncation() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let pa = l.create_int_param();
    let pb = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::INT), var(pa, Size::INT)));
    l.push(imod(var(v, Size::INT), var(pb, Size::INT)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(-18, 10), -8);
    assert_eq!(f(18, 10), 8);
    a.detach_thread();
}

#[test]
fn unsigned_division() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let pa = l.create_int_param();
    let pb = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::INT), var(pa, Size::INT)));
    l.push(udiv(var(v, Size::INT), var(pb, Size::INT)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(u32, u32) -> u32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(0xFFFF_FFFE, 2), 0x7FFF_FFFF);
    a.detach_thread();
}

#[test]
fn sign_extending_cast() {
    // icast Int -> Long keeps the sign.
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::long());
    let p = l.create_int_param();
    let v = l.create_long_var(l.root().part());

    l.push(prolog());
    l.push(icast(var(v, Size::LONG), var(p, Size::INT)));
    l.push(fn_ret(var(v, Size::LONG)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32) -> i64 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(-2), -2);
    assert_eq!(f(5), 5);
    a.detach_thread();
}

#[test]
fn zero_extending_cast() {
    // ucast Nat -> Word zero-extends.
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::long());
    let p = l.create_int_param();
    let v = l.create_long_var(l.root().part());

    l.push(prolog());
    l.push(ucast(var(v, Size::LONG), var(p, Size::INT)));
    l.push(fn_ret(var(v, Size::LONG)));

    let bin = build(&a, &l);
    let f: extern "C" fn(u32) -> u64 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(0xFF00_FF00), 0xFF00_FF00);
    a.detach_thread();
}

#[test]
fn multiplication_and_shift() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let p = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::INT), var(p, Size::INT)));
    l.push(mul(var(v, Size::INT), int_const(6)));
    l.push(shl(var(v, Size::INT), operand_byte(2)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(3), 3 * 6 * 4);
    a.detach_thread();
}

fn operand_byte(v: u8) -> Operand {
    vela_code::operand::byte_const(v)
}

extern "C" fn add_pair(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

#[test]
fn external_call_with_parameters() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let p = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(fn_param(TypeDesc::int(), var(p, Size::INT)));
    l.push(fn_param(TypeDesc::int(), int_const(32)));
    l.push(fn_call(
        Operand::Ref(ExtRef::new("add_pair", add_pair as usize)),
        TypeDesc::int(),
    ));
    l.push(mov(var(v, Size::INT), Operand::Reg(regs::EAX)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(10), 42);
    a.detach_thread();
}

#[test]
fn block_exit_runs_destructor() {
    use std::sync::atomic::{AtomicI32, Ordering};
    static SUM: AtomicI32 = AtomicI32::new(0);
    extern "C" fn note(v: i32) {
        SUM.fetch_add(v, Ordering::SeqCst);
    }

    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let block = l.create_block(l.root().part());
    let v = l.create_var_free(
        block.part(),
        Size::INT,
        Operand::Ref(ExtRef::new("note", note as usize)),
        FreeOpt::ON_BLOCK_EXIT,
    );

    l.push(prolog());
    l.push(begin(block.part()));
    l.push(mov(var(v, Size::INT), int_const(25)));
    l.push(end(block.part()));
    l.push(fn_ret(int_const(0)));

    let bin = build(&a, &l);
    let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(bin.address()) };
    SUM.store(0, Ordering::SeqCst);
    assert_eq!(f(), 0);
    assert_eq!(SUM.load(Ordering::SeqCst), 25);

    // Running again re-zeroes and re-fires.
    assert_eq!(f(), 0);
    assert_eq!(SUM.load(Ordering::SeqCst), 50);
    a.detach_thread();
}

#[test]
#[cfg(target_os = "linux")]
fn exception_cleanup_runs_destructors() {
    // Two exception-destroyed variables, one per scope, and a callee
    // that throws at a chosen call site. The throw is a real non-local
    // exit out of executing generated code; the destructors observed by
    // the counter run while the frame is still live.
    use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
    use vela_code::binary::unwind;

    static DESTROYED: AtomicI64 = AtomicI64::new(0);
    extern "C" fn int_cleanup(v: i32) {
        DESTROYED.fetch_add(v as i64, Ordering::SeqCst);
    }

    static THROW_AT: AtomicI32 = AtomicI32::new(0);
    extern "C" fn throw_error(point: i32) -> i32 {
        if point == THROW_AT.load(Ordering::SeqCst) {
            unsafe { unwind::raise(point as i64) }
        }
        point
    }

    let a = arena();
    let dtor = Operand::Ref(ExtRef::new("int_cleanup", int_cleanup as usize));
    let thrower = Operand::Ref(ExtRef::new("throw_error", throw_error as usize));

    let mut l = Listing::with_result(false, TypeDesc::int());
    let block = l.create_block(l.root().part());
    let v1 = l.create_var_free(
        l.root().part(),
        Size::INT,
        dtor.clone(),
        FreeOpt::ON_EXCEPTION,
    );
    let v2 = l.create_var_free(block.part(), Size::INT, dtor, FreeOpt::ON_EXCEPTION);

    l.push(prolog());
    l.push(mov(var(v1, Size::INT), int_const(10)));
    l.push(fn_param(TypeDesc::int(), int_const(1)));
    l.push(fn_call(thrower.clone(), TypeDesc::int()));

    l.push(begin(block.part()));
    l.push(mov(var(v2, Size::INT), int_const(20)));
    l.push(fn_param(TypeDesc::int(), int_const(2)));
    l.push(fn_call(thrower.clone(), TypeDesc::int()));
    l.push(end(block.part()));

    l.push(fn_param(TypeDesc::int(), int_const(3)));
    l.push(fn_call(thrower, TypeDesc::int()));
    l.push(fn_ret(int_const(0)));

    let bin = build(&a, &l);

    for (at, expect) in [(1, 10), (2, 30), (3, 10), (4, 0)] {
        THROW_AT.store(at, Ordering::SeqCst);
        DESTROYED.store(0, Ordering::SeqCst);

        let result = bin.call_protected(0);
        if at == 4 {
            assert_eq!(result, Ok(0));
        } else {
            assert_eq!(result, Err(at as i64));
        }
        assert_eq!(
            DESTROYED.load(Ordering::SeqCst),
            expect,
            "destructors after throwing at point {}",
            at
        );
        // Every frame was either popped by an epilog or drained by the
        // raise.
        assert_eq!(unwind::depth(), 0);
    }

    a.detach_thread();
}

#[test]
#[cfg(target_os = "linux")]
fn raise_payload_crosses_nested_calls() {
    // The throw starts two generated frames deep; both frames' records
    // are drained and the payload arrives at the boundary.
    use std::sync::atomic::{AtomicI64, Ordering};
    use vela_code::binary::unwind;

    static DESTROYED: AtomicI64 = AtomicI64::new(0);
    extern "C" fn note(v: i32) {
        DESTROYED.fetch_add(v as i64, Ordering::SeqCst);
    }
    extern "C" fn always_throw(_: i32) -> i32 {
        unsafe { unwind::raise(7) }
    }

    let a = arena();

    // Inner: v := 2, then throw.
    let mut inner = Listing::with_result(false, TypeDesc::int());
    let vi = inner.create_var_free(
        inner.root().part(),
        Size::INT,
        Operand::Ref(ExtRef::new("note", note as usize)),
        FreeOpt::ON_EXCEPTION,
    );
    inner.push(prolog());
    inner.push(mov(var(vi, Size::INT), int_const(2)));
    inner.push(fn_param(TypeDesc::int(), int_const(0)));
    inner.push(fn_call(
        Operand::Ref(ExtRef::new("always_throw", always_throw as usize)),
        TypeDesc::int(),
    ));
    inner.push(fn_ret(int_const(0)));
    let inner_bin = build(&a, &inner);

    // Outer: v := 1, then call the inner function.
    let mut outer = Listing::with_result(false, TypeDesc::int());
    let vo = outer.create_var_free(
        outer.root().part(),
        Size::INT,
        Operand::Ref(ExtRef::new("note", note as usize)),
        FreeOpt::ON_EXCEPTION,
    );
    outer.push(prolog());
    outer.push(mov(var(vo, Size::INT), int_const(1)));
    outer.push(fn_param(TypeDesc::int(), int_const(0)));
    outer.push(fn_call(
        Operand::Ref(ExtRef::new("inner", inner_bin.address() as usize)),
        TypeDesc::int(),
    ));
    outer.push(fn_ret(int_const(0)));
    let outer_bin = build(&a, &outer);

    DESTROYED.store(0, Ordering::SeqCst);
    let result = outer_bin.call_protected(0);
    assert_eq!(result, Err(7));
    // Inner (2) before outer (1), innermost first.
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 3);
    assert_eq!(unwind::depth(), 0);

    a.detach_thread();
}

#[test]
fn metadata_round_trip() {
    extern "C" fn dtor(_: i32) {}

    let a = arena();
    let mut l = Listing::new();
    let v = l.create_var_free(
        l.root().part(),
        Size::INT,
        Operand::Ref(ExtRef::new("dtor", dtor as usize)),
        FreeOpt::ON_EXCEPTION,
    );
    l.push(prolog());
    l.push(fn_ret(Operand::None));

    let bin = build(&a, &l);
    let (fn_ptr, offset) = bin.metadata_entry(v.key()).unwrap();
    assert_eq!(fn_ptr, dtor as usize);
    // Variables live below the frame pointer.
    assert!(offset < 0);
    a.detach_thread();
}

#[test]
fn code_survives_relocation_intact() {
    // Build, run, force a moving collection, run from the new address.
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let p = l.create_int_param();
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(fn_param(TypeDesc::int(), var(p, Size::INT)));
    l.push(fn_param(TypeDesc::int(), int_const(1)));
    l.push(fn_call(
        Operand::Ref(ExtRef::new("add_pair", add_pair as usize)),
        TypeDesc::int(),
    ));
    l.push(mov(var(v, Size::INT), Operand::Reg(regs::EAX)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let before = bin.address();
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(before) };
    assert_eq!(f(41), 42);

    a.collect();

    let after = bin.address();
    assert_ne!(before, after, "copying collection should move the block");
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(after) };
    assert_eq!(f(41), 42);
    assert_eq!(f(-1), 0);
    a.detach_thread();
}

#[test]
fn nat_constant_stores() {
    let a = arena();
    let mut l = Listing::with_result(false, TypeDesc::int());
    let v = l.create_int_var(l.root().part());

    l.push(prolog());
    l.push(mov(var(v, Size::INT), nat_const(0xDEAD_BEEF)));
    l.push(fn_ret(var(v, Size::INT)));

    let bin = build(&a, &l);
    let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(bin.address()) };
    assert_eq!(f(), 0xDEAD_BEEF);
    a.detach_thread();
}
