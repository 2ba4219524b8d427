//! 64-bit lowering for the 32-bit target.
//!
//! Every 8-byte operation is split into a pair of 32-bit operations on
//! the low and high halves. Registers holding 8-byte values are modeled
//! as pairs: a/d, b/si, c/di. Multiplication, division and wide shifts
//! have no short instruction sequence and fall back to runtime helper
//! calls, with caller-saved registers spilled around the call.

use crate::cond::CondFlag;
use crate::error::{CodeError, Result};
use crate::instr::{self, Instr, OpCode};
use crate::listing::Listing;
use crate::operand::{self, Operand};
use crate::reg::{Reg, RegId, RegSet};
use crate::size::Size;
use crate::typedesc::TypeDesc;
use crate::used_regs::used_registers;

pub mod runtime {
    //! Helpers the split code calls for the operations the 32-bit ISA
    //! cannot express inline.

    pub extern "C" fn long_mul(a: i64, b: i64) -> i64 {
        a.wrapping_mul(b)
    }

    pub extern "C" fn long_idiv(a: i64, b: i64) -> i64 {
        a.wrapping_div(b)
    }

    pub extern "C" fn long_imod(a: i64, b: i64) -> i64 {
        a.wrapping_rem(b)
    }

    pub extern "C" fn word_udiv(a: u64, b: u64) -> u64 {
        a / b
    }

    pub extern "C" fn word_umod(a: u64, b: u64) -> u64 {
        a % b
    }

    pub extern "C" fn long_shl(a: i64, b: i64) -> i64 {
        a.wrapping_shl(b as u32)
    }

    pub extern "C" fn long_shr(a: i64, b: i64) -> i64 {
        ((a as u64) >> (b as u32 & 63)) as i64
    }

    pub extern "C" fn long_sar(a: i64, b: i64) -> i64 {
        a.wrapping_shr(b as u32)
    }
}

/// The register holding the high half of an 8-byte pair.
pub fn high_partner(id: RegId) -> Option<RegId> {
    match id {
        RegId::Ax => Some(RegId::Dx),
        RegId::Bx => Some(RegId::Si),
        RegId::Cx => Some(RegId::Di),
        _ => None,
    }
}

/// Expand a register set with the high halves of any 8-byte pairs.
pub fn add64(set: &mut RegSet) {
    for id in [RegId::Ax, RegId::Bx, RegId::Cx] {
        if set.contains(id) {
            if let Some(high) = high_partner(id) {
                set.add(high);
            }
        }
    }
}

/// Caller-saved registers in the 32-bit convention.
fn not_preserved() -> [RegId; 3] {
    [RegId::Ax, RegId::Cx, RegId::Dx]
}

/// The low 32-bit half of an 8-byte operand.
pub fn low32(op: &Operand) -> Result<Operand> {
    half(op, false)
}

/// The high 32-bit half of an 8-byte operand.
pub fn high32(op: &Operand) -> Result<Operand> {
    half(op, true)
}

fn half(op: &Operand, high: bool) -> Result<Operand> {
    let add = if high { 4 } else { 0 };
    Ok(match op {
        Operand::Reg(r) => {
            let id = if high {
                high_partner(r.id).ok_or_else(|| CodeError::InvalidOperand {
                    op: "64-bit split",
                    detail: format!("register {:?} has no high half", r.id),
                })?
            } else {
                r.id
            };
            Operand::Reg(Reg::new(id, Size::INT))
        }
        Operand::Mem { base, offset, .. } => operand::int_rel(*base, offset + add),
        Operand::Var { var, offset, .. } => Operand::Var {
            var: *var,
            offset: offset + add,
            size: Size::INT,
        },
        Operand::Const(v) => {
            let bits = v.bits();
            let part = if high { (bits >> 32) as u32 } else { bits as u32 };
            operand::nat_const(part)
        }
        other => {
            return Err(CodeError::InvalidOperand {
                op: "64-bit split",
                detail: format!("cannot split {}", other),
            })
        }
    })
}

pub fn run(src: &Listing) -> Result<Listing> {
    let usage = used_registers(src);
    let mut to = src.create_shell();

    for i in 0..src.count() {
        for &l in src.labels(i) {
            to.push_label(l);
        }
        let instr = src.at(i);
        if instr.size().current(false) == 8 && splits(instr.op) {
            transform(&mut to, instr, usage.used[i])?;
        } else {
            to.push(instr.clone());
        }
    }
    for &l in src.labels(src.count()) {
        to.push_label(l);
    }

    Ok(to)
}

fn splits(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::Mov
            | OpCode::Add
            | OpCode::Adc
            | OpCode::Sub
            | OpCode::Sbb
            | OpCode::Bor
            | OpCode::Band
            | OpCode::Bxor
            | OpCode::Bnot
            | OpCode::Cmp
            | OpCode::Mul
            | OpCode::Idiv
            | OpCode::Imod
            | OpCode::Udiv
            | OpCode::Umod
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::Sar
            | OpCode::Push
            | OpCode::Pop
            | OpCode::Icast
            | OpCode::Ucast
    )
}

fn transform(to: &mut Listing, i: &Instr, used: RegSet) -> Result<()> {
    match i.op {
        OpCode::Mov => pairwise(to, i, OpCode::Mov, OpCode::Mov),
        OpCode::Add => pairwise(to, i, OpCode::Add, OpCode::Adc),
        OpCode::Adc => pairwise(to, i, OpCode::Adc, OpCode::Adc),
        OpCode::Sub => pairwise(to, i, OpCode::Sub, OpCode::Sbb),
        OpCode::Sbb => pairwise(to, i, OpCode::Sbb, OpCode::Sbb),
        OpCode::Bor => pairwise(to, i, OpCode::Bor, OpCode::Bor),
        OpCode::Band => pairwise(to, i, OpCode::Band, OpCode::Band),
        OpCode::Bxor => pairwise(to, i, OpCode::Bxor, OpCode::Bxor),
        OpCode::Bnot => {
            to.push(Instr::new(OpCode::Bnot, low32(&i.dest)?, Operand::None));
            to.push(Instr::new(OpCode::Bnot, high32(&i.dest)?, Operand::None));
            Ok(())
        }
        OpCode::Cmp => {
            // High halves decide unless equal; then the low halves do.
            let end = to.label();
            to.push(instr::cmp(high32(&i.dest)?, high32(&i.src)?));
            to.push(instr::jmp_cond(end, CondFlag::NotEqual));
            to.push(instr::cmp(low32(&i.dest)?, low32(&i.src)?));
            to.push_label(end);
            Ok(())
        }
        OpCode::Mul => call_helper(to, i, used, "long_mul", runtime::long_mul as usize),
        OpCode::Idiv => call_helper(to, i, used, "long_idiv", runtime::long_idiv as usize),
        OpCode::Imod => call_helper(to, i, used, "long_imod", runtime::long_imod as usize),
        OpCode::Udiv => call_helper(to, i, used, "word_udiv", runtime::word_udiv as usize),
        OpCode::Umod => call_helper(to, i, used, "word_umod", runtime::word_umod as usize),
        OpCode::Shl => call_helper(to, i, used, "long_shl", runtime::long_shl as usize),
        OpCode::Shr => call_helper(to, i, used, "long_shr", runtime::long_shr as usize),
        OpCode::Sar => call_helper(to, i, used, "long_sar", runtime::long_sar as usize),
        OpCode::Push => {
            to.push(instr::push(high32(&i.src)?));
            to.push(instr::push(low32(&i.src)?));
            Ok(())
        }
        OpCode::Pop => {
            to.push(instr::pop(low32(&i.dest)?));
            to.push(instr::pop(high32(&i.dest)?));
            Ok(())
        }
        OpCode::Icast | OpCode::Ucast => cast(to, i),
        _ => {
            to.push(i.clone());
            Ok(())
        }
    }
}

fn pairwise(to: &mut Listing, i: &Instr, low_op: OpCode, high_op: OpCode) -> Result<()> {
    to.push(Instr::new(low_op, low32(&i.dest)?, low32(&i.src)?));
    to.push(Instr::new(high_op, high32(&i.dest)?, high32(&i.src)?));
    Ok(())
}

/// Spill live caller-saved registers, call a runtime helper with both
/// operands, fetch the result from the a/d pair and restore.
fn call_helper(
    to: &mut Listing,
    i: &Instr,
    mut used: RegSet,
    name: &str,
    addr: usize,
) -> Result<()> {
    add64(&mut used);
    let saved: Vec<RegId> = not_preserved()
        .into_iter()
        .filter(|id| used.contains(*id))
        .collect();

    for &id in &saved {
        to.push(instr::push(Reg::new(id, Size::INT)));
    }

    to.push(instr::fn_param(TypeDesc::long(), i.dest.clone()));
    to.push(instr::fn_param(TypeDesc::long(), i.src.clone()));
    to.push(instr::fn_call(
        Operand::Ref(operand::ExtRef::new(name, addr)),
        TypeDesc::long(),
    ));

    // Result arrives in the a/d pair.
    let pair = Operand::Reg(Reg::new(RegId::Ax, Size::LONG));
    to.push(instr::mov(low32(&i.dest)?, low32(&pair)?));
    to.push(instr::mov(high32(&i.dest)?, high32(&pair)?));

    for &id in saved.iter().rev() {
        to.push(instr::pop(Reg::new(id, Size::INT)));
    }
    Ok(())
}

/// Casts crossing the 8-byte boundary.
fn cast(to: &mut Listing, i: &Instr) -> Result<()> {
    let signed = i.op == OpCode::Icast;
    let from = i.src.size().current(false);
    let to_bytes = i.dest.size().current(false);

    if to_bytes == 8 && from <= 4 {
        let low = low32(&i.dest)?;
        let high = high32(&i.dest)?;
        if from == 4 {
            to.push(instr::mov(low.clone(), i.src.clone()));
        } else {
            to.push(Instr::new(i.op, low.clone(), i.src.clone()));
        }
        if signed {
            // Fill the high half with the sign of the low half.
            let scratch = Reg::new(RegId::Ax, Size::INT);
            to.push(instr::push(scratch));
            to.push(instr::mov(scratch, low));
            to.push(instr::sar(scratch, operand::byte_const(31)));
            to.push(instr::mov(high, scratch));
            to.push(instr::pop(scratch));
        } else {
            to.push(instr::mov(high, operand::nat_const(0)));
        }
        return Ok(());
    }

    if from == 8 && to_bytes <= 4 {
        // Narrowing: the low half carries the value.
        let low = low32(&i.src)?;
        if to_bytes == 4 {
            to.push(instr::mov(i.dest.clone(), low));
        } else {
            to.push(Instr::new(i.op, i.dest.clone(), low));
        }
        return Ok(());
    }

    to.push(i.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::long_const;
    use crate::reg::regs;

    fn var_long(l: &mut Listing) -> Operand {
        let p = l.root().part();
        let v = l.create_long_var(p);
        Operand::Var {
            var: v,
            offset: 0,
            size: Size::LONG,
        }
    }

    fn ops(l: &Listing) -> Vec<OpCode> {
        l.entries().iter().map(|e| e.instr.op).collect()
    }

    #[test]
    fn test_add_splits_into_add_adc() {
        let mut l = Listing::new();
        let a = var_long(&mut l);
        l.push(instr::add(a, long_const(0x9999_9999_99)));
        let out = run(&l).unwrap();

        assert_eq!(ops(&out), vec![OpCode::Add, OpCode::Adc]);
        // Low half gets the low constant bits, high half the rest.
        assert_eq!(
            out.at(0).src,
            operand::nat_const(0x9999_9999u64 as u32)
        );
        assert_eq!(out.at(1).src, operand::nat_const(0x99));
        // The halves address offsets 0 and 4 of the variable.
        assert!(matches!(out.at(0).dest, Operand::Var { offset: 0, .. }));
        assert!(matches!(out.at(1).dest, Operand::Var { offset: 4, .. }));
    }

    #[test]
    fn test_sub_splits_into_sub_sbb() {
        let mut l = Listing::new();
        let a = var_long(&mut l);
        l.push(instr::sub(a, long_const(1)));
        assert_eq!(ops(&run(&l).unwrap()), vec![OpCode::Sub, OpCode::Sbb]);
    }

    #[test]
    fn test_mov_register_pair() {
        let mut l = Listing::new();
        l.push(instr::mov(
            Operand::Reg(Reg::new(RegId::Ax, Size::LONG)),
            long_const(0x7777_7777_77),
        ));
        let out = run(&l).unwrap();
        // a/d pair: low to eax, high to edx.
        assert_eq!(
            out.at(0).dest.reg().map(|r| r.id),
            Some(RegId::Ax)
        );
        assert_eq!(
            out.at(1).dest.reg().map(|r| r.id),
            Some(RegId::Dx)
        );
    }

    #[test]
    fn test_cmp_uses_high_then_low() {
        let mut l = Listing::new();
        let a = var_long(&mut l);
        l.push(instr::cmp(a, long_const(5)));
        let out = run(&l).unwrap();
        assert_eq!(
            ops(&out),
            vec![OpCode::Cmp, OpCode::Jmp, OpCode::Cmp]
        );
        // First comparison is on the high halves.
        assert!(matches!(out.at(0).dest, Operand::Var { offset: 4, .. }));
    }

    #[test]
    fn test_mul_calls_runtime_helper() {
        let mut l = Listing::new();
        let a = var_long(&mut l);
        l.push(instr::mul(a, long_const(3)));
        let out = run(&l).unwrap();

        let call = out
            .entries()
            .iter()
            .find(|e| e.instr.op == OpCode::FnCall)
            .expect("helper call");
        assert!(matches!(&call.instr.src, Operand::Ref(r) if r.name == "long_mul"));
        // Result lands back in the destination through the a/d pair.
        assert!(out
            .entries()
            .iter()
            .any(|e| e.instr.op == OpCode::Mov
                && e.instr.src.reg().map(|r| r.id) == Some(RegId::Dx)));
    }

    #[test]
    fn test_mul_spills_live_caller_saved() {
        let mut l = Listing::new();
        let a = var_long(&mut l);
        // ecx is live across the multiply.
        l.push(instr::mov(regs::ECX, operand::int_const(1)));
        l.push(instr::mul(a, long_const(3)));
        l.push(instr::add(regs::ECX, operand::int_const(1)));
        let out = run(&l).unwrap();

        let pushes: Vec<RegId> = out
            .entries()
            .iter()
            .filter(|e| e.instr.op == OpCode::Push)
            .filter_map(|e| e.instr.src.reg().map(|r| r.id))
            .collect();
        assert!(pushes.contains(&RegId::Cx));
    }

    #[test]
    fn test_push_pushes_high_first() {
        let mut l = Listing::new();
        let a = var_long(&mut l);
        l.push(instr::push(a));
        let out = run(&l).unwrap();
        assert!(matches!(out.at(0).src, Operand::Var { offset: 4, .. }));
        assert!(matches!(out.at(1).src, Operand::Var { offset: 0, .. }));
    }

    #[test]
    fn test_icast_widening_sign_fills_high() {
        let mut l = Listing::new();
        let p = l.root().part();
        let wide = l.create_long_var(p);
        l.push(instr::icast(
            Operand::Var {
                var: wide,
                offset: 0,
                size: Size::LONG,
            },
            operand::int_const(-2),
        ));
        let out = run(&l).unwrap();
        // Ends with the sign replicated into the high half.
        assert!(out.entries().iter().any(|e| e.instr.op == OpCode::Sar));
    }

    #[test]
    fn test_ucast_widening_zeroes_high() {
        let mut l = Listing::new();
        let p = l.root().part();
        let wide = l.create_long_var(p);
        l.push(instr::ucast(
            Operand::Var {
                var: wide,
                offset: 0,
                size: Size::LONG,
            },
            operand::nat_const(0xFF00_FF00),
        ));
        let out = run(&l).unwrap();
        let last = &out.entries().last().unwrap().instr;
        assert_eq!(last.op, OpCode::Mov);
        assert_eq!(last.src, operand::nat_const(0));
    }

    #[test]
    fn test_narrow_operations_untouched() {
        let mut l = Listing::new();
        l.push(instr::add(regs::EAX, operand::int_const(1)));
        let out = run(&l).unwrap();
        assert_eq!(out.count(), 1);
    }
}
