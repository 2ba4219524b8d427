//! Operand legalization for x86-64.
//!
//! Rewrites every instruction whose operand combination the ISA cannot
//! encode: memory-to-memory moves, over-wide immediates, shifts by
//! anything but `cl`, multiplication into memory, and the fixed
//! register file of `div`. Where a temporary register is needed the pass
//! prefers one that is unused at that point; otherwise it saves and
//! restores a scratch register around the split.

use crate::cond::CondFlag;
use crate::error::Result;
use crate::instr::{self, Instr, OpCode};
use crate::listing::Listing;
use crate::operand::{self, Operand, Value};
use crate::reg::{Reg, RegId, RegSet};
use crate::size::Size;
use crate::used_regs::{used_registers, UsedRegs};

/// Scratch candidates, preferred order. All caller saved.
const SCRATCH_ORDER: [RegId; 4] = [RegId::R10, RegId::R11, RegId::Si, RegId::Di];

pub fn run(src: &Listing) -> Result<Listing> {
    let usage = used_registers(src);
    let mut to = src.create_shell();

    for i in 0..src.count() {
        for &l in src.labels(i) {
            to.push_label(l);
        }
        transform(&mut to, src.at(i), &usage, i)?;
    }
    for &l in src.labels(src.count()) {
        to.push_label(l);
    }

    Ok(to)
}

/// A register unused across line `i`, if any.
fn unused_reg(usage: &UsedRegs, i: usize, instr: &Instr) -> Option<Reg> {
    let mut busy: RegSet = usage.used[i];
    // The instruction's own operands are off limits as well.
    for op in [&instr.dest, &instr.src] {
        match op {
            Operand::Reg(r) => busy.add(r.id),
            Operand::Mem { base, .. } => busy.add(*base),
            _ => {}
        }
    }
    SCRATCH_ORDER
        .iter()
        .find(|id| !busy.contains(**id))
        .map(|&id| Reg::new(id, Size::PTR))
}

/// Does this immediate fit the instruction's immediate field? 64-bit
/// operations sign-extend a 32-bit immediate; narrower operations take
/// it raw.
fn const_fits(v: &Value, size: u32) -> bool {
    if size <= 4 {
        return true;
    }
    let bits = v.bits();
    bits as i64 >= i32::MIN as i64 && bits as i64 <= i32::MAX as i64
}

/// Is this operand directly usable as a source together with this
/// destination?
fn supported(instr: &Instr, ptr64: bool) -> bool {
    let size = instr.size().current(ptr64);
    match &instr.src {
        Operand::Reg(_) => true,
        Operand::Const(v) => {
            // movabs allows any immediate into a register.
            const_fits(v, size) || (instr.op == OpCode::Mov && instr.dest.reg().is_some())
        }
        Operand::Label(_) | Operand::Ref(_) => {
            // These are rip-relative loads of one word; fine as long as
            // the destination is a register, and for pushes.
            instr.dest.reg().is_some() || matches!(instr.op, OpCode::Push | OpCode::Dat)
        }
        _ => {
            // Memory (and variable) sources need a register or absent
            // destination.
            instr.dest.reg().is_some() || instr.dest.is_none()
        }
    }
}

/// Emit `body` with `reg` saved around it when `saved` demands it.
fn with_scratch(
    to: &mut Listing,
    usage: &UsedRegs,
    line: usize,
    instr: &Instr,
    body: impl FnOnce(&mut Listing, Reg),
) {
    match unused_reg(usage, line, instr) {
        Some(r) => body(to, r),
        None => {
            let r = Reg::new(RegId::Si, Size::PTR);
            to.push(instr::push(r));
            body(to, r);
            to.push(instr::pop(r));
        }
    }
}

/// Pseudo operations and operations whose operand shapes are always
/// encodable; the layout pass or the encoder handles them directly.
fn pass_through(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::Nop
            | OpCode::Push
            | OpCode::Pop
            | OpCode::PushFlags
            | OpCode::PopFlags
            | OpCode::Call
            | OpCode::Ret
            | OpCode::Cdq
            | OpCode::RepMovsq
            | OpCode::UnwindInfo
            | OpCode::Fld
            | OpCode::Fild
            | OpCode::Fstp
            | OpCode::Fistp
            | OpCode::Faddp
            | OpCode::Fsubp
            | OpCode::Fmulp
            | OpCode::Fdivp
            | OpCode::Fcompp
            | OpCode::Fwait
            | OpCode::Dat
            | OpCode::LblOffset
            | OpCode::Align
            | OpCode::AlignAs
            | OpCode::FnParam
            | OpCode::FnParamRef
            | OpCode::FnCall
            | OpCode::FnCallRef
            | OpCode::FnRet
            | OpCode::FnRetRef
            | OpCode::Prolog
            | OpCode::Epilog
            | OpCode::Begin
            | OpCode::End
            | OpCode::Preserve
            | OpCode::ThreadLocal
    )
}

fn transform(to: &mut Listing, i: &Instr, usage: &UsedRegs, line: usize) -> Result<()> {
    if pass_through(i.op) {
        to.push(i.clone());
        return Ok(());
    }
    match i.op {
        OpCode::Idiv | OpCode::Udiv => div_tfm(to, i, false),
        OpCode::Imod | OpCode::Umod => div_tfm(to, i, true),
        OpCode::Shl | OpCode::Shr | OpCode::Sar => shift_tfm(to, i),
        OpCode::Mul => mul_tfm(to, i),
        OpCode::Swap => {
            // xchg is symmetric; one side must be a register.
            if i.dest.reg().is_some() {
                to.push(i.clone());
            } else if i.src.reg().is_some() {
                to.push(i.altered(i.src.clone(), i.dest.clone()));
            } else {
                let size = i.size();
                with_scratch(to, usage, line, i, |to, r| {
                    let r = r.as_size(size);
                    to.push(instr::mov(r, i.src.clone()));
                    to.push(Instr::new(OpCode::Swap, Operand::Reg(r), i.dest.clone()));
                    to.push(instr::mov(i.src.clone(), Operand::Reg(r)));
                });
            }
            Ok(())
        }
        OpCode::SetCond => set_cond_tfm(to, i),
        OpCode::Icast | OpCode::Ucast => cast_tfm(to, i),
        OpCode::Jmp => {
            if i.src.cond_flag() != Some(CondFlag::Never) {
                to.push(i.clone());
            }
            Ok(())
        }
        OpCode::Lea => {
            if i.dest.reg().is_some() {
                to.push(i.clone());
            } else {
                with_scratch(to, usage, line, i, |to, r| {
                    to.push(instr::lea(r, i.src.clone()));
                    to.push(instr::mov(i.dest.clone(), Operand::Reg(r)));
                });
            }
            Ok(())
        }
        _ => {
            if supported(i, true) {
                to.push(i.clone());
            } else {
                let size = i.src.size();
                with_scratch(to, usage, line, i, |to, r| {
                    let r = r.as_size(size);
                    to.push(instr::mov(r, i.src.clone()));
                    to.push(i.alter_src(Operand::Reg(r)));
                });
            }
            Ok(())
        }
    }
}

/// Division uses the fixed rax/rdx pair. The operands are saved
/// unconditionally; when the destination is one of the saved registers
/// the result lands in its stack slot so the pops restore it.
fn div_tfm(to: &mut Listing, i: &Instr, remainder: bool) -> Result<()> {
    let size = i.size();
    let signed = matches!(i.op, OpCode::Idiv | OpCode::Imod);

    let ax = Reg::new(RegId::Ax, size);
    let cx = Reg::new(RegId::Cx, size);
    let dx = Reg::new(RegId::Dx, size);

    to.push(instr::push(Reg::new(RegId::Cx, Size::PTR)));
    to.push(instr::push(Reg::new(RegId::Dx, Size::PTR)));
    to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));

    // Divisor first, while every register still holds its value. The
    // dividend then reads the saved slot if it lived in rcx.
    to.push(instr::mov(cx, i.src.clone()));
    if i.dest.reg().map(|r| r.id) == Some(RegId::Cx) {
        to.push(instr::mov(ax, operand::x_rel(size, RegId::StackPtr, 16)));
    } else {
        to.push(instr::mov(ax, i.dest.clone()));
    }
    if signed {
        to.push(Instr::new(OpCode::Cdq, Operand::None, Operand::Reg(ax)));
        to.push(Instr::new(
            if remainder { OpCode::Imod } else { OpCode::Idiv },
            Operand::None,
            Operand::Reg(cx),
        ));
    } else {
        let dx32 = Reg::new(RegId::Dx, Size::INT);
        to.push(instr::bxor(dx32, dx32));
        to.push(Instr::new(
            if remainder { OpCode::Umod } else { OpCode::Udiv },
            Operand::None,
            Operand::Reg(cx),
        ));
    }

    let result = if remainder { dx } else { ax };
    // Pushed order: rcx, rdx, rax -> rax at [rsp], rdx at +8, rcx at +16.
    match i.dest.reg().map(|r| r.id) {
        Some(RegId::Ax) => to.push(instr::mov(
            operand::x_rel(size, RegId::StackPtr, 0),
            result,
        )),
        Some(RegId::Dx) => to.push(instr::mov(
            operand::x_rel(size, RegId::StackPtr, 8),
            result,
        )),
        Some(RegId::Cx) => to.push(instr::mov(
            operand::x_rel(size, RegId::StackPtr, 16),
            result,
        )),
        _ => to.push(instr::mov(i.dest.clone(), result)),
    }

    to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
    to.push(instr::pop(Reg::new(RegId::Dx, Size::PTR)));
    to.push(instr::pop(Reg::new(RegId::Cx, Size::PTR)));
    Ok(())
}

/// Shifts take their count in `cl` unless it is immediate.
fn shift_tfm(to: &mut Listing, i: &Instr) -> Result<()> {
    if matches!(i.src, Operand::Const(_)) {
        to.push(i.clone());
        return Ok(());
    }

    let cl = Reg::new(RegId::Cx, Size::BYTE);
    to.push(instr::push(Reg::new(RegId::Cx, Size::PTR)));
    to.push(instr::mov(cl, byte_view(&i.src)));
    if i.dest.reg().map(|r| r.id) == Some(RegId::Cx) {
        // Operate on the saved copy; the pop brings the result back.
        let size = i.size();
        to.push(
            i.altered(
                operand::x_rel(size, RegId::StackPtr, 0),
                Operand::Reg(cl),
            ),
        );
    } else {
        to.push(i.alter_src(Operand::Reg(cl)));
    }
    to.push(instr::pop(Reg::new(RegId::Cx, Size::PTR)));
    Ok(())
}

/// The low byte of an operand (shift counts are byte sized).
fn byte_view(op: &Operand) -> Operand {
    match op {
        Operand::Reg(r) => Operand::Reg(r.as_size(Size::BYTE)),
        Operand::Mem { base, offset, .. } => operand::x_rel(Size::BYTE, *base, *offset),
        Operand::Var { var, offset, .. } => Operand::Var {
            var: *var,
            offset: *offset,
            size: Size::BYTE,
        },
        other => other.clone(),
    }
}

/// `imul` multiplies into a register only.
fn mul_tfm(to: &mut Listing, i: &Instr) -> Result<()> {
    if i.dest.reg().is_some() {
        to.push(i.clone());
        return Ok(());
    }

    let size = i.size();
    let ax = Reg::new(RegId::Ax, size);
    let dx = Reg::new(RegId::Dx, size);

    to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
    to.push(instr::push(Reg::new(RegId::Dx, Size::PTR)));
    to.push(instr::mov(dx, i.src.clone()));
    to.push(instr::mov(ax, i.dest.clone()));
    to.push(instr::mul(ax, dx));
    to.push(instr::mov(i.dest.clone(), ax));
    to.push(instr::pop(Reg::new(RegId::Dx, Size::PTR)));
    to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
    Ok(())
}

/// `setcc` with the trivial flags becomes a constant store.
fn set_cond_tfm(to: &mut Listing, i: &Instr) -> Result<()> {
    match i.src.cond_flag() {
        Some(CondFlag::Always) => to.push(instr::mov(i.dest.clone(), operand::byte_const(1))),
        Some(CondFlag::Never) => to.push(instr::mov(i.dest.clone(), operand::byte_const(0))),
        _ => to.push(i.clone()),
    }
    Ok(())
}

/// Casts extend into a register; memory destinations go through rax.
fn cast_tfm(to: &mut Listing, i: &Instr) -> Result<()> {
    if i.dest.reg().is_some() {
        to.push(i.clone());
        return Ok(());
    }

    let size = i.dest.size();
    let ax = Reg::new(RegId::Ax, size);
    to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
    to.push(Instr::new(i.op, Operand::Reg(ax), i.src.clone()));
    to.push(instr::mov(i.dest.clone(), ax));
    to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::int_const;
    use crate::reg::regs;
    use crate::size::Size;

    fn lower(build: impl FnOnce(&mut Listing)) -> Listing {
        let mut l = Listing::new();
        build(&mut l);
        run(&l).unwrap()
    }

    #[test]
    fn test_reg_reg_untouched() {
        let out = lower(|l| l.push(instr::add(regs::EAX, regs::EBX)));
        assert_eq!(out.count(), 1);
        assert_eq!(out.at(0).op, OpCode::Add);
    }

    #[test]
    fn test_mem_mem_split() {
        let out = lower(|l| {
            let p = l.root().part();
            let a = l.create_int_var(p);
            let b = l.create_int_var(p);
            l.push(instr::mov(
                Operand::Var {
                    var: a,
                    offset: 0,
                    size: Size::INT,
                },
                Operand::Var {
                    var: b,
                    offset: 0,
                    size: Size::INT,
                },
            ));
        });
        // Split into a load and a store through a scratch register.
        assert_eq!(out.count(), 2);
        assert_eq!(out.at(0).op, OpCode::Mov);
        assert!(out.at(0).dest.reg().is_some());
        assert_eq!(out.at(1).op, OpCode::Mov);
        assert!(out.at(1).src.reg().is_some());
    }

    #[test]
    fn test_div_uses_fixed_registers() {
        let out = lower(|l| {
            let p = l.root().part();
            let a = l.create_int_var(p);
            l.push(instr::idiv(
                Operand::Var {
                    var: a,
                    offset: 0,
                    size: Size::INT,
                },
                int_const(2),
            ));
        });
        // Saves, sign-extend, hardware divide, result, restores.
        assert!(out.count() >= 9);
        assert!(out
            .entries()
            .iter()
            .any(|e| e.instr.op == OpCode::Cdq));
        assert!(out
            .entries()
            .iter()
            .any(|e| e.instr.op == OpCode::Idiv && e.instr.dest.is_none()));
    }

    #[test]
    fn test_shift_by_register_moves_to_cl() {
        let out = lower(|l| {
            l.push(instr::shl(regs::EAX, regs::EBX));
        });
        assert!(out.entries().iter().any(|e| {
            e.instr.op == OpCode::Mov
                && e.instr.dest.reg().map(|r| (r.id, r.size))
                    == Some((RegId::Cx, Size::BYTE))
        }));
    }

    #[test]
    fn test_shift_by_const_untouched() {
        let out = lower(|l| {
            l.push(instr::shl(regs::EAX, operand::byte_const(3)));
        });
        assert_eq!(out.count(), 1);
    }

    #[test]
    fn test_never_jump_dropped() {
        let out = lower(|l| {
            let t = l.label();
            l.push(instr::jmp_cond(t, CondFlag::Never));
            l.push_label(t);
            l.push(instr::ret());
        });
        assert_eq!(out.count(), 1);
        assert_eq!(out.at(0).op, OpCode::Ret);
    }

    #[test]
    fn test_set_cond_always() {
        let out = lower(|l| {
            l.push(instr::set_cond(regs::AL, CondFlag::Always));
        });
        assert_eq!(out.count(), 1);
        assert_eq!(out.at(0).op, OpCode::Mov);
    }

    #[test]
    fn test_mul_into_memory() {
        let out = lower(|l| {
            let p = l.root().part();
            let a = l.create_int_var(p);
            l.push(instr::mul(
                Operand::Var {
                    var: a,
                    offset: 0,
                    size: Size::INT,
                },
                int_const(3),
            ));
        });
        assert!(out
            .entries()
            .iter()
            .any(|e| e.instr.op == OpCode::Mul && e.instr.dest.reg().is_some()));
    }
}
