//! Operand legalization for x86-32.
//!
//! Runs after the 64-bit split, so every operand is at most four bytes.
//! The rules mirror the 64-bit pass with the smaller register file:
//! memory-to-memory combinations get a temporary register, shifts count
//! in `cl`, multiplication targets a register, division owns the a/d
//! pair.

use crate::cond::CondFlag;
use crate::error::Result;
use crate::instr::{self, Instr, OpCode};
use crate::listing::Listing;
use crate::operand::{self, Operand};
use crate::reg::{Reg, RegId, RegSet};
use crate::size::Size;
use crate::used_regs::{used_registers, UsedRegs};

use super::split64::add64;

/// Scratch candidates, preferred order: d first, then the index
/// registers.
const SCRATCH_ORDER: [RegId; 3] = [RegId::Dx, RegId::Si, RegId::Di];

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

fn unused_reg(usage: &UsedRegs, i: usize, instr: &Instr) -> Option<Reg> {
    let mut busy: RegSet = usage.used[i];
    add64(&mut busy);
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

fn supported(instr: &Instr) -> bool {
    match &instr.src {
        Operand::Reg(_) | Operand::Const(_) | Operand::Label(_) | Operand::Ref(_) => true,
        _ => instr.dest.reg().is_some() || instr.dest.is_none(),
    }
}

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
            let r = Reg::new(RegId::Dx, Size::PTR);
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
        OpCode::SetCond => {
            match i.src.cond_flag() {
                Some(CondFlag::Always) => {
                    to.push(instr::mov(i.dest.clone(), operand::byte_const(1)))
                }
                Some(CondFlag::Never) => {
                    to.push(instr::mov(i.dest.clone(), operand::byte_const(0)))
                }
                _ => to.push(i.clone()),
            }
            Ok(())
        }
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
            if supported(i) {
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

fn div_tfm(to: &mut Listing, i: &Instr, remainder: bool) -> Result<()> {
    let size = i.size();
    let signed = matches!(i.op, OpCode::Idiv | OpCode::Imod);
    let ax = Reg::new(RegId::Ax, size);
    let cx = Reg::new(RegId::Cx, size);
    let dx = Reg::new(RegId::Dx, size);

    to.push(instr::push(Reg::new(RegId::Cx, Size::PTR)));
    to.push(instr::push(Reg::new(RegId::Dx, Size::PTR)));
    to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));

    to.push(instr::mov(cx, i.src.clone()));
    if i.dest.reg().map(|r| r.id) == Some(RegId::Cx) {
        to.push(instr::mov(ax, operand::x_rel(size, RegId::StackPtr, 8)));
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
    match i.dest.reg().map(|r| r.id) {
        Some(RegId::Ax) => to.push(instr::mov(
            operand::x_rel(size, RegId::StackPtr, 0),
            result,
        )),
        Some(RegId::Dx) => to.push(instr::mov(
            operand::x_rel(size, RegId::StackPtr, 4),
            result,
        )),
        Some(RegId::Cx) => to.push(instr::mov(
            operand::x_rel(size, RegId::StackPtr, 8),
            result,
        )),
        _ => to.push(instr::mov(i.dest.clone(), result)),
    }

    to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
    to.push(instr::pop(Reg::new(RegId::Dx, Size::PTR)));
    to.push(instr::pop(Reg::new(RegId::Cx, Size::PTR)));
    Ok(())
}

fn shift_tfm(to: &mut Listing, i: &Instr) -> Result<()> {
    if matches!(i.src, Operand::Const(_)) {
        to.push(i.clone());
        return Ok(());
    }

    let cl = Reg::new(RegId::Cx, Size::BYTE);
    to.push(instr::push(Reg::new(RegId::Cx, Size::PTR)));
    to.push(instr::mov(cl, byte_view(&i.src)));
    if i.dest.reg().map(|r| r.id) == Some(RegId::Cx) {
        let size = i.size();
        to.push(i.altered(operand::x_rel(size, RegId::StackPtr, 0), Operand::Reg(cl)));
    } else {
        to.push(i.alter_src(Operand::Reg(cl)));
    }
    to.push(instr::pop(Reg::new(RegId::Cx, Size::PTR)));
    Ok(())
}

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
