//! x86-32 instruction encoder.
//!
//! The 32-bit sibling of the 64-bit encoder: no REX prefixes, word size
//! four, and absolute addresses fit an immediate, so references use
//! absolute (`RawPtr`) and rel32 (`Relative`) trailer entries instead of
//! rip-relative slots.

use crate::cond::CondFlag;
use crate::error::{CodeError, Result};
use crate::instr::{Instr, OpCode};
use crate::listing::Listing;
use crate::operand::{Operand, Value};
use crate::output::{CodeOut, EncodedCode, RefTarget};
use crate::reg::{Reg, RegId};
use vgc::code::RefKind;

pub fn encode(src: &Listing) -> Result<EncodedCode> {
    let mut prev: Vec<usize> = Vec::new();
    for _ in 0..8 {
        let mut out = CodeOut::new(src.label_count(), prev.clone());
        emit_all(src, &mut out)?;
        let table = out.label_table();
        if table == prev {
            let (bytes, refs, label_offsets) = out.finish();
            return Ok(EncodedCode {
                bytes,
                refs,
                label_offsets,
            });
        }
        prev = table;
    }
    Err(CodeError::InvalidOperand {
        op: "encode",
        detail: "label offsets did not stabilize".into(),
    })
}

fn emit_all(src: &Listing, out: &mut CodeOut) -> Result<()> {
    for i in 0..src.count() {
        for &l in src.labels(i) {
            out.mark_label(l);
        }
        emit(src.at(i), out)?;
    }
    for &l in src.labels(src.count()) {
        out.mark_label(l);
    }
    Ok(())
}

enum Rm {
    Reg(u8),
    Mem { base: u8, disp: i32 },
}

fn err(op: &'static str, detail: impl Into<String>) -> CodeError {
    CodeError::UnsupportedAddressing {
        op,
        detail: detail.into(),
    }
}

fn check_reg(r: Reg, name: &'static str) -> Result<u8> {
    let enc = r.id.encoding();
    if enc >= 8 {
        return Err(err(name, format!("{:?} does not exist on this target", r.id)));
    }
    Ok(enc)
}

fn operand_rm(op: &Operand, name: &'static str) -> Result<Rm> {
    match op {
        Operand::Reg(r) => Ok(Rm::Reg(check_reg(*r, name)?)),
        Operand::Mem { base, offset, .. } => {
            let enc = base.encoding();
            if enc >= 8 {
                return Err(err(name, format!("{:?} does not exist on this target", base)));
            }
            Ok(Rm::Mem { base: enc, disp: *offset })
        }
        other => Err(err(name, format!("not an r/m operand: {}", other))),
    }
}

fn put_modrm(out: &mut CodeOut, opcode: &[u8], reg_field: u8, rm: &Rm) {
    out.put_bytes(opcode);
    match rm {
        Rm::Reg(enc) => out.put_byte(0xC0 | (reg_field << 3) | enc),
        Rm::Mem { base, disp } => {
            let need_sib = *base == 4; // esp
            let small = *disp >= -128 && *disp <= 127;
            let modbits = if *disp == 0 && *base != 5 {
                0x00
            } else if small {
                0x40
            } else {
                0x80
            };
            out.put_byte(modbits | (reg_field << 3) | if need_sib { 4 } else { *base });
            if need_sib {
                out.put_byte(0x24);
            }
            if modbits == 0x40 {
                out.put_byte(*disp as i8 as u8);
            } else if modbits == 0x80 {
                out.put_u32(*disp as u32);
            }
        }
    }
}

fn arith(out: &mut CodeOut, i: &Instr, base: u8, ext: u8, name: &'static str) -> Result<()> {
    let size = i.size().current(false);
    match (&i.dest, &i.src) {
        (_, Operand::Const(v)) => {
            let rm = operand_rm(&i.dest, name)?;
            if size == 1 {
                put_modrm(out, &[0x80], ext, &rm);
                out.put_byte(v.bits() as u8);
            } else {
                put_modrm(out, &[0x81], ext, &rm);
                out.put_u32(v.bits() as u32);
            }
        }
        (_, Operand::Reg(s)) => {
            let rm = operand_rm(&i.dest, name)?;
            let opcode = if size == 1 { base } else { base + 1 };
            put_modrm(out, &[opcode], check_reg(*s, name)?, &rm);
        }
        (Operand::Reg(d), _) => {
            let rm = operand_rm(&i.src, name)?;
            let opcode = if size == 1 { base + 2 } else { base + 3 };
            put_modrm(out, &[opcode], check_reg(*d, name)?, &rm);
        }
        _ => return Err(err(name, format!("{} {}, {}", name, i.dest, i.src))),
    }
    Ok(())
}

fn emit_mov(out: &mut CodeOut, i: &Instr) -> Result<()> {
    let size = i.size().current(false);
    match (&i.dest, &i.src) {
        (Operand::Reg(d), Operand::Const(v)) => {
            if size == 1 {
                put_modrm(out, &[0xC6], 0, &Rm::Reg(check_reg(*d, "mov")?));
                out.put_byte(v.bits() as u8);
            } else {
                out.put_byte(0xB8 | check_reg(*d, "mov")?);
                out.put_u32(v.bits() as u32);
            }
        }
        (Operand::Reg(d), Operand::Ref(r)) => {
            // Absolute target address as an immediate, kept fresh by the
            // collector.
            out.put_byte(0xB8 | check_reg(*d, "mov")?);
            out.put_ref(RefKind::RawPtr, RefTarget::Addr(r.addr), 4);
        }
        (Operand::Mem { .. }, Operand::Const(v)) => {
            let rm = operand_rm(&i.dest, "mov")?;
            if size == 1 {
                put_modrm(out, &[0xC6], 0, &rm);
                out.put_byte(v.bits() as u8);
            } else {
                put_modrm(out, &[0xC7], 0, &rm);
                out.put_u32(v.bits() as u32);
            }
        }
        (Operand::Mem { .. }, Operand::Ref(r)) => {
            let rm = operand_rm(&i.dest, "mov")?;
            put_modrm(out, &[0xC7], 0, &rm);
            out.put_ref(RefKind::RawPtr, RefTarget::Addr(r.addr), 4);
        }
        (_, Operand::Reg(s)) => {
            let rm = operand_rm(&i.dest, "mov")?;
            let opcode = if size == 1 { 0x88 } else { 0x89 };
            put_modrm(out, &[opcode], check_reg(*s, "mov")?, &rm);
        }
        (Operand::Reg(d), _) => {
            let rm = operand_rm(&i.src, "mov")?;
            let opcode = if size == 1 { 0x8A } else { 0x8B };
            put_modrm(out, &[opcode], check_reg(*d, "mov")?, &rm);
        }
        _ => return Err(err("mov", format!("mov {}, {}", i.dest, i.src))),
    }
    Ok(())
}

fn emit(i: &Instr, out: &mut CodeOut) -> Result<()> {
    let size = i.size().current(false);
    match i.op {
        OpCode::Nop => out.put_byte(0x90),
        OpCode::Mov => emit_mov(out, i)?,
        OpCode::Swap => {
            let Some(d) = i.dest.reg() else {
                return Err(err("swap", "destination must be a register"));
            };
            let rm = operand_rm(&i.src, "swap")?;
            let opcode = if size == 1 { 0x86 } else { 0x87 };
            put_modrm(out, &[opcode], check_reg(d, "swap")?, &rm);
        }
        OpCode::Push => match &i.src {
            Operand::Reg(r) => out.put_byte(0x50 | check_reg(*r, "push")?),
            Operand::Const(v) => {
                out.put_byte(0x68);
                out.put_u32(v.bits() as u32);
            }
            Operand::Ref(r) => {
                out.put_byte(0x68);
                out.put_ref(RefKind::RawPtr, RefTarget::Addr(r.addr), 4);
            }
            Operand::Mem { .. } => {
                let rm = operand_rm(&i.src, "push")?;
                put_modrm(out, &[0xFF], 6, &rm);
            }
            other => return Err(err("push", format!("push {}", other))),
        },
        OpCode::Pop => match &i.dest {
            Operand::Reg(r) => out.put_byte(0x58 | check_reg(*r, "pop")?),
            Operand::Mem { .. } => {
                let rm = operand_rm(&i.dest, "pop")?;
                put_modrm(out, &[0x8F], 0, &rm);
            }
            other => return Err(err("pop", format!("pop {}", other))),
        },
        OpCode::PushFlags => out.put_byte(0x9C),
        OpCode::PopFlags => out.put_byte(0x9D),
        OpCode::Lea => {
            let Some(d) = i.dest.reg() else {
                return Err(err("lea", "destination must be a register"));
            };
            let rm = operand_rm(&i.src, "lea")?;
            put_modrm(out, &[0x8D], check_reg(d, "lea")?, &rm);
        }
        OpCode::Jmp => {
            let cond = i.src.cond_flag().unwrap_or(CondFlag::Always);
            if cond == CondFlag::Never {
                return Ok(());
            }
            match (&i.dest, cond) {
                (Operand::Label(l), CondFlag::Always) => {
                    out.put_byte(0xE9);
                    out.put_rel_label(*l);
                }
                (Operand::Label(l), c) => {
                    let cc = c.cc().expect("always/never handled");
                    out.put_bytes(&[0x0F, 0x80 | cc]);
                    out.put_rel_label(*l);
                }
                (Operand::Reg(r), CondFlag::Always) => {
                    put_modrm(out, &[0xFF], 4, &Rm::Reg(check_reg(*r, "jmp")?));
                }
                _ => return Err(err("jmp", format!("jmp {}", i.dest))),
            }
        }
        OpCode::Call => match &i.src {
            Operand::Ref(r) => {
                // Near call, rel32 patched from the trailer.
                out.put_byte(0xE8);
                out.put_ref(RefKind::Relative, RefTarget::Addr(r.addr), 4);
            }
            Operand::Label(l) => {
                out.put_byte(0xE8);
                out.put_rel_label(*l);
            }
            Operand::Reg(r) => {
                put_modrm(out, &[0xFF], 2, &Rm::Reg(check_reg(*r, "call")?));
            }
            Operand::Mem { .. } => {
                let rm = operand_rm(&i.src, "call")?;
                put_modrm(out, &[0xFF], 2, &rm);
            }
            other => return Err(err("call", format!("call {}", other))),
        },
        OpCode::Ret => out.put_byte(0xC3),
        OpCode::SetCond => {
            let cc = i
                .src
                .cond_flag()
                .and_then(|c| c.cc())
                .ok_or_else(|| err("setCond", "missing condition"))?;
            let rm = operand_rm(&i.dest, "setCond")?;
            put_modrm(out, &[0x0F, 0x90 | cc], 0, &rm);
        }
        OpCode::Add => arith(out, i, 0x00, 0, "add")?,
        OpCode::Bor => arith(out, i, 0x08, 1, "bor")?,
        OpCode::Adc => arith(out, i, 0x10, 2, "adc")?,
        OpCode::Sbb => arith(out, i, 0x18, 3, "sbb")?,
        OpCode::Band => arith(out, i, 0x20, 4, "band")?,
        OpCode::Sub => arith(out, i, 0x28, 5, "sub")?,
        OpCode::Bxor => arith(out, i, 0x30, 6, "bxor")?,
        OpCode::Cmp => arith(out, i, 0x38, 7, "cmp")?,
        OpCode::Bnot => {
            let rm = operand_rm(&i.dest, "bnot")?;
            let opcode = if size == 1 { 0xF6 } else { 0xF7 };
            put_modrm(out, &[opcode], 2, &rm);
        }
        OpCode::Mul => {
            let Some(d) = i.dest.reg() else {
                return Err(err("mul", "destination must be a register"));
            };
            match &i.src {
                Operand::Const(v) => {
                    put_modrm(out, &[0x69], check_reg(d, "mul")?, &Rm::Reg(check_reg(d, "mul")?));
                    out.put_u32(v.bits() as u32);
                }
                _ => {
                    let rm = operand_rm(&i.src, "mul")?;
                    put_modrm(out, &[0x0F, 0xAF], check_reg(d, "mul")?, &rm);
                }
            }
        }
        OpCode::Idiv | OpCode::Imod | OpCode::Udiv | OpCode::Umod => {
            if !i.dest.is_none() {
                return Err(err("div", "division must be lowered first"));
            }
            let ext = if matches!(i.op, OpCode::Idiv | OpCode::Imod) {
                7
            } else {
                6
            };
            let size = i.src.size().current(false);
            let rm = operand_rm(&i.src, "div")?;
            let opcode = if size == 1 { 0xF6 } else { 0xF7 };
            put_modrm(out, &[opcode], ext, &rm);
        }
        OpCode::Cdq => out.put_byte(0x99),
        OpCode::RepMovsq => out.put_bytes(&[0xF3, 0xA5]),
        OpCode::Shl => emit_shift(out, i, 4)?,
        OpCode::Shr => emit_shift(out, i, 5)?,
        OpCode::Sar => emit_shift(out, i, 7)?,
        OpCode::Icast => emit_cast(out, i, true)?,
        OpCode::Ucast => emit_cast(out, i, false)?,
        OpCode::Fld
        | OpCode::Fild
        | OpCode::Fstp
        | OpCode::Fistp
        | OpCode::Faddp
        | OpCode::Fsubp
        | OpCode::Fmulp
        | OpCode::Fdivp
        | OpCode::Fcompp
        | OpCode::Fwait => emit_x87(out, i)?,
        OpCode::ThreadLocal => out.put_byte(0x64),
        OpCode::Dat => match &i.src {
            Operand::Const(v) => match v.size().current(false) {
                1 => out.put_byte(v.bits() as u8),
                4 => out.put_u32(v.bits() as u32),
                8 => out.put_u64(v.bits()),
                n => return Err(err("dat", format!("{} byte constant", n))),
            },
            Operand::Ref(r) => out.put_ref(RefKind::RawPtr, RefTarget::Addr(r.addr), 4),
            Operand::Label(l) => out.put_ref(RefKind::Inside, RefTarget::Inside(*l), 4),
            other => return Err(err("dat", format!("dat {}", other))),
        },
        OpCode::LblOffset => {
            let Some(l) = i.src.label() else {
                return Err(err("lblOffset", "missing label"));
            };
            out.put_u32(out.label_offset(l) as u32);
        }
        OpCode::Align | OpCode::AlignAs => {
            if let Operand::Const(Value::Nat(n)) = i.src {
                out.align(n as usize);
            }
        }
        OpCode::UnwindInfo => {
            out.put_ref(RefKind::UnwindInfo, RefTarget::Addr(0), 0);
        }
        other => {
            return Err(CodeError::InvalidOperand {
                op: "encode",
                detail: format!("{:?} must be removed by the transforms", other),
            })
        }
    }
    Ok(())
}

fn emit_shift(out: &mut CodeOut, i: &Instr, ext: u8) -> Result<()> {
    let size = i.size().current(false);
    let rm = operand_rm(&i.dest, "shift")?;
    match &i.src {
        Operand::Const(v) => {
            let opcode = if size == 1 { 0xC0 } else { 0xC1 };
            put_modrm(out, &[opcode], ext, &rm);
            out.put_byte(v.bits() as u8);
        }
        Operand::Reg(r) if r.id == RegId::Cx => {
            let opcode = if size == 1 { 0xD2 } else { 0xD3 };
            put_modrm(out, &[opcode], ext, &rm);
        }
        other => return Err(err("shift", format!("count {}", other))),
    }
    Ok(())
}

fn emit_cast(out: &mut CodeOut, i: &Instr, signed: bool) -> Result<()> {
    let Some(d) = i.dest.reg() else {
        return Err(err("cast", "destination must be a register"));
    };
    let to = d.size.current(false);
    let from = i.src.size().current(false);

    if from == to {
        return emit_mov(out, &crate::instr::mov(i.dest.clone(), i.src.clone()));
    }
    if from > to {
        let narrowed = match &i.src {
            Operand::Reg(r) => Operand::Reg(r.as_size(d.size)),
            Operand::Mem { base, offset, .. } => crate::operand::x_rel(d.size, *base, *offset),
            other => other.clone(),
        };
        return emit_mov(out, &crate::instr::mov(i.dest.clone(), narrowed));
    }

    let rm = operand_rm(&i.src, "cast")?;
    let opcode: &[u8] = match (signed, from) {
        (true, 1) => &[0x0F, 0xBE],
        (false, 1) => &[0x0F, 0xB6],
        _ => return Err(err("cast", format!("{} -> {} bytes", from, to))),
    };
    put_modrm(out, opcode, check_reg(d, "cast")?, &rm);
    Ok(())
}

fn emit_x87(out: &mut CodeOut, i: &Instr) -> Result<()> {
    let (op, operand) = match i.op {
        OpCode::Fld | OpCode::Fild => (i.op, &i.src),
        OpCode::Fstp | OpCode::Fistp => (i.op, &i.dest),
        _ => {
            let bytes: &[u8] = match i.op {
                OpCode::Faddp => &[0xDE, 0xC1],
                OpCode::Fsubp => &[0xDE, 0xE9],
                OpCode::Fmulp => &[0xDE, 0xC9],
                OpCode::Fdivp => &[0xDE, 0xF9],
                OpCode::Fcompp => &[0xDE, 0xD9],
                OpCode::Fwait => &[0x9B],
                _ => unreachable!(),
            };
            out.put_bytes(bytes);
            return Ok(());
        }
    };

    let size = operand.size().current(false);
    let rm = operand_rm(operand, "x87")?;
    let (opcode, ext) = match (op, size) {
        (OpCode::Fld, 4) => (0xD9, 0),
        (OpCode::Fld, 8) => (0xDD, 0),
        (OpCode::Fild, 4) => (0xDB, 0),
        (OpCode::Fild, 8) => (0xDF, 5),
        (OpCode::Fstp, 4) => (0xD9, 3),
        (OpCode::Fstp, 8) => (0xDD, 3),
        (OpCode::Fistp, 4) => (0xDB, 3),
        (OpCode::Fistp, 8) => (0xDF, 7),
        _ => return Err(err("x87", format!("{} bytes", size))),
    };
    put_modrm(out, &[opcode], ext, &rm);
    Ok(())
}
