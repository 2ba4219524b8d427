//! x86-64 instruction encoder.
//!
//! Encodes a fully lowered listing in two passes: a label pass computing
//! byte offsets (repeated until the offsets stabilize) and an output
//! pass producing the final bytes. Operands that reference the world
//! outside the blob become reference-trailer entries; branches inside
//! the blob are plain rel32.

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

/// The r/m side of a ModRM byte.
enum Rm {
    Reg(u8),
    Mem { base: u8, disp: i32 },
    /// Rip-relative slot patched through the trailer.
    RipSlot { kind: RefKind, target: RefTarget },
}

fn err(op: &'static str, detail: impl Into<String>) -> CodeError {
    CodeError::UnsupportedAddressing {
        op,
        detail: detail.into(),
    }
}

fn reg_rm(r: Reg) -> Rm {
    Rm::Reg(r.id.encoding())
}

fn mem_rm(base: RegId, disp: i32) -> Rm {
    Rm::Mem {
        base: base.encoding(),
        disp,
    }
}

fn operand_rm(op: &Operand, name: &'static str) -> Result<Rm> {
    match op {
        Operand::Reg(r) => Ok(reg_rm(*r)),
        Operand::Mem { base, offset, .. } => Ok(mem_rm(*base, *offset)),
        Operand::Ref(r) => Ok(Rm::RipSlot {
            kind: RefKind::RelativeHere,
            target: RefTarget::Addr(r.addr),
        }),
        other => Err(err(name, format!("not an r/m operand: {}", other))),
    }
}

/// Emit REX, opcode bytes, ModRM and addressing for one instruction.
///
/// `size` selects REX.W; `force_rex` is needed for the byte registers
/// spl/bpl/sil/dil.
fn put_modrm(
    out: &mut CodeOut,
    size: u32,
    opcode: &[u8],
    reg_field: u8,
    rm: &Rm,
    force_rex: bool,
) {
    let w = size == 8;
    let (b, x) = match rm {
        Rm::Reg(enc) => (*enc, 0),
        Rm::Mem { base, .. } => (*base, 0),
        Rm::RipSlot { .. } => (0, 0),
    };
    let rex = 0x40
        | (u8::from(w) << 3)
        | (((reg_field >> 3) & 1) << 2)
        | (((x >> 3) & 1) << 1)
        | ((b >> 3) & 1);
    if rex != 0x40 || force_rex {
        out.put_byte(rex);
    }
    out.put_bytes(opcode);

    match rm {
        Rm::Reg(enc) => {
            out.put_byte(0xC0 | ((reg_field & 7) << 3) | (enc & 7));
        }
        Rm::Mem { base, disp } => {
            let base_low = base & 7;
            let need_sib = base_low == 4; // rsp/r12
            let small = *disp >= -128 && *disp <= 127;
            // [rbp]/[r13] with mod 00 means rip-relative; always use a
            // displacement for base 5.
            let modbits = if *disp == 0 && base_low != 5 {
                0x00
            } else if small {
                0x40
            } else {
                0x80
            };
            out.put_byte(modbits | ((reg_field & 7) << 3) | if need_sib { 4 } else { base_low });
            if need_sib {
                out.put_byte(0x24); // scale 1, no index, base in low bits.
            }
            if modbits == 0x40 {
                out.put_byte(*disp as i8 as u8);
            } else if modbits == 0x80 {
                out.put_u32(*disp as u32);
            }
        }
        Rm::RipSlot { kind, target } => {
            out.put_byte(((reg_field & 7) << 3) | 0x05);
            out.put_ref(*kind, *target, 4);
        }
    }
}

fn byte_force_rex(op: &Operand, size: u32) -> bool {
    if size != 1 {
        return false;
    }
    match op {
        Operand::Reg(r) => matches!(
            r.id,
            RegId::StackPtr | RegId::FramePtr | RegId::Si | RegId::Di
        ),
        _ => false,
    }
}

/// The classic arithmetic group: add/or/adc/sbb/and/sub/xor/cmp.
fn arith(out: &mut CodeOut, i: &Instr, base: u8, ext: u8, name: &'static str) -> Result<()> {
    let size = i.size().current(true);
    let force = byte_force_rex(&i.dest, size) || byte_force_rex(&i.src, size);

    match (&i.dest, &i.src) {
        (_, Operand::Const(v)) => {
            let rm = operand_rm(&i.dest, name)?;
            if size == 1 {
                put_modrm(out, size, &[0x80], ext, &rm, force);
                out.put_byte(v.bits() as u8);
            } else {
                put_modrm(out, size, &[0x81], ext, &rm, force);
                out.put_u32(v.bits() as u32);
            }
        }
        (_, Operand::Reg(s)) => {
            let rm = operand_rm(&i.dest, name)?;
            let opcode = if size == 1 { base } else { base + 1 };
            put_modrm(out, size, &[opcode], s.id.encoding(), &rm, force);
        }
        (Operand::Reg(d), _) => {
            let rm = operand_rm(&i.src, name)?;
            let opcode = if size == 1 { base + 2 } else { base + 3 };
            put_modrm(out, size, &[opcode], d.id.encoding(), &rm, force);
        }
        _ => return Err(err(name, format!("{} {}, {}", name, i.dest, i.src))),
    }
    Ok(())
}

fn emit_mov(out: &mut CodeOut, i: &Instr) -> Result<()> {
    let size = i.size().current(true);
    let force = byte_force_rex(&i.dest, size) || byte_force_rex(&i.src, size);

    // SSE moves when either side is an xmm register.
    let dest_xmm = i.dest.reg().map(|r| r.id.is_xmm()).unwrap_or(false);
    let src_xmm = i.src.reg().map(|r| r.id.is_xmm()).unwrap_or(false);
    if dest_xmm || src_xmm {
        let prefix = if size == 8 { 0xF2 } else { 0xF3 };
        out.put_byte(prefix);
        if dest_xmm {
            let rm = operand_rm(&i.src, "mov")?;
            put_modrm(out, 4, &[0x0F, 0x10], i.dest.reg().unwrap().id.encoding(), &rm, false);
        } else {
            let rm = operand_rm(&i.dest, "mov")?;
            put_modrm(out, 4, &[0x0F, 0x11], i.src.reg().unwrap().id.encoding(), &rm, false);
        }
        return Ok(());
    }

    match (&i.dest, &i.src) {
        (Operand::Reg(d), Operand::Const(v)) => {
            let bits = v.bits();
            let fits_i32 = bits as i64 >= i32::MIN as i64 && bits as i64 <= i32::MAX as i64;
            if size == 8 && !fits_i32 {
                // movabs.
                let enc = d.id.encoding();
                out.put_byte(0x48 | ((enc >> 3) & 1));
                out.put_byte(0xB8 | (enc & 7));
                out.put_u64(bits);
            } else if size == 1 {
                put_modrm(out, size, &[0xC6], 0, &reg_rm(*d), force);
                out.put_byte(bits as u8);
            } else {
                put_modrm(out, size, &[0xC7], 0, &reg_rm(*d), force);
                out.put_u32(bits as u32);
            }
        }
        (Operand::Mem { .. }, Operand::Const(v)) => {
            let rm = operand_rm(&i.dest, "mov")?;
            if size == 1 {
                put_modrm(out, size, &[0xC6], 0, &rm, force);
                out.put_byte(v.bits() as u8);
            } else {
                put_modrm(out, size, &[0xC7], 0, &rm, force);
                out.put_u32(v.bits() as u32);
            }
        }
        (_, Operand::Reg(s)) => {
            let rm = operand_rm(&i.dest, "mov")?;
            let opcode = if size == 1 { 0x88 } else { 0x89 };
            put_modrm(out, size, &[opcode], s.id.encoding(), &rm, force);
        }
        (Operand::Reg(d), _) => {
            // Includes rip-relative loads of trailer slots (refs).
            let rm = operand_rm(&i.src, "mov")?;
            let opcode = if size == 1 { 0x8A } else { 0x8B };
            put_modrm(out, size, &[opcode], d.id.encoding(), &rm, force);
        }
        _ => return Err(err("mov", format!("mov {}, {}", i.dest, i.src))),
    }
    Ok(())
}

fn emit_push(out: &mut CodeOut, i: &Instr) -> Result<()> {
    match &i.src {
        Operand::Reg(r) => {
            let enc = r.id.encoding();
            if enc >= 8 {
                out.put_byte(0x41);
            }
            out.put_byte(0x50 | (enc & 7));
        }
        Operand::Const(v) => {
            out.put_byte(0x68);
            out.put_u32(v.bits() as u32);
        }
        Operand::Mem { base, offset, .. } => {
            put_modrm(out, 4, &[0xFF], 6, &mem_rm(*base, *offset), false);
        }
        Operand::Ref(r) => {
            // Pushes the target address stored in the trailer slot.
            put_modrm(
                out,
                4,
                &[0xFF],
                6,
                &Rm::RipSlot {
                    kind: RefKind::RelativeHere,
                    target: RefTarget::Addr(r.addr),
                },
                false,
            );
        }
        other => return Err(err("push", format!("push {}", other))),
    }
    Ok(())
}

fn emit_pop(out: &mut CodeOut, i: &Instr) -> Result<()> {
    match &i.dest {
        Operand::Reg(r) => {
            let enc = r.id.encoding();
            if enc >= 8 {
                out.put_byte(0x41);
            }
            out.put_byte(0x58 | (enc & 7));
        }
        Operand::Mem { base, offset, .. } => {
            put_modrm(out, 4, &[0x8F], 0, &mem_rm(*base, *offset), false);
        }
        other => return Err(err("pop", format!("pop {}", other))),
    }
    Ok(())
}

fn emit_jmp(out: &mut CodeOut, i: &Instr) -> Result<()> {
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
            let cc = c.cc().expect("always/never handled above");
            out.put_bytes(&[0x0F, 0x80 | cc]);
            out.put_rel_label(*l);
        }
        (Operand::Reg(r), CondFlag::Always) => {
            put_modrm(out, 4, &[0xFF], 4, &reg_rm(*r), false);
        }
        (Operand::Mem { base, offset, .. }, CondFlag::Always) => {
            put_modrm(out, 4, &[0xFF], 4, &mem_rm(*base, *offset), false);
        }
        _ => return Err(err("jmp", format!("jmp {} ({})", i.dest, cond))),
    }
    Ok(())
}

fn emit_call(out: &mut CodeOut, i: &Instr) -> Result<()> {
    match &i.src {
        Operand::Ref(r) => {
            // call [rip+disp] through the trailer slot holding the
            // target, so the collector can move the target freely.
            put_modrm(
                out,
                4,
                &[0xFF],
                2,
                &Rm::RipSlot {
                    kind: RefKind::RelativeHere,
                    target: RefTarget::Addr(r.addr),
                },
                false,
            );
        }
        Operand::Label(l) => {
            out.put_byte(0xE8);
            out.put_rel_label(*l);
        }
        Operand::Reg(r) => {
            put_modrm(out, 4, &[0xFF], 2, &reg_rm(*r), false);
        }
        Operand::Mem { base, offset, .. } => {
            put_modrm(out, 4, &[0xFF], 2, &mem_rm(*base, *offset), false);
        }
        other => return Err(err("call", format!("call {}", other))),
    }
    Ok(())
}

fn emit_shift(out: &mut CodeOut, i: &Instr, ext: u8) -> Result<()> {
    let size = i.size().current(true);
    let rm = operand_rm(&i.dest, "shift")?;
    let force = byte_force_rex(&i.dest, size);
    match &i.src {
        Operand::Const(v) => {
            let opcode = if size == 1 { 0xC0 } else { 0xC1 };
            put_modrm(out, size, &[opcode], ext, &rm, force);
            out.put_byte(v.bits() as u8);
        }
        Operand::Reg(r) if r.id == RegId::Cx => {
            let opcode = if size == 1 { 0xD2 } else { 0xD3 };
            put_modrm(out, size, &[opcode], ext, &rm, force);
        }
        other => return Err(err("shift", format!("count {}", other))),
    }
    Ok(())
}

fn emit_cast(out: &mut CodeOut, i: &Instr, signed: bool) -> Result<()> {
    let Some(d) = i.dest.reg() else {
        return Err(err("cast", "destination must be a register"));
    };
    let to = d.size.current(true);
    let from = i.src.size().current(true);
    let force = byte_force_rex(&i.src, from);

    if from == to {
        return emit_mov(out, &crate::instr::mov(i.dest.clone(), i.src.clone()));
    }
    if from > to {
        // Narrowing: plain move of the low part.
        let narrowed = match &i.src {
            Operand::Reg(r) => Operand::Reg(r.as_size(d.size)),
            Operand::Mem { base, offset, .. } => crate::operand::x_rel(d.size, *base, *offset),
            other => other.clone(),
        };
        return emit_mov(out, &crate::instr::mov(i.dest.clone(), narrowed));
    }

    let rm = operand_rm(&i.src, "cast")?;
    match (signed, from, to) {
        (true, 1, _) => put_modrm(out, to, &[0x0F, 0xBE], d.id.encoding(), &rm, force),
        (true, 4, 8) => put_modrm(out, 8, &[0x63], d.id.encoding(), &rm, force),
        (false, 1, _) => put_modrm(out, to, &[0x0F, 0xB6], d.id.encoding(), &rm, force),
        (false, 4, 8) => {
            // A 32-bit move zero-extends to 64 bits.
            let narrow = Reg::new(d.id, crate::size::Size::INT);
            let opcode = 0x8B;
            put_modrm(out, 4, &[opcode], narrow.id.encoding(), &rm, false);
        }
        _ => return Err(err("cast", format!("{} -> {} bytes", from, to))),
    }
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

    let size = operand.size().current(true);
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
    put_modrm(out, 4, &[opcode], ext, &rm, false);
    Ok(())
}

fn emit_dat(out: &mut CodeOut, i: &Instr) -> Result<()> {
    match &i.src {
        Operand::Const(v) => match v.size().current(true) {
            1 => out.put_byte(v.bits() as u8),
            4 => out.put_u32(v.bits() as u32),
            8 => out.put_u64(v.bits()),
            n => return Err(err("dat", format!("{} byte constant", n))),
        },
        Operand::Ref(r) => out.put_ref(RefKind::RawPtr, RefTarget::Addr(r.addr), 8),
        Operand::Label(l) => out.put_ref(RefKind::Inside, RefTarget::Inside(*l), 8),
        other => return Err(err("dat", format!("dat {}", other))),
    }
    Ok(())
}

fn emit(i: &Instr, out: &mut CodeOut) -> Result<()> {
    let size = i.size().current(true);
    match i.op {
        OpCode::Nop => out.put_byte(0x90),
        OpCode::Mov => emit_mov(out, i)?,
        OpCode::Swap => {
            let Some(d) = i.dest.reg() else {
                return Err(err("swap", "destination must be a register"));
            };
            let rm = operand_rm(&i.src, "swap")?;
            let opcode = if size == 1 { 0x86 } else { 0x87 };
            put_modrm(out, size, &[opcode], d.id.encoding(), &rm, false);
        }
        OpCode::Push => emit_push(out, i)?,
        OpCode::Pop => emit_pop(out, i)?,
        OpCode::PushFlags => out.put_byte(0x9C),
        OpCode::PopFlags => out.put_byte(0x9D),
        OpCode::Lea => {
            let Some(d) = i.dest.reg() else {
                return Err(err("lea", "destination must be a register"));
            };
            if let Operand::Label(l) = &i.src {
                // Rip-relative address of an internal label; used by
                // prologs to take their own code base.
                let enc = d.id.encoding();
                out.put_byte(0x48 | (((enc >> 3) & 1) << 2));
                out.put_byte(0x8D);
                out.put_byte(((enc & 7) << 3) | 0x05);
                out.put_rel_label(*l);
            } else {
                let rm = operand_rm(&i.src, "lea")?;
                put_modrm(out, 8, &[0x8D], d.id.encoding(), &rm, false);
            }
        }
        OpCode::Jmp => emit_jmp(out, i)?,
        OpCode::Call => emit_call(out, i)?,
        OpCode::Ret => out.put_byte(0xC3),
        OpCode::SetCond => {
            let cc = i
                .src
                .cond_flag()
                .and_then(|c| c.cc())
                .ok_or_else(|| err("setCond", "missing condition"))?;
            let rm = operand_rm(&i.dest, "setCond")?;
            let force = byte_force_rex(&i.dest, 1);
            put_modrm(out, 1, &[0x0F, 0x90 | cc], 0, &rm, force);
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
            put_modrm(out, size, &[opcode], 2, &rm, byte_force_rex(&i.dest, size));
        }
        OpCode::Mul => {
            let Some(d) = i.dest.reg() else {
                return Err(err("mul", "destination must be a register"));
            };
            match &i.src {
                Operand::Const(v) => {
                    put_modrm(out, size, &[0x69], d.id.encoding(), &reg_rm(d), false);
                    out.put_u32(v.bits() as u32);
                }
                _ => {
                    let rm = operand_rm(&i.src, "mul")?;
                    put_modrm(out, size, &[0x0F, 0xAF], d.id.encoding(), &rm, false);
                }
            }
        }
        OpCode::Idiv | OpCode::Imod | OpCode::Udiv | OpCode::Umod => {
            // Hardware form: dest empty, divisor in src.
            if !i.dest.is_none() {
                return Err(err("div", "division must be lowered first"));
            }
            let ext = if matches!(i.op, OpCode::Idiv | OpCode::Imod) {
                7
            } else {
                6
            };
            let size = i.src.size().current(true);
            let rm = operand_rm(&i.src, "div")?;
            let opcode = if size == 1 { 0xF6 } else { 0xF7 };
            put_modrm(out, size, &[opcode], ext, &rm, false);
        }
        OpCode::Cdq => {
            if i.src.size().current(true) == 8 {
                out.put_byte(0x48);
            }
            out.put_byte(0x99);
        }
        OpCode::RepMovsq => out.put_bytes(&[0xF3, 0x48, 0xA5]),
        OpCode::UnwindInfo => {
            // No bytes; registers the current position in the trailer.
            out.put_ref(RefKind::UnwindInfo, RefTarget::Addr(0), 0);
        }
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
        OpCode::Dat => emit_dat(out, i)?,
        OpCode::LblOffset => {
            let Some(l) = i.src.label() else {
                return Err(err("lblOffset", "missing label"));
            };
            out.put_u64(out.label_offset(l) as u64);
        }
        OpCode::Align => {
            if let Operand::Const(Value::Nat(n)) = i.src {
                out.align(n as usize);
            }
        }
        OpCode::AlignAs => {
            if let Operand::Const(Value::Nat(n)) = i.src {
                out.align(n as usize);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::*;
    use crate::operand::*;
    use crate::reg::{regs, Reg, RegId};
    use crate::size::Size;

    fn enc(build: impl FnOnce(&mut Listing)) -> Vec<u8> {
        let mut l = Listing::new();
        build(&mut l);
        encode(&l).unwrap().bytes
    }

    #[test]
    fn test_ret() {
        assert_eq!(enc(|l| l.push(ret())), vec![0xC3]);
    }

    #[test]
    fn test_mov_reg_imm32() {
        // mov eax, 7 -> C7 C0 07 00 00 00
        let b = enc(|l| l.push(mov(regs::EAX, int_const(7))));
        assert_eq!(b, vec![0xC7, 0xC0, 7, 0, 0, 0]);
    }

    #[test]
    fn test_movabs() {
        // mov rax, 0x1_0000_0000 -> 48 B8 imm64
        let b = enc(|l| l.push(mov(regs::RAX, long_const(0x1_0000_0000))));
        assert_eq!(&b[..2], &[0x48, 0xB8]);
        assert_eq!(&b[2..10], &0x1_0000_0000u64.to_le_bytes());
    }

    #[test]
    fn test_mov_mem_store() {
        // mov [rbp-8], eax -> 89 45 F8
        let b = enc(|l| {
            l.push(mov(int_rel(RegId::FramePtr, -8), regs::EAX));
        });
        assert_eq!(b, vec![0x89, 0x45, 0xF8]);
    }

    #[test]
    fn test_mov_rsp_base_uses_sib() {
        // mov eax, [rsp+8] -> 8B 44 24 08
        let b = enc(|l| {
            l.push(mov(regs::EAX, int_rel(RegId::StackPtr, 8)));
        });
        assert_eq!(b, vec![0x8B, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn test_add_reg_reg_64() {
        // add rax, rbx -> 48 01 D8
        let b = enc(|l| l.push(add(regs::RAX, Operand::Reg(regs::EBX.as_size(Size::LONG)))));
        assert_eq!(b, vec![0x48, 0x01, 0xD8]);
    }

    #[test]
    fn test_add_imm() {
        // add eax, 5 -> 81 C0 05 00 00 00
        let b = enc(|l| l.push(add(regs::EAX, int_const(5))));
        assert_eq!(b, vec![0x81, 0xC0, 5, 0, 0, 0]);
    }

    #[test]
    fn test_push_pop_r8() {
        let b = enc(|l| {
            l.push(push(Reg::new(RegId::R10, Size::PTR)));
            l.push(pop(Reg::new(RegId::R10, Size::PTR)));
        });
        assert_eq!(b, vec![0x41, 0x52, 0x41, 0x5A]);
    }

    #[test]
    fn test_jmp_backward() {
        // l: nop; jmp l -> 90 E9 FA FF FF FF
        let b = enc(|l| {
            let t = l.label();
            l.push_label(t);
            l.push(nop());
            l.push(jmp(t));
        });
        assert_eq!(b, vec![0x90, 0xE9]
            .into_iter()
            .chain((-6i32).to_le_bytes())
            .collect::<Vec<u8>>());
    }

    #[test]
    fn test_jcc_forward() {
        let b = enc(|l| {
            let t = l.label();
            l.push(jmp_cond(t, crate::cond::CondFlag::Equal));
            l.push(nop());
            l.push_label(t);
            l.push(ret());
        });
        // 0F 84 rel32(=1 skips the nop), 90, C3.
        assert_eq!(&b[..2], &[0x0F, 0x84]);
        assert_eq!(&b[2..6], &1i32.to_le_bytes());
    }

    #[test]
    fn test_call_ref_uses_trailer_slot() {
        let mut l = Listing::new();
        l.push(call(Operand::Ref(ExtRef::new("f", 0x1234))));
        l.push(ret());
        let code = encode(&l).unwrap();
        // FF 15 <rel32 slot> C3
        assert_eq!(&code.bytes[..2], &[0xFF, 0x15]);
        assert_eq!(code.refs.len(), 1);
        assert_eq!(code.refs[0].offset, 2);
        assert!(matches!(code.refs[0].target, RefTarget::Addr(0x1234)));
    }

    #[test]
    fn test_cdq_cqo() {
        let b = enc(|l| {
            l.push(Instr::new(
                OpCode::Cdq,
                Operand::None,
                Operand::Reg(regs::EAX),
            ));
            l.push(Instr::new(
                OpCode::Cdq,
                Operand::None,
                Operand::Reg(regs::RAX),
            ));
        });
        assert_eq!(b, vec![0x99, 0x48, 0x99]);
    }

    #[test]
    fn test_idiv_hardware_form() {
        // idiv ecx -> F7 F9
        let b = enc(|l| {
            l.push(Instr::new(
                OpCode::Idiv,
                Operand::None,
                Operand::Reg(regs::ECX),
            ));
        });
        assert_eq!(b, vec![0xF7, 0xF9]);
    }

    #[test]
    fn test_movsx_byte_to_int() {
        // movsx eax, bl -> 0F BE C3
        let b = enc(|l| {
            l.push(icast(regs::EAX, Operand::Reg(regs::EBX.as_size(Size::BYTE))));
        });
        assert_eq!(b, vec![0x0F, 0xBE, 0xC3]);
    }

    #[test]
    fn test_ucast_int_to_long_is_mov32() {
        // mov eax, ecx zero-extends -> 8B C1
        let b = enc(|l| {
            l.push(ucast(regs::RAX, Operand::Reg(regs::ECX)));
        });
        assert_eq!(b, vec![0x8B, 0xC1]);
    }

    #[test]
    fn test_dat_ref_records_trailer_entry() {
        let mut l = Listing::new();
        l.push(dat(Operand::Ref(ExtRef::new("data", 0xABCD))));
        let code = encode(&l).unwrap();
        assert_eq!(code.bytes.len(), 8);
        assert_eq!(code.refs.len(), 1);
        assert_eq!(code.refs[0].kind, RefKind::RawPtr);
    }

    #[test]
    fn test_meta_label_offset() {
        let mut l = Listing::new();
        l.push(nop());
        let meta = l.meta();
        l.push_label(meta);
        l.push(dat(ptr_const(0)));
        let code = encode(&l).unwrap();
        assert_eq!(code.meta_offset(), 1);
    }

    #[test]
    fn test_lea_of_label_is_rip_relative() {
        // l: nop; lea rax, [l] -> 90 48 8D 05 rel32(-8)
        let b = enc(|l| {
            let t = l.label();
            l.push_label(t);
            l.push(nop());
            l.push(lea(regs::RAX, Operand::Label(t)));
        });
        assert_eq!(&b[1..4], &[0x48, 0x8D, 0x05]);
        assert_eq!(&b[4..8], &(-8i32).to_le_bytes());
    }

    #[test]
    fn test_shift_by_cl() {
        // shl eax, cl -> D3 E0
        let b = enc(|l| {
            l.push(shl(regs::EAX, Operand::Reg(regs::CL)));
        });
        assert_eq!(b, vec![0xD3, 0xE0]);
    }

    #[test]
    fn test_byte_store_dil_needs_rex() {
        // mov [rbp-1], dil -> 40 88 7D FF
        let b = enc(|l| {
            l.push(mov(
                byte_rel(RegId::FramePtr, -1),
                Operand::Reg(Reg::new(RegId::Di, Size::BYTE)),
            ));
        });
        assert_eq!(b, vec![0x40, 0x88, 0x7D, 0xFF]);
    }

}
