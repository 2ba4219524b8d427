//! Register usage analysis.
//!
//! For each instruction, computes the set of registers whose values must
//! be preserved across it, by backward iteration: writes kill, reads
//! revive. Terminator-like instructions clear the live set. The union of
//! written registers over the whole listing is what the prolog must
//! spill from the callee-saved file. `StackPtr` and `FramePtr` are
//! ignored throughout.

use crate::instr::{DestMode, Instr, OpCode};
use crate::listing::Listing;
use crate::operand::Operand;
use crate::reg::{RegId, RegSet};

/// Usage information for one listing.
pub struct UsedRegs {
    /// Per instruction: registers live across it.
    pub used: Vec<RegSet>,
    /// Every register the listing writes.
    pub all: RegSet,
}

fn add_operand(set: &mut RegSet, op: &Operand) {
    if let Operand::Reg(r) = op {
        if r.id != RegId::StackPtr && r.id != RegId::FramePtr {
            set.add(r.id);
        }
    }
}

fn remove_operand(set: &mut RegSet, op: &Operand) {
    if let Operand::Reg(r) = op {
        set.remove(r.id);
    }
}

/// Base registers of memory operands are reads.
fn add_indirect(set: &mut RegSet, op: &Operand) {
    if let Operand::Mem { base, .. } = op {
        if *base != RegId::StackPtr && *base != RegId::FramePtr {
            set.add(*base);
        }
    }
}

/// Process one instruction backward. Returns the registers it writes.
fn process(instr: &Instr, used: &mut RegSet) -> RegSet {
    let mut write = RegSet::empty();

    match instr.op {
        OpCode::Jmp | OpCode::Begin | OpCode::End | OpCode::Prolog => {
            used.clear();
            return write;
        }
        OpCode::Call | OpCode::FnCall | OpCode::FnCallRef => {
            used.clear();
            // Target operands still count as uses below.
        }
        _ => {}
    }

    add_indirect(used, &instr.src);
    add_indirect(used, &instr.dest);
    add_operand(used, &instr.src);

    let mode = instr.op.dest_mode();
    if matches!(mode, DestMode::Write | DestMode::ReadWrite) {
        add_operand(&mut write, &instr.dest);
        remove_operand(used, &instr.dest);
    }
    if matches!(mode, DestMode::Read | DestMode::ReadWrite) {
        add_operand(used, &instr.dest);
    }

    write
}

/// Compute per-instruction preserved sets and the union of written
/// registers.
pub fn used_registers(src: &Listing) -> UsedRegs {
    let mut used = vec![RegSet::empty(); src.count()];
    let mut now = RegSet::empty();
    let mut all = RegSet::empty();

    for i in (0..src.count()).rev() {
        all = all.union(process(src.at(i), &mut now));
        used[i] = now;
    }

    // A register the listing never writes cannot need preserving.
    for set in used.iter_mut() {
        *set = set.intersect(all);
    }

    UsedRegs { used, all }
}

/// Just the union of written registers.
pub fn all_used_registers(src: &Listing) -> RegSet {
    used_registers(src).all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::*;
    use crate::operand::*;
    use crate::reg::regs;

    #[test]
    fn test_written_registers_collected() {
        let mut l = Listing::new();
        l.push(mov(regs::EAX, int_const(1)));
        l.push(mov(regs::EBX, int_const(2)));

        let u = used_registers(&l);
        assert!(u.all.contains(RegId::Ax));
        assert!(u.all.contains(RegId::Bx));
        assert!(!u.all.contains(RegId::Cx));
    }

    #[test]
    fn test_live_across_instruction() {
        let mut l = Listing::new();
        l.push(mov(regs::EAX, int_const(1)));
        l.push(mov(regs::EBX, int_const(2)));
        l.push(add(regs::EBX, regs::EAX));

        let u = used_registers(&l);
        // eax is written at 0 and read at 2: live across instruction 1.
        assert!(u.used[1].contains(RegId::Ax));
        // ebx is written at 1; nothing needs it before that.
        assert!(!u.used[0].contains(RegId::Bx));
    }

    #[test]
    fn test_write_kills_liveness() {
        let mut l = Listing::new();
        l.push(mov(regs::EAX, int_const(1)));
        l.push(mov(regs::EAX, int_const(2)));
        l.push(add(regs::EBX, regs::EAX));

        let u = used_registers(&l);
        // The value written at 0 is dead: it is overwritten at 1 before
        // the read at 2.
        assert!(!u.used[0].contains(RegId::Ax));
        assert!(!u.used[1].contains(RegId::Ax));
        assert!(u.used[2].contains(RegId::Ax));
    }

    #[test]
    fn test_memory_base_is_a_use() {
        let mut l = Listing::new();
        l.push(mov(regs::PTR_B, ptr_const(0x1000)));
        l.push(mov(regs::EAX, int_rel(RegId::Bx, 8)));

        let u = used_registers(&l);
        assert!(u.used[1].contains(RegId::Bx));
    }

    #[test]
    fn test_terminators_clear() {
        let mut l = Listing::new();
        let end = l.label();
        l.push(mov(regs::EAX, int_const(1)));
        l.push(jmp(end));
        l.push(add(regs::EBX, regs::EAX));
        l.push_label(end);
        l.push(ret());

        let u = used_registers(&l);
        // The jump clears the backward state, so nothing appears live
        // across the first mov.
        assert!(u.used[0].is_empty());
    }

    #[test]
    fn test_frame_registers_ignored() {
        let mut l = Listing::new();
        l.push(mov(regs::PTR_FRAME, Operand::Reg(regs::PTR_STACK)));
        let u = used_registers(&l);
        assert!(!u.all.contains(RegId::FramePtr));
        assert!(!u.all.contains(RegId::StackPtr));
    }
}
