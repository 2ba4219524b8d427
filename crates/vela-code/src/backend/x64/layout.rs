//! Frame and calling-convention materialization for x86-64 (System V).
//!
//! Runs after legalization. Expands `prolog`/`epilog`, `begin`/`end`,
//! the `fnParam`/`fnCall` family and `fnRet`, replaces every variable
//! operand with a frame-pointer-relative access, and appends the
//! variable metadata table at the `meta()` label.
//!
//! Frame shape (offsets relative to rbp):
//!
//! ```text
//!   [rbp+16+]  stack parameters (seventh integer argument onward)
//!   [rbp+8]    return address
//!   [rbp+0]    saved rbp
//!   [rbp-8]    active part id
//!   [rbp-16]   code base of this function (exception-aware frames)
//!   [rbp-24..] saved callee registers, hidden result pointer, variables
//! ```
//!
//! The active-part and code-base slot positions are shared with the
//! cleanup path through [`PART_ID_OFFSET`] and [`OWNER_OFFSET`]; prolog
//! layout and unwinding must never disagree on them.

use crate::error::{CodeError, Result};
use crate::instr::{self, Instr, OpCode};
use crate::listing::{FreeOpt, Listing, Part, Var};
use crate::operand::{self, Operand, Value};
use crate::reg::{Reg, RegId, RegSet};
use crate::size::Size;
use crate::typedesc::TypeDesc;
use crate::used_regs::used_registers;
use rustc_hash::FxHashMap;

/// Offset of the active part id slot. The cleanup walk reads the slot
/// through this same constant.
pub const PART_ID_OFFSET: i32 = -8;

/// Offset of the slot holding this function's code base, filled by
/// exception-aware prologs so a frame record resolves back to its
/// binary. Directly below the part id slot.
pub const OWNER_OFFSET: i32 = PART_ID_OFFSET - 8;

/// Integer argument registers, in order.
pub const INT_ARGS: [RegId; 6] = [
    RegId::Di,
    RegId::Si,
    RegId::Dx,
    RegId::Cx,
    RegId::R8,
    RegId::R9,
];

/// Floating-point argument registers, in order.
pub const FLOAT_ARGS: [RegId; 8] = [
    RegId::Xmm0,
    RegId::Xmm1,
    RegId::Xmm2,
    RegId::Xmm3,
    RegId::Xmm4,
    RegId::Xmm5,
    RegId::Xmm6,
    RegId::Xmm7,
];

/// Callee-saved registers the prolog may need to spill.
pub const CALLEE_SAVED: [RegId; 5] = [
    RegId::Bx,
    RegId::R12,
    RegId::R13,
    RegId::R14,
    RegId::R15,
];

/// Computed frame layout for one listing.
pub struct FrameLayout {
    /// Frame offset of every variable, by id.
    pub var_offsets: FxHashMap<u32, i32>,
    /// Callee-saved registers spilled by the prolog, with their slots.
    pub saved: Vec<(RegId, i32)>,
    /// Slot holding the hidden result pointer, for by-pointer results.
    pub result_ptr_offset: Option<i32>,
    /// Bytes subtracted from rsp; 16-byte aligned.
    pub frame_size: u32,
}

impl FrameLayout {
    pub fn compute(src: &Listing, written: RegSet) -> FrameLayout {
        let mut cursor: i32 = 16; // part id and code base slots.

        let mut saved = Vec::new();
        for id in CALLEE_SAVED {
            if written.contains(id) {
                saved.push((id, -cursor - 8));
                cursor += 8;
            }
        }

        let result_ptr_offset = if src.result.is_complex() {
            cursor += 8;
            Some(-cursor)
        } else {
            None
        };

        let mut var_offsets = FxHashMap::default();
        for v in src.all_vars() {
            let bytes = src.var_size(v).current(true).max(8);
            let bytes = (bytes + 7) & !7;
            cursor += bytes as i32;
            var_offsets.insert(v.key(), -cursor);
        }

        FrameLayout {
            var_offsets,
            saved,
            result_ptr_offset,
            frame_size: vela_util::align_up(cursor as usize, 16) as u32,
        }
    }

    pub fn var_offset(&self, v: Var) -> i32 {
        self.var_offsets[&v.key()]
    }
}

/// One pending call argument.
struct PendingParam {
    desc: TypeDesc,
    value: Operand,
    /// `value` is a pointer to the actual datum.
    by_ref: bool,
}

struct Tfm<'a> {
    src: &'a Listing,
    frame: FrameLayout,
    current: Part,
    params: Vec<PendingParam>,
    /// Marks offset zero of the blob; exception-aware prologs store its
    /// address as the frame's code base.
    base_label: crate::label::Label,
}

pub fn run(src: &Listing) -> Result<Listing> {
    let usage = used_registers(src);
    let frame = FrameLayout::compute(src, usage.all);
    let mut to = src.create_shell();
    let base_label = to.label();
    to.push_label(base_label);
    let mut tfm = Tfm {
        src,
        frame,
        current: src.root().part(),
        params: Vec::new(),
        base_label,
    };

    for i in 0..src.count() {
        for &l in src.labels(i) {
            to.push_label(l);
        }
        let instr = resolve_vars(&tfm.frame, src.at(i));
        tfm.line(&mut to, &instr)?;
    }
    for &l in src.labels(src.count()) {
        to.push_label(l);
    }

    tfm.metadata(&mut to);
    Ok(to)
}

/// Replace variable operands with `[rbp + offset]` accesses.
fn resolve_vars(frame: &FrameLayout, i: &Instr) -> Instr {
    let fix = |op: &Operand| -> Operand {
        match op {
            Operand::Var { var, offset, size } => operand::x_rel(
                *size,
                RegId::FramePtr,
                frame.var_offset(*var) + offset,
            ),
            other => other.clone(),
        }
    };
    i.altered(fix(&i.dest), fix(&i.src))
}

fn reg(id: RegId, size: Size) -> Operand {
    Operand::Reg(Reg::new(id, size))
}

fn rsp() -> Operand {
    reg(RegId::StackPtr, Size::PTR)
}

fn rbp() -> Operand {
    reg(RegId::FramePtr, Size::PTR)
}

impl Tfm<'_> {
    fn line(&mut self, to: &mut Listing, i: &Instr) -> Result<()> {
        match i.op {
            OpCode::Prolog => self.prolog(to),
            OpCode::Epilog => {
                let save = self.current;
                self.epilog(to)?;
                self.current = save;
                Ok(())
            }
            OpCode::Begin => self.begin(to, i.src.part().expect("begin without part")),
            OpCode::End => self.end(to, i.src.part().expect("end without part"), false),
            OpCode::FnParam => {
                self.params.push(PendingParam {
                    desc: match &i.dest {
                        Operand::Desc(d) => d.clone(),
                        _ => TypeDesc::ptr(),
                    },
                    value: i.src.clone(),
                    by_ref: false,
                });
                Ok(())
            }
            OpCode::FnParamRef => {
                self.params.push(PendingParam {
                    desc: match &i.dest {
                        Operand::Desc(d) => d.clone(),
                        _ => TypeDesc::ptr(),
                    },
                    value: i.src.clone(),
                    by_ref: true,
                });
                Ok(())
            }
            OpCode::FnCall | OpCode::FnCallRef => {
                self.call(to, i.src.clone(), i.op == OpCode::FnCallRef)
            }
            OpCode::FnRet => self.fn_ret(to, i.src.clone()),
            OpCode::FnRetRef => self.fn_ret_ref(to, i.src.clone()),
            OpCode::Preserve => {
                to.push(instr::mov(i.dest.clone(), i.src.clone()));
                Ok(())
            }
            OpCode::ThreadLocal => Ok(()),
            _ => {
                to.push(i.clone());
                Ok(())
            }
        }
    }

    fn prolog(&mut self, to: &mut Listing) -> Result<()> {
        to.push(instr::push(Reg::new(RegId::FramePtr, Size::PTR)));
        to.push(instr::mov(rbp(), rsp()));
        if self.frame.frame_size > 0 {
            to.push(instr::sub(
                rsp(),
                operand::ptr_const(self.frame.frame_size as usize),
            ));
        }

        for &(id, offset) in &self.frame.saved {
            to.push(instr::mov(
                operand::ptr_rel(RegId::FramePtr, offset),
                reg(id, Size::PTR),
            ));
        }

        // Incoming parameters: spill every one into its frame slot.
        let mut next_int = 0usize;
        let mut next_float = 0usize;
        if let Some(off) = self.frame.result_ptr_offset {
            to.push(instr::mov(
                operand::ptr_rel(RegId::FramePtr, off),
                reg(INT_ARGS[0], Size::PTR),
            ));
            next_int = 1;
        }
        let mut stack_off = 16i32;
        for p in self.src.all_params() {
            let desc = self.src.param_desc(p).cloned().unwrap_or(TypeDesc::ptr());
            let slot = self.frame.var_offset(p);
            let size = desc.size();
            let by_ptr = desc.is_complex() || size.current(true) > 8;

            if desc.is_float() && !by_ptr {
                if next_float < FLOAT_ARGS.len() {
                    to.push(store_float_param(FLOAT_ARGS[next_float], slot, size));
                    next_float += 1;
                } else {
                    self.spill_stack_param(to, slot, size, &mut stack_off);
                }
            } else {
                let sz = if by_ptr { Size::PTR } else { size };
                if next_int < INT_ARGS.len() {
                    to.push(instr::mov(
                        operand::x_rel(sz, RegId::FramePtr, slot),
                        reg(INT_ARGS[next_int], sz),
                    ));
                    next_int += 1;
                } else {
                    self.spill_stack_param(to, slot, sz, &mut stack_off);
                }
            }
        }

        // Activate the root block.
        to.push(instr::mov(
            operand::int_rel(RegId::FramePtr, PART_ID_OFFSET),
            operand::int_const(self.src.root().part().key() as i32),
        ));
        self.zero_block_vars(to, self.src.root().part());

        if self.src.exception_aware() {
            // Record the code base in the frame and link the frame into
            // the runtime unwind chain.
            to.push(instr::lea(
                reg(RegId::Ax, Size::PTR),
                Operand::Label(self.base_label),
            ));
            to.push(instr::mov(
                operand::ptr_rel(RegId::FramePtr, OWNER_OFFSET),
                reg(RegId::Ax, Size::PTR),
            ));
            to.push(instr::mov(reg(INT_ARGS[0], Size::PTR), rbp()));
            to.push(instr::call(Operand::Ref(operand::ExtRef::new(
                "unwind_push_frame",
                crate::binary::unwind::push_frame_addr(),
            ))));
        }

        self.current = self.src.root().part();
        Ok(())
    }

    /// Copy one parameter from the caller's stack area into its slot,
    /// through rax.
    fn spill_stack_param(&self, to: &mut Listing, slot: i32, size: Size, stack_off: &mut i32) {
        let sz = size;
        to.push(instr::mov(
            reg(RegId::Ax, sz),
            operand::x_rel(sz, RegId::FramePtr, *stack_off),
        ));
        to.push(instr::mov(operand::x_rel(sz, RegId::FramePtr, slot), reg(RegId::Ax, sz)));
        *stack_off += 8;
    }

    /// Zero the variables of the part's whole block so destructors can
    /// always run on initialized memory.
    fn zero_block_vars(&self, to: &mut Listing, part: Part) {
        let block = self.src.first(part);
        for v in self.src.block_vars(block) {
            if self.src.is_param(v) {
                continue;
            }
            let off = self.frame.var_offset(v);
            let bytes = self.src.var_size(v).current(true);
            self.zero_mem(to, off, bytes);
        }
    }

    fn zero_mem(&self, to: &mut Listing, base: i32, bytes: u32) {
        let mut at = 0u32;
        while at + 8 <= bytes {
            to.push(instr::mov(
                operand::x_rel(Size::LONG, RegId::FramePtr, base + at as i32),
                operand::long_const(0),
            ));
            at += 8;
        }
        while at + 4 <= bytes {
            to.push(instr::mov(
                operand::int_rel(RegId::FramePtr, base + at as i32),
                operand::int_const(0),
            ));
            at += 4;
        }
        while at < bytes {
            to.push(instr::mov(
                operand::byte_rel(RegId::FramePtr, base + at as i32),
                operand::byte_const(0),
            ));
            at += 1;
        }
    }

    fn begin(&mut self, to: &mut Listing, part: Part) -> Result<()> {
        let block = self.src.first(part);
        if part == block.part() {
            // Entering the block: its parent part must be active.
            if self.src.parent(block) != self.current {
                return Err(CodeError::BlockBeginError);
            }
            self.zero_block_vars(to, part);
        } else if self.src.prev_part(part) != self.current {
            return Err(CodeError::BlockBeginError);
        }

        to.push(instr::mov(
            operand::int_rel(RegId::FramePtr, PART_ID_OFFSET),
            operand::int_const(part.key() as i32),
        ));
        self.current = part;
        Ok(())
    }

    fn end(&mut self, to: &mut Listing, part: Part, preserve_ax: bool) -> Result<()> {
        let block = self.src.first(part);
        if self.src.first(self.current) != block {
            return Err(CodeError::BlockEndError);
        }

        self.destroy_block(to, part, preserve_ax)?;

        let parent = self.src.parent(block);
        let parent_id = if parent.valid() {
            parent.key() as i32
        } else {
            self.src.root().part().key() as i32
        };
        to.push(instr::mov(
            operand::int_rel(RegId::FramePtr, PART_ID_OFFSET),
            operand::int_const(parent_id),
        ));
        self.current = if parent.valid() {
            parent
        } else {
            self.src.root().part()
        };
        Ok(())
    }

    /// Run block-exit destructors for every part of the block, in
    /// reverse declaration order, innermost part first.
    fn destroy_block(&mut self, to: &mut Listing, part: Part, preserve_ax: bool) -> Result<()> {
        let block = self.src.first(part);
        let mut work = Vec::new();
        let mut p = block.part();
        while p.valid() {
            for v in self.src.part_vars(p) {
                work.push(v);
            }
            p = self.src.next(p);
        }

        let mut pushed_ax = false;
        for &v in work.iter().rev() {
            let opt = self.src.free_opt(v);
            let free_fn = self.src.free_fn(v).clone();
            if free_fn.is_none() || !opt.contains(FreeOpt::ON_BLOCK_EXIT) {
                continue;
            }
            if preserve_ax && !pushed_ax {
                to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
                pushed_ax = true;
            }
            self.destroy_var(to, v, free_fn, opt)?;
        }
        if pushed_ax {
            to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
        }
        Ok(())
    }

    /// Emit one destructor call and re-zero the slot.
    fn destroy_var(
        &mut self,
        to: &mut Listing,
        v: Var,
        free_fn: Operand,
        opt: FreeOpt,
    ) -> Result<()> {
        let off = self.frame.var_offset(v);
        let size = self.src.var_size(v);
        let bytes = size.current(true);

        let arg = reg(INT_ARGS[0], if opt.contains(FreeOpt::PTR) { Size::PTR } else { size });
        if opt.contains(FreeOpt::INDIRECTION) {
            // The slot holds a pointer to the value; the destructor
            // receives that pointer.
            to.push(instr::mov(
                reg(INT_ARGS[0], Size::PTR),
                operand::ptr_rel(RegId::FramePtr, off),
            ));
        } else if opt.contains(FreeOpt::PTR) {
            to.push(instr::lea(
                reg(INT_ARGS[0], Size::PTR),
                operand::ptr_rel(RegId::FramePtr, off),
            ));
        } else if bytes <= 8 {
            to.push(instr::mov(arg, operand::x_rel(size, RegId::FramePtr, off)));
        } else {
            return Err(CodeError::InvalidOperand {
                op: "destructor",
                detail: format!("variable of {} bytes destroyed by value", bytes),
            });
        }

        self.emit_call_target(to, free_fn)?;
        self.zero_mem(to, off, bytes);
        Ok(())
    }

    fn epilog(&mut self, to: &mut Listing) -> Result<()> {
        // Destroy every active block from the innermost outward. The
        // listing may continue after an early return, so the caller
        // restores the tracked part.
        let mut part = self.current;
        loop {
            let block = self.src.first(part);
            self.destroy_block(to, part, true)?;
            let parent = self.src.parent(block);
            if !parent.valid() {
                break;
            }
            part = parent;
        }

        for &(id, offset) in &self.frame.saved {
            to.push(instr::mov(
                reg(id, Size::PTR),
                operand::ptr_rel(RegId::FramePtr, offset),
            ));
        }

        if self.src.exception_aware() {
            // Unlink the frame. The result registers are live here, so
            // they ride out the call on the stack.
            to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
            to.push(instr::sub(rsp(), operand::ptr_const(24)));
            to.push(instr::mov(
                operand::x_rel(Size::DOUBLE, RegId::StackPtr, 0),
                reg(RegId::Xmm0, Size::DOUBLE),
            ));
            to.push(instr::call(Operand::Ref(operand::ExtRef::new(
                "unwind_pop_frame",
                crate::binary::unwind::pop_frame_addr(),
            ))));
            to.push(instr::mov(
                reg(RegId::Xmm0, Size::DOUBLE),
                operand::x_rel(Size::DOUBLE, RegId::StackPtr, 0),
            ));
            to.push(instr::add(rsp(), operand::ptr_const(24)));
            to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
        }

        to.push(instr::mov(rsp(), rbp()));
        to.push(instr::pop(Reg::new(RegId::FramePtr, Size::PTR)));
        Ok(())
    }

    fn fn_ret(&mut self, to: &mut Listing, src: Operand) -> Result<()> {
        if !src.is_none() {
            let size = src.size();
            if self.src.result.is_float() {
                to.push(Instr::new(
                    OpCode::Fld,
                    Operand::None,
                    src,
                ));
                // Result expected in xmm0 by the ABI; x87 return values
                // are stored through memory by the caller instead, so
                // the store lands in the red zone and reloads to xmm0.
                to.push(Instr::new(
                    OpCode::Fstp,
                    operand::x_rel(size, RegId::StackPtr, -16),
                    Operand::None,
                ));
                to.push(instr::mov(
                    reg(RegId::Xmm0, size),
                    operand::x_rel(size, RegId::StackPtr, -16),
                ));
            } else {
                let sz = src.size();
                to.push(instr::mov(reg(RegId::Ax, sz), src));
            }
        }
        let save = self.current;
        self.epilog(to)?;
        self.current = save;
        to.push(instr::ret());
        Ok(())
    }

    fn fn_ret_ref(&mut self, to: &mut Listing, src: Operand) -> Result<()> {
        let Some(dest_off) = self.frame.result_ptr_offset else {
            return Err(CodeError::InvalidOperand {
                op: "fnRetRef",
                detail: "listing result is not returned by pointer".into(),
            });
        };
        let bytes = self.src.result.size().current(true) as usize;

        // rep movsq from *src to *hidden.
        to.push(instr::mov(reg(RegId::Si, Size::PTR), src));
        to.push(instr::mov(
            reg(RegId::Di, Size::PTR),
            operand::ptr_rel(RegId::FramePtr, dest_off),
        ));
        to.push(instr::mov(
            reg(RegId::Cx, Size::PTR),
            operand::ptr_const(bytes.div_ceil(8)),
        ));
        to.push(Instr::new(OpCode::RepMovsq, Operand::None, Operand::None));
        // The ABI returns the hidden pointer in rax.
        to.push(instr::mov(
            reg(RegId::Ax, Size::PTR),
            operand::ptr_rel(RegId::FramePtr, dest_off),
        ));

        let save = self.current;
        self.epilog(to)?;
        self.current = save;
        to.push(instr::ret());
        Ok(())
    }

    /// Expand one call: copy complex arguments, stage values through the
    /// stack, load the argument registers, call, release.
    fn call(&mut self, to: &mut Listing, target: Operand, by_ref_target: bool) -> Result<()> {
        let params = std::mem::take(&mut self.params);

        // Classify.
        let mut int_slots: Vec<&PendingParam> = Vec::new();
        let mut float_slots: Vec<&PendingParam> = Vec::new();
        let mut stack_slots: Vec<&PendingParam> = Vec::new();
        let mut copies: Vec<(&PendingParam, usize)> = Vec::new(); // (param, temp offset)
        let mut temp_bytes = 0usize;

        for p in &params {
            let wide = p.desc.size().current(true) > 8;
            if p.desc.is_complex() || wide {
                // Passed by pointer to a fresh stack copy.
                let sz = (p.desc.size().current(true) as usize + 7) & !7;
                copies.push((p, temp_bytes));
                temp_bytes += sz;
                int_slots.push(p);
            } else if p.desc.is_float() {
                if float_slots.len() < FLOAT_ARGS.len() {
                    float_slots.push(p);
                } else {
                    stack_slots.push(p);
                }
            } else if int_slots.len() < INT_ARGS.len() {
                int_slots.push(p);
            } else {
                stack_slots.push(p);
            }
        }

        // Complex values are copied below the argument area.
        if temp_bytes > 0 {
            to.push(instr::sub(rsp(), operand::ptr_const(temp_bytes)));
            for (p, off) in &copies {
                if p.by_ref {
                    to.push(instr::mov(reg(RegId::Si, Size::PTR), p.value.clone()));
                } else {
                    to.push(instr::lea(reg(RegId::Si, Size::PTR), p.value.clone()));
                }
                to.push(instr::lea(
                    reg(RegId::Di, Size::PTR),
                    operand::ptr_rel(RegId::StackPtr, *off as i32),
                ));
                let words = (p.desc.size().current(true) as usize + 7) / 8;
                to.push(instr::mov(
                    reg(RegId::Cx, Size::PTR),
                    operand::ptr_const(words),
                ));
                to.push(Instr::new(OpCode::RepMovsq, Operand::None, Operand::None));
            }
        }

        // Load the call target early, before the argument registers are
        // live; r10 is free in this convention.
        let use_r10 = by_ref_target || !matches!(target, Operand::Ref(_) | Operand::Label(_));
        if use_r10 {
            to.push(instr::mov(reg(RegId::R10, Size::PTR), target.clone()));
        }

        // Stack arguments, rightmost first, with an alignment pad when
        // their count is odd.
        let pad = stack_slots.len() % 2 == 1;
        if pad {
            to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
        }
        for p in stack_slots.iter().rev() {
            self.push_param_value(to, p)?;
        }

        // Register arguments: push every plain value right-to-left, then
        // pop into place left-to-right. Copied aggregates get their
        // pointer with lea afterwards, once rsp is back at the temps.
        let mut pushed: Vec<usize> = Vec::new(); // indexes into int_slots
        for (idx, p) in int_slots.iter().enumerate().rev() {
            if copies.iter().any(|(c, _)| std::ptr::eq(*c, *p)) {
                continue;
            }
            self.push_param_value(to, p)?;
            pushed.push(idx);
        }
        pushed.reverse();
        for &idx in &pushed {
            to.push(instr::pop(Reg::new(INT_ARGS[idx], Size::PTR)));
        }
        let after_args = stack_slots.len() + usize::from(pad);
        for (p, off) in &copies {
            let idx = int_slots
                .iter()
                .position(|q| std::ptr::eq(*q, *p))
                .expect("copied argument lost");
            to.push(instr::lea(
                reg(INT_ARGS[idx], Size::PTR),
                operand::ptr_rel(RegId::StackPtr, (*off + after_args * 8) as i32),
            ));
        }

        // Floating-point arguments straight from their sources; sources
        // are frame relative or constants, never argument registers.
        for (i, p) in float_slots.iter().enumerate() {
            let size = p.desc.size();
            match &p.value {
                Operand::Const(v) => {
                    to.push(instr::push(operand::ptr_const(v.bits() as usize)));
                    to.push(instr::mov(
                        reg(FLOAT_ARGS[i], size),
                        operand::x_rel(size, RegId::StackPtr, 0),
                    ));
                    to.push(instr::add(rsp(), operand::ptr_const(8)));
                }
                other => {
                    to.push(instr::mov(reg(FLOAT_ARGS[i], size), other.clone()));
                }
            }
        }

        if use_r10 {
            to.push(instr::call(reg(RegId::R10, Size::PTR)));
        } else {
            to.push(instr::call(target));
        }

        let release = after_args * 8 + temp_bytes;
        if release > 0 {
            to.push(instr::add(rsp(), operand::ptr_const(release)));
        }
        Ok(())
    }

    /// Push one by-value parameter as a full word.
    fn push_param_value(&self, to: &mut Listing, p: &PendingParam) -> Result<()> {
        let size = p.desc.size();
        let bytes = size.current(true);
        if p.by_ref {
            // Dereference the pointer and push the value.
            to.push(instr::mov(reg(RegId::R11, Size::PTR), p.value.clone()));
            to.push(instr::push(operand::x_rel(
                Size::PTR,
                RegId::R11,
                0,
            )));
            return Ok(());
        }
        match &p.value {
            Operand::Const(Value::Float(f)) => {
                to.push(instr::push(operand::ptr_const(f.to_bits() as usize)));
            }
            Operand::Const(v) => {
                let bits = v.bits();
                if bits as i64 >= i32::MIN as i64 && bits as i64 <= i32::MAX as i64 {
                    to.push(instr::push(operand::int_const(bits as i32)));
                } else {
                    to.push(instr::mov(reg(RegId::R11, Size::PTR), p.value.clone()));
                    to.push(instr::push(Reg::new(RegId::R11, Size::PTR)));
                }
            }
            Operand::Reg(r) => {
                to.push(instr::push(Reg::new(r.id, Size::PTR)));
            }
            Operand::Mem { base, offset, .. } => {
                if bytes == 8 {
                    to.push(instr::push(operand::x_rel(Size::LONG, *base, *offset)));
                } else {
                    // Narrow loads widen through r11 so the pushed word
                    // is well defined.
                    let r = Reg::new(RegId::R11, size);
                    to.push(instr::mov(Operand::Reg(r), operand::x_rel(size, *base, *offset)));
                    to.push(instr::push(Reg::new(RegId::R11, Size::PTR)));
                }
            }
            Operand::Ref(_) | Operand::Label(_) => {
                to.push(instr::push(p.value.clone()));
            }
            other => {
                return Err(CodeError::InvalidOperand {
                    op: "fnParam",
                    detail: format!("cannot pass {}", other),
                })
            }
        }
        Ok(())
    }

    /// Call `target`, which is already var-resolved.
    fn emit_call_target(&self, to: &mut Listing, target: Operand) -> Result<()> {
        match target {
            Operand::Ref(_) | Operand::Label(_) => to.push(instr::call(target)),
            other => {
                to.push(instr::mov(reg(RegId::R10, Size::PTR), other));
                to.push(instr::call(reg(RegId::R10, Size::PTR)));
            }
        }
        Ok(())
    }

    /// Append the variable metadata table at the `meta()` label: one
    /// `(destructor, frame offset)` pair per variable id.
    fn metadata(&self, to: &mut Listing) {
        to.push(instr::align(8));
        to.push_label(to.meta());
        if self.src.exception_aware() {
            // Register the table with the platform unwinder's side
            // table so cleanup can find this frame's metadata.
            to.push(Instr::new(OpCode::UnwindInfo, Operand::None, Operand::None));
        }
        for v in self.src.all_vars() {
            match self.src.free_fn(v) {
                Operand::Ref(r) => to.push(instr::dat(Operand::Ref(r.clone()))),
                Operand::Const(c) => to.push(instr::dat(operand::ptr_const(c.bits() as usize))),
                _ => to.push(instr::dat(operand::ptr_const(0))),
            }
            let off = self.frame.var_offset(v);
            to.push(instr::dat(operand::ptr_const(off as isize as usize)));
        }
    }
}

/// Store one incoming xmm argument into its frame slot.
fn store_float_param(id: RegId, slot: i32, size: Size) -> Instr {
    instr::mov(
        operand::x_rel(size, RegId::FramePtr, slot),
        Operand::Reg(Reg::new(id, size)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::*;
    use crate::operand::int_const;
    use crate::reg::regs;

    fn lower(build: impl FnOnce(&mut Listing)) -> Listing {
        let mut l = Listing::new();
        build(&mut l);
        run(&l).unwrap()
    }

    #[test]
    fn test_prolog_epilog_frame() {
        let out = lower(|l| {
            l.push(prolog());
            l.push(fn_ret(Operand::None));
        });
        // push rbp; mov rbp, rsp; sub rsp, n; part id; ...; ret.
        assert_eq!(out.at(0).op, OpCode::Push);
        assert_eq!(out.at(1).op, OpCode::Mov);
        assert_eq!(out.at(2).op, OpCode::Sub);
        assert_eq!(out.entries().last().unwrap().instr.op, OpCode::Ret);
    }

    #[test]
    fn test_vars_become_frame_relative() {
        let out = lower(|l| {
            let p = l.root().part();
            let v = l.create_int_var(p);
            l.push(prolog());
            l.push(mov(
                Operand::Var {
                    var: v,
                    offset: 0,
                    size: Size::INT,
                },
                int_const(3),
            ));
            l.push(fn_ret(Operand::None));
        });
        assert!(out.entries().iter().any(|e| matches!(
            e.instr.dest,
            Operand::Mem {
                base: RegId::FramePtr,
                offset,
                ..
            } if offset < 0
        ) && e.instr.src == int_const(3)));
    }

    #[test]
    fn test_param_spilled_from_rdi() {
        let out = lower(|l| {
            let _p = l.create_int_param();
            l.push(prolog());
            l.push(fn_ret(Operand::None));
        });
        assert!(out.entries().iter().any(|e| {
            e.instr.op == OpCode::Mov
                && matches!(e.instr.dest, Operand::Mem { base: RegId::FramePtr, .. })
                && e.instr.src.reg().map(|r| r.id) == Some(RegId::Di)
        }));
    }

    #[test]
    fn test_part_id_written_at_begin() {
        let out = lower(|l| {
            let b = l.create_block(l.root().part());
            l.push(prolog());
            l.push(begin(b.part()));
            l.push(end(b.part()));
            l.push(fn_ret(Operand::None));
        });
        let writes: Vec<i32> = out
            .entries()
            .iter()
            .filter_map(|e| match (&e.instr.dest, &e.instr.src) {
                (
                    Operand::Mem {
                        base: RegId::FramePtr,
                        offset,
                        ..
                    },
                    Operand::Const(Value::Int(v)),
                ) if *offset == PART_ID_OFFSET => Some(*v),
                _ => None,
            })
            .collect();
        // Root, block, back to root.
        assert_eq!(writes, vec![0, 1, 0]);
    }

    #[test]
    fn test_begin_out_of_order_fails() {
        let mut l = Listing::new();
        let b1 = l.create_block(l.root().part());
        let b2 = l.create_block(b1.part());
        l.push(prolog());
        // b2 begun without b1.
        l.push(begin(b2.part()));
        assert!(matches!(run(&l), Err(CodeError::BlockBeginError)));
    }

    #[test]
    fn test_end_wrong_block_fails() {
        let mut l = Listing::new();
        let b1 = l.create_block(l.root().part());
        let b2 = l.create_block(l.root().part());
        l.push(prolog());
        l.push(begin(b1.part()));
        l.push(end(b2.part()));
        assert!(matches!(run(&l), Err(CodeError::BlockEndError)));
    }

    #[test]
    fn test_call_loads_arg_registers() {
        let out = lower(|l| {
            l.push(prolog());
            l.push(fn_param(TypeDesc::int(), int_const(10)));
            l.push(fn_param(TypeDesc::int(), int_const(20)));
            l.push(fn_call(
                Operand::Ref(crate::operand::ExtRef::new("callee", 0x1234)),
                TypeDesc::int(),
            ));
            l.push(fn_ret(Operand::Reg(regs::EAX)));
        });
        // Two pushes, then pops into rdi and rsi in order.
        let pops: Vec<RegId> = out
            .entries()
            .iter()
            .filter(|e| e.instr.op == OpCode::Pop)
            .filter_map(|e| e.instr.dest.reg().map(|r| r.id))
            .filter(|id| INT_ARGS.contains(id))
            .collect();
        assert_eq!(pops, vec![RegId::Di, RegId::Si]);
        assert!(out.entries().iter().any(|e| e.instr.op == OpCode::Call));
    }

    #[test]
    fn test_exception_prolog_links_frame() {
        let out = lower(|l| {
            let p = l.root().part();
            let _v = l.create_var_free(
                p,
                Size::INT,
                Operand::Ref(crate::operand::ExtRef::new("dtor", 0x9999)),
                FreeOpt::ON_EXCEPTION,
            );
            l.push(prolog());
            l.push(fn_ret(Operand::None));
        });
        // The code base lands in the owner slot, the frame base goes to
        // the chain, and the epilog unlinks it again.
        assert!(out.entries().iter().any(|e| {
            e.instr.op == OpCode::Lea && matches!(e.instr.src, Operand::Label(_))
        }));
        assert!(out.entries().iter().any(|e| matches!(
            e.instr.dest,
            Operand::Mem {
                base: RegId::FramePtr,
                offset: OWNER_OFFSET,
                ..
            }
        )));
        assert!(out
            .entries()
            .iter()
            .any(|e| matches!(&e.instr.src, Operand::Ref(r) if r.name == "unwind_push_frame")));
        assert!(out
            .entries()
            .iter()
            .any(|e| matches!(&e.instr.src, Operand::Ref(r) if r.name == "unwind_pop_frame")));
    }

    #[test]
    fn test_plain_function_skips_frame_chain() {
        let out = lower(|l| {
            l.push(prolog());
            l.push(fn_ret(Operand::None));
        });
        assert!(!out
            .entries()
            .iter()
            .any(|e| matches!(&e.instr.src, Operand::Ref(r) if r.name.starts_with("unwind_"))));
    }

    #[test]
    fn test_metadata_table_emitted() {
        let out = lower(|l| {
            let p = l.root().part();
            let _v = l.create_var_free(
                p,
                Size::INT,
                Operand::Ref(crate::operand::ExtRef::new("dtor", 0x5555)),
                FreeOpt::ON_EXCEPTION,
            );
            l.push(prolog());
            l.push(fn_ret(Operand::None));
        });
        // Two data words per variable appear after the meta label.
        let dats = out
            .entries()
            .iter()
            .filter(|e| e.instr.op == OpCode::Dat)
            .count();
        assert_eq!(dats, 2);
    }

    #[test]
    fn test_block_exit_destructor_called() {
        let out = lower(|l| {
            let b = l.create_block(l.root().part());
            let _v = l.create_var_free(
                b.part(),
                Size::INT,
                Operand::Ref(crate::operand::ExtRef::new("dtor", 0x7777)),
                FreeOpt::ON_BLOCK_EXIT,
            );
            l.push(prolog());
            l.push(begin(b.part()));
            l.push(end(b.part()));
            l.push(fn_ret(Operand::None));
        });
        assert!(out.entries().iter().any(|e| e.instr.op == OpCode::Call));
    }
}
