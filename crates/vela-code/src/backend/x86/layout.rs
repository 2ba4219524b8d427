//! Frame and calling-convention materialization for x86-32 (cdecl).
//!
//! Parameters arrive on the stack and are addressed where they are;
//! locals and bookkeeping live below the frame pointer:
//!
//! ```text
//!   [ebp+8+]   parameters, left to right
//!   [ebp+4]    return address
//!   [ebp+0]    saved ebp
//!   [ebp-4]    active part id
//!   [ebp-8]    owner slot (reserved for the installed binary)
//!   [ebp-12]   exception handler address     (exception-aware only)
//!   [ebp-16]   previous handler in the chain (exception-aware only)
//!   below      saved callee registers, variables
//! ```
//!
//! The handler record layout is shared with the runtime through the
//! constants below; the cleanup path derives the previous-handler slot
//! from the handler slot instead of repeating the offset.

use crate::error::{CodeError, Result};
use crate::instr::{self, Instr, OpCode};
use crate::listing::{FreeOpt, Listing, Part, Var};
use crate::operand::{self, Operand};
use crate::reg::{Reg, RegId, RegSet};
use crate::size::Size;
use crate::typedesc::TypeDesc;
use crate::used_regs::used_registers;
use rustc_hash::FxHashMap;

use super::split64::{high32, low32};

/// Active part id slot.
pub const PART_ID_OFFSET: i32 = -4;
/// Reserved owner slot.
pub const OWNER_OFFSET: i32 = -8;
/// Exception handler address slot.
pub const SEH_HANDLER_OFFSET: i32 = -12;
/// Previous handler, always directly below the handler slot.
pub const SEH_PREV_OFFSET: i32 = SEH_HANDLER_OFFSET - 4;

/// Callee-saved registers in the 32-bit convention.
pub const CALLEE_SAVED: [RegId; 3] = [RegId::Bx, RegId::Si, RegId::Di];

pub struct FrameLayout {
    pub var_offsets: FxHashMap<u32, i32>,
    pub saved: Vec<(RegId, i32)>,
    pub frame_size: u32,
}

impl FrameLayout {
    pub fn compute(src: &Listing, written: RegSet) -> FrameLayout {
        // Bookkeeping words below ebp come first.
        let mut cursor: i32 = if src.exception_aware() { 16 } else { 8 };

        let mut saved = Vec::new();
        for id in CALLEE_SAVED {
            if written.contains(id) {
                cursor += 4;
                saved.push((id, -cursor));
            }
        }

        let mut var_offsets = FxHashMap::default();

        // Parameters stay where the caller pushed them.
        let mut param_off = 8i32;
        for p in src.all_params() {
            let bytes = src.var_size(p).current(false).max(4);
            var_offsets.insert(p.key(), param_off);
            param_off += ((bytes + 3) & !3) as i32;
        }

        for v in src.all_vars() {
            if src.is_param(v) {
                continue;
            }
            let bytes = src.var_size(v).current(false).max(4);
            let bytes = (bytes + 3) & !3;
            cursor += bytes as i32;
            var_offsets.insert(v.key(), -cursor);
        }

        FrameLayout {
            var_offsets,
            saved,
            frame_size: vela_util::align_up(cursor as usize, 16) as u32,
        }
    }

    pub fn var_offset(&self, v: Var) -> i32 {
        self.var_offsets[&v.key()]
    }
}

struct PendingParam {
    #[allow(dead_code)]
    desc: TypeDesc,
    value: Operand,
    by_ref: bool,
}

struct Tfm<'a> {
    src: &'a Listing,
    frame: FrameLayout,
    current: Part,
    params: Vec<PendingParam>,
}

pub fn run(src: &Listing) -> Result<Listing> {
    let usage = used_registers(src);
    let frame = FrameLayout::compute(src, usage.all);
    let mut to = src.create_shell();
    let mut tfm = Tfm {
        src,
        frame,
        current: src.root().part(),
        params: Vec::new(),
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

fn resolve_vars(frame: &FrameLayout, i: &Instr) -> Instr {
    let fix = |op: &Operand| -> Operand {
        match op {
            Operand::Var { var, offset, size } => {
                operand::x_rel(*size, RegId::FramePtr, frame.var_offset(*var) + offset)
            }
            other => other.clone(),
        }
    };
    i.altered(fix(&i.dest), fix(&i.src))
}

fn reg(id: RegId, size: Size) -> Operand {
    Operand::Reg(Reg::new(id, size))
}

fn esp() -> Operand {
    reg(RegId::StackPtr, Size::PTR)
}

fn ebp() -> Operand {
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
            OpCode::End => self.end(to, i.src.part().expect("end without part")),
            OpCode::FnParam | OpCode::FnParamRef => {
                self.params.push(PendingParam {
                    desc: match &i.dest {
                        Operand::Desc(d) => d.clone(),
                        _ => TypeDesc::ptr(),
                    },
                    value: i.src.clone(),
                    by_ref: i.op == OpCode::FnParamRef,
                });
                Ok(())
            }
            OpCode::FnCall | OpCode::FnCallRef => self.call(to, i.src.clone()),
            OpCode::FnRet => self.fn_ret(to, i.src.clone()),
            OpCode::FnRetRef => self.fn_ret_ref(to, i.src.clone()),
            OpCode::Preserve => {
                to.push(instr::mov(i.dest.clone(), i.src.clone()));
                Ok(())
            }
            _ => {
                to.push(i.clone());
                Ok(())
            }
        }
    }

    fn prolog(&mut self, to: &mut Listing) -> Result<()> {
        to.push(instr::push(Reg::new(RegId::FramePtr, Size::PTR)));
        to.push(instr::mov(ebp(), esp()));
        if self.frame.frame_size > 0 {
            to.push(instr::sub(
                esp(),
                operand::ptr_const(self.frame.frame_size as usize),
            ));
        }

        to.push(instr::mov(
            operand::int_rel(RegId::FramePtr, OWNER_OFFSET),
            operand::int_const(0),
        ));

        if self.src.exception_aware() {
            // Install the handler record, then link the frame base into
            // the chain kept by the runtime; the handler and
            // previous-handler slots sit at fixed offsets from it.
            to.push(instr::mov(
                operand::ptr_rel(RegId::FramePtr, SEH_HANDLER_OFFSET),
                Operand::Ref(operand::ExtRef::new(
                    "unwind_cleanup_frame",
                    crate::binary::unwind::cleanup_frame_addr(),
                )),
            ));
            to.push(instr::push(Reg::new(RegId::FramePtr, Size::PTR)));
            to.push(instr::call(Operand::Ref(operand::ExtRef::new(
                "unwind_push_frame",
                crate::binary::unwind::push_frame_addr(),
            ))));
            to.push(instr::add(esp(), operand::ptr_const(4)));
        }

        for &(id, offset) in &self.frame.saved {
            to.push(instr::mov(
                operand::ptr_rel(RegId::FramePtr, offset),
                reg(id, Size::PTR),
            ));
        }

        to.push(instr::mov(
            operand::int_rel(RegId::FramePtr, PART_ID_OFFSET),
            operand::int_const(self.src.root().part().key() as i32),
        ));
        self.zero_block_vars(to, self.src.root().part());
        self.current = self.src.root().part();
        Ok(())
    }

    fn zero_block_vars(&self, to: &mut Listing, part: Part) {
        let block = self.src.first(part);
        for v in self.src.block_vars(block) {
            if self.src.is_param(v) {
                continue;
            }
            let off = self.frame.var_offset(v);
            let bytes = self.src.var_size(v).current(false);
            self.zero_mem(to, off, bytes);
        }
    }

    fn zero_mem(&self, to: &mut Listing, base: i32, bytes: u32) {
        let mut at = 0u32;
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

    fn end(&mut self, to: &mut Listing, part: Part) -> Result<()> {
        let block = self.src.first(part);
        if self.src.first(self.current) != block {
            return Err(CodeError::BlockEndError);
        }

        self.destroy_block(to, part, false)?;

        let parent = self.src.parent(block);
        let parent_id = if parent.valid() {
            parent.key() as i32
        } else {
            0
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
        let mut pushed_dx = false;
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
            if preserve_ax && !pushed_dx {
                // The 8-byte result pair lives in a/d.
                to.push(instr::push(Reg::new(RegId::Dx, Size::PTR)));
                pushed_dx = true;
            }
            self.destroy_var(to, v, free_fn, opt)?;
        }
        if pushed_dx {
            to.push(instr::pop(Reg::new(RegId::Dx, Size::PTR)));
        }
        if pushed_ax {
            to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
        }
        Ok(())
    }

    /// One cdecl destructor call: push the value (or its address), call,
    /// release, re-zero.
    fn destroy_var(
        &mut self,
        to: &mut Listing,
        v: Var,
        free_fn: Operand,
        opt: FreeOpt,
    ) -> Result<()> {
        let off = self.frame.var_offset(v);
        let size = self.src.var_size(v);
        let bytes = size.current(false);

        let mut arg_bytes = 4u32;
        if opt.contains(FreeOpt::INDIRECTION) {
            to.push(instr::push(operand::ptr_rel(RegId::FramePtr, off)));
        } else if opt.contains(FreeOpt::PTR) {
            to.push(instr::lea(
                reg(RegId::Ax, Size::PTR),
                operand::ptr_rel(RegId::FramePtr, off),
            ));
            to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
        } else if bytes == 8 {
            to.push(instr::push(operand::int_rel(RegId::FramePtr, off + 4)));
            to.push(instr::push(operand::int_rel(RegId::FramePtr, off)));
            arg_bytes = 8;
        } else if bytes <= 4 {
            to.push(instr::push(operand::x_rel(size, RegId::FramePtr, off)));
        } else {
            return Err(CodeError::InvalidOperand {
                op: "destructor",
                detail: format!("variable of {} bytes destroyed by value", bytes),
            });
        }

        match free_fn {
            Operand::Ref(_) | Operand::Label(_) => to.push(instr::call(free_fn)),
            other => {
                to.push(instr::mov(reg(RegId::Ax, Size::PTR), other));
                to.push(instr::call(reg(RegId::Ax, Size::PTR)));
            }
        }
        to.push(instr::add(esp(), operand::ptr_const(arg_bytes as usize)));
        self.zero_mem(to, off, bytes);
        Ok(())
    }

    fn epilog(&mut self, to: &mut Listing) -> Result<()> {
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
            // Unlink this frame from the runtime chain; the result pair
            // is live here and rides out the call on the stack.
            to.push(instr::push(Reg::new(RegId::Ax, Size::PTR)));
            to.push(instr::push(Reg::new(RegId::Dx, Size::PTR)));
            to.push(instr::call(Operand::Ref(operand::ExtRef::new(
                "unwind_pop_frame",
                crate::binary::unwind::pop_frame_addr(),
            ))));
            to.push(instr::pop(Reg::new(RegId::Dx, Size::PTR)));
            to.push(instr::pop(Reg::new(RegId::Ax, Size::PTR)));
        }

        to.push(instr::mov(esp(), ebp()));
        to.push(instr::pop(Reg::new(RegId::FramePtr, Size::PTR)));
        Ok(())
    }

    fn fn_ret(&mut self, to: &mut Listing, src: Operand) -> Result<()> {
        if !src.is_none() {
            let bytes = src.size().current(false);
            if self.src.result.is_float() {
                // cdecl returns floats on the x87 stack.
                to.push(instr::fld(src));
            } else if bytes == 8 {
                to.push(instr::mov(reg(RegId::Ax, Size::INT), low32(&src)?));
                to.push(instr::mov(reg(RegId::Dx, Size::INT), high32(&src)?));
            } else {
                let size = src.size();
                to.push(instr::mov(reg(RegId::Ax, size), src));
            }
        }
        let save = self.current;
        self.epilog(to)?;
        self.current = save;
        to.push(instr::ret());
        Ok(())
    }

    fn fn_ret_ref(&mut self, to: &mut Listing, src: Operand) -> Result<()> {
        // The hidden result pointer is the first stack argument.
        let bytes = self.src.result.size().current(false) as usize;
        to.push(instr::mov(reg(RegId::Si, Size::PTR), src));
        to.push(instr::mov(
            reg(RegId::Di, Size::PTR),
            operand::ptr_rel(RegId::FramePtr, 8),
        ));
        to.push(instr::mov(
            reg(RegId::Cx, Size::PTR),
            operand::ptr_const(bytes.div_ceil(4)),
        ));
        to.push(Instr::new(OpCode::RepMovsq, Operand::None, Operand::None));
        to.push(instr::mov(
            reg(RegId::Ax, Size::PTR),
            operand::ptr_rel(RegId::FramePtr, 8),
        ));

        let save = self.current;
        self.epilog(to)?;
        self.current = save;
        to.push(instr::ret());
        Ok(())
    }

    /// Simple cdecl call: push the collected parameters right to left,
    /// call, release the argument bytes.
    fn call(&mut self, to: &mut Listing, target: Operand) -> Result<()> {
        let params = std::mem::take(&mut self.params);
        let mut arg_bytes = 0usize;

        for p in params.iter().rev() {
            if p.by_ref {
                // Pass the pointed-at value; only word-sized data can be
                // rebuilt inline, wider values pass the pointer itself.
                to.push(instr::mov(reg(RegId::Ax, Size::PTR), p.value.clone()));
                to.push(instr::push(operand::ptr_rel(RegId::Ax, 0)));
                arg_bytes += 4;
                continue;
            }
            let bytes = p.value.size().current(false);
            if bytes == 8 {
                to.push(instr::push(high32(&p.value)?));
                to.push(instr::push(low32(&p.value)?));
                arg_bytes += 8;
            } else {
                to.push(instr::push(p.value.clone()));
                arg_bytes += 4;
            }
        }

        match target {
            Operand::Ref(_) | Operand::Label(_) => to.push(instr::call(target)),
            other => {
                to.push(instr::mov(reg(RegId::Ax, Size::PTR), other));
                to.push(instr::call(reg(RegId::Ax, Size::PTR)));
            }
        }

        if arg_bytes > 0 {
            to.push(instr::add(esp(), operand::ptr_const(arg_bytes)));
        }
        Ok(())
    }

    fn metadata(&self, to: &mut Listing) {
        to.push(instr::align(4));
        to.push_label(to.meta());
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
