//! Instructions.
//!
//! Instructions are machine independent until the backend transforms
//! rewrite them; the same vocabulary carries both levels. Every
//! instruction has up to two operands; `dest_mode` describes how the
//! destination is accessed, which is all the usage analysis needs.

use crate::cond::CondFlag;
use crate::label::Label;
use crate::listing::Part;
use crate::operand::Operand;
use crate::reg::Reg;
use crate::size::Size;
use crate::typedesc::TypeDesc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Nop,
    // Data movement.
    Mov,
    Swap,
    Push,
    Pop,
    PushFlags,
    PopFlags,
    Lea,
    // Control flow.
    Jmp,
    Call,
    Ret,
    SetCond,
    // Integer arithmetic and bitwise.
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    Bor,
    Band,
    Bxor,
    Bnot,
    Mul,
    Idiv,
    Imod,
    Udiv,
    Umod,
    Shl,
    Shr,
    Sar,
    Icast,
    Ucast,
    /// Sign-extend the accumulator into the data register (`cdq`/`cqo`).
    /// Produced by the division lowering; the operand width rides on
    /// `src`.
    Cdq,
    /// `rep movsq`: copy rcx words from [rsi] to [rdi]. Produced by the
    /// calling-convention lowering for aggregate copies.
    RepMovsq,
    /// Marks the position of unwind data for the platform side table.
    /// Becomes a reference-trailer entry, not bytes.
    UnwindInfo,
    // Floating point (x87 stack model).
    Fld,
    Fild,
    Fstp,
    Fistp,
    Faddp,
    Fsubp,
    Fmulp,
    Fdivp,
    Fcompp,
    Fwait,
    // Data directives.
    Dat,
    LblOffset,
    Align,
    AlignAs,
    // Calling convention, lowered by the backends.
    FnParam,
    FnParamRef,
    FnCall,
    FnCallRef,
    FnRet,
    FnRetRef,
    // Scope markers.
    Prolog,
    Epilog,
    Begin,
    End,
    Preserve,
    ThreadLocal,
}

/// How an instruction treats its destination operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestMode {
    None,
    Read,
    Write,
    ReadWrite,
}

impl OpCode {
    pub fn dest_mode(self) -> DestMode {
        use OpCode::*;
        match self {
            Mov | Lea | Pop | SetCond | Fstp | Fistp | Icast | Ucast => DestMode::Write,
            Add | Adc | Sub | Sbb | Bor | Band | Bxor | Bnot | Mul | Idiv | Imod | Udiv
            | Umod | Shl | Shr | Sar | Swap | Preserve => DestMode::ReadWrite,
            Cmp => DestMode::Read,
            _ => DestMode::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: OpCode,
    pub dest: Operand,
    pub src: Operand,
}

impl Instr {
    pub fn new(op: OpCode, dest: Operand, src: Operand) -> Instr {
        Instr { op, dest, src }
    }

    /// Size of the data this instruction operates on.
    pub fn size(&self) -> Size {
        if self.dest.is_none() {
            self.src.size()
        } else {
            self.dest.size()
        }
    }

    /// Copy with both operands replaced.
    pub fn altered(&self, dest: Operand, src: Operand) -> Instr {
        Instr {
            op: self.op,
            dest,
            src,
        }
    }

    pub fn alter_src(&self, src: Operand) -> Instr {
        self.altered(self.dest.clone(), src)
    }

    pub fn alter_dest(&self, dest: Operand) -> Instr {
        self.altered(dest, self.src.clone())
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self.op).to_lowercase();
        match (self.dest.is_none(), self.src.is_none()) {
            (true, true) => write!(f, "{}", name),
            (true, false) => write!(f, "{} {}", name, self.src),
            (false, true) => write!(f, "{} {}", name, self.dest),
            (false, false) => write!(f, "{} {}, {}", name, self.dest, self.src),
        }
    }
}

// Constructors, mirroring how listings read.

pub fn nop() -> Instr {
    Instr::new(OpCode::Nop, Operand::None, Operand::None)
}

pub fn mov(dest: impl Into<Operand>, src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Mov, dest.into(), src.into())
}

pub fn swap(dest: Reg, src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Swap, Operand::Reg(dest), src.into())
}

pub fn push(src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Push, Operand::None, src.into())
}

pub fn pop(dest: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Pop, dest.into(), Operand::None)
}

pub fn push_flags() -> Instr {
    Instr::new(OpCode::PushFlags, Operand::None, Operand::None)
}

pub fn pop_flags() -> Instr {
    Instr::new(OpCode::PopFlags, Operand::None, Operand::None)
}

pub fn lea(dest: impl Into<Operand>, src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Lea, dest.into(), src.into())
}

/// Unconditional jump.
pub fn jmp(to: impl Into<Operand>) -> Instr {
    jmp_cond(to, CondFlag::Always)
}

pub fn jmp_cond(to: impl Into<Operand>, cond: CondFlag) -> Instr {
    Instr::new(OpCode::Jmp, to.into(), Operand::Cond(cond))
}

pub fn call(target: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Call, Operand::None, target.into())
}

pub fn ret() -> Instr {
    Instr::new(OpCode::Ret, Operand::None, Operand::None)
}

pub fn set_cond(dest: impl Into<Operand>, cond: CondFlag) -> Instr {
    Instr::new(OpCode::SetCond, dest.into(), Operand::Cond(cond))
}

macro_rules! binary_ctor {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(pub fn $name(dest: impl Into<Operand>, src: impl Into<Operand>) -> Instr {
            Instr::new(OpCode::$op, dest.into(), src.into())
        })*
    };
}

binary_ctor! {
    add => Add,
    adc => Adc,
    sub => Sub,
    sbb => Sbb,
    cmp => Cmp,
    bor => Bor,
    band => Band,
    bxor => Bxor,
    mul => Mul,
    idiv => Idiv,
    imod => Imod,
    udiv => Udiv,
    umod => Umod,
    shl => Shl,
    shr => Shr,
    sar => Sar,
    icast => Icast,
    ucast => Ucast,
}

pub fn bnot(dest: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Bnot, dest.into(), Operand::None)
}

pub fn fld(src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Fld, Operand::None, src.into())
}

pub fn fild(src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Fild, Operand::None, src.into())
}

pub fn fstp(dest: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Fstp, dest.into(), Operand::None)
}

pub fn fistp(dest: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Fistp, dest.into(), Operand::None)
}

pub fn faddp() -> Instr {
    Instr::new(OpCode::Faddp, Operand::None, Operand::None)
}

pub fn fsubp() -> Instr {
    Instr::new(OpCode::Fsubp, Operand::None, Operand::None)
}

pub fn fmulp() -> Instr {
    Instr::new(OpCode::Fmulp, Operand::None, Operand::None)
}

pub fn fdivp() -> Instr {
    Instr::new(OpCode::Fdivp, Operand::None, Operand::None)
}

pub fn fcompp() -> Instr {
    Instr::new(OpCode::Fcompp, Operand::None, Operand::None)
}

pub fn fwait() -> Instr {
    Instr::new(OpCode::Fwait, Operand::None, Operand::None)
}

/// Emit the operand as raw data.
pub fn dat(src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::Dat, Operand::None, src.into())
}

/// Emit the byte offset of a label as a pointer-sized word.
pub fn lbl_offset(l: Label) -> Instr {
    Instr::new(OpCode::LblOffset, Operand::None, Operand::Label(l))
}

/// Align the output position to `n` bytes.
pub fn align(n: u32) -> Instr {
    Instr::new(
        OpCode::Align,
        Operand::None,
        crate::operand::nat_const(n),
    )
}

/// Align the output position for data of the given size.
pub fn align_as(size: Size) -> Instr {
    Instr::new(
        OpCode::AlignAs,
        Operand::None,
        crate::operand::nat_const(size.align(cfg!(target_pointer_width = "64"))),
    )
}

pub fn fn_param(desc: TypeDesc, src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::FnParam, Operand::Desc(desc), src.into())
}

/// Pass the value `src` points at, described by `desc`.
pub fn fn_param_ref(desc: TypeDesc, src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::FnParamRef, Operand::Desc(desc), src.into())
}

pub fn fn_call(target: impl Into<Operand>, result: TypeDesc) -> Instr {
    Instr::new(OpCode::FnCall, Operand::Desc(result), target.into())
}

/// Call through a function pointer read from `target`.
pub fn fn_call_ref(target: impl Into<Operand>, result: TypeDesc) -> Instr {
    Instr::new(OpCode::FnCallRef, Operand::Desc(result), target.into())
}

pub fn fn_ret(src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::FnRet, Operand::None, src.into())
}

/// Return the value `src` points at through the hidden result pointer.
pub fn fn_ret_ref(src: impl Into<Operand>) -> Instr {
    Instr::new(OpCode::FnRetRef, Operand::None, src.into())
}

pub fn prolog() -> Instr {
    Instr::new(OpCode::Prolog, Operand::None, Operand::None)
}

pub fn epilog() -> Instr {
    Instr::new(OpCode::Epilog, Operand::None, Operand::None)
}

pub fn begin(part: Part) -> Instr {
    Instr::new(OpCode::Begin, Operand::None, Operand::Part(part))
}

pub fn end(part: Part) -> Instr {
    Instr::new(OpCode::End, Operand::None, Operand::Part(part))
}

/// Keep `src` in the location `dest` across the following code.
pub fn preserve(dest: impl Into<Operand>, src: Reg) -> Instr {
    Instr::new(OpCode::Preserve, dest.into(), Operand::Reg(src))
}

/// Prefix: the following memory access is thread local.
pub fn thread_local() -> Instr {
    Instr::new(OpCode::ThreadLocal, Operand::None, Operand::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::int_const;
    use crate::reg::regs;

    #[test]
    fn test_dest_modes() {
        assert_eq!(OpCode::Mov.dest_mode(), DestMode::Write);
        assert_eq!(OpCode::Add.dest_mode(), DestMode::ReadWrite);
        assert_eq!(OpCode::Cmp.dest_mode(), DestMode::Read);
        assert_eq!(OpCode::Jmp.dest_mode(), DestMode::None);
    }

    #[test]
    fn test_instr_size_follows_dest() {
        let i = mov(regs::EAX, int_const(1));
        assert_eq!(i.size(), crate::size::Size::INT);
        let p = push(int_const(1));
        assert_eq!(p.size(), crate::size::Size::INT);
    }

    #[test]
    fn test_alter() {
        let i = add(regs::EAX, int_const(1));
        let j = i.alter_src(Operand::Reg(regs::EBX));
        assert_eq!(j.op, OpCode::Add);
        assert_eq!(j.dest, Operand::Reg(regs::EAX));
        assert_eq!(j.src, Operand::Reg(regs::EBX));
    }

    #[test]
    fn test_display() {
        let i = mov(regs::EAX, int_const(10));
        assert!(format!("{}", i).starts_with("mov"));
    }
}
