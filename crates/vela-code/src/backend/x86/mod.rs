//! x86-32 backend (cdecl).

pub mod asm;
pub mod layout;
pub mod legalize;
pub mod split64;

use super::Backend;
use crate::error::Result;
use crate::listing::Listing;
use crate::output::EncodedCode;

pub struct X86Backend;

impl X86Backend {
    pub fn new() -> X86Backend {
        X86Backend
    }
}

impl Default for X86Backend {
    fn default() -> Self {
        X86Backend::new()
    }
}

impl Backend for X86Backend {
    fn name(&self) -> &'static str {
        "x86-32"
    }

    fn ptr64(&self) -> bool {
        false
    }

    fn transform(&self, src: &Listing) -> Result<Listing> {
        // 64-bit split first, then operand legalization, then frame and
        // calling-convention materialization.
        let split = split64::run(src)?;
        let legal = legalize::run(&split)?;
        layout::run(&legal)
    }

    fn encode(&self, src: &Listing) -> Result<EncodedCode> {
        asm::encode(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{self, prolog};
    use crate::operand::{long_const, Operand};
    use crate::size::Size;

    #[test]
    fn test_full_pipeline_on_long_arithmetic() {
        let mut l = Listing::new();
        let p = l.root().part();
        let v = l.create_long_var(p);
        l.push(prolog());
        l.push(instr::mov(
            Operand::Var {
                var: v,
                offset: 0,
                size: Size::LONG,
            },
            long_const(0x7777_7777_77),
        ));
        l.push(instr::add(
            Operand::Var {
                var: v,
                offset: 0,
                size: Size::LONG,
            },
            long_const(0x9999_9999_99),
        ));
        l.push(instr::fn_ret(Operand::Var {
            var: v,
            offset: 0,
            size: Size::LONG,
        }));

        let backend = X86Backend::new();
        let lowered = backend.transform(&l).unwrap();
        let code = backend.encode(&lowered).unwrap();
        assert!(!code.bytes.is_empty());
        // Every remaining operation is at most four bytes wide.
        for e in lowered.entries() {
            assert!(e.instr.size().current(false) <= 4, "wide op: {}", e.instr);
        }
    }
}
