//! x86-64 backend (System V).

pub mod asm;
pub mod layout;
pub mod legalize;

use super::Backend;
use crate::error::Result;
use crate::listing::Listing;
use crate::output::EncodedCode;

pub struct X64Backend;

impl X64Backend {
    pub fn new() -> X64Backend {
        X64Backend
    }
}

impl Default for X64Backend {
    fn default() -> Self {
        X64Backend::new()
    }
}

impl Backend for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn ptr64(&self) -> bool {
        true
    }

    fn transform(&self, src: &Listing) -> Result<Listing> {
        let legal = legalize::run(src)?;
        layout::run(&legal)
    }

    fn encode(&self, src: &Listing) -> Result<EncodedCode> {
        asm::encode(src)
    }
}
