//! Errors raised while building, transforming and encoding listings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("Invalid operand for {op}: {detail}")]
    InvalidOperand { op: &'static str, detail: String },

    #[error("Unsupported addressing mode for {op}: {detail}")]
    UnsupportedAddressing { op: &'static str, detail: String },

    #[error("Block begun without beginning its parent")]
    BlockBeginError,

    #[error("Block ended out of order")]
    BlockEndError,

    #[error(transparent)]
    Gc(#[from] vgc::GcError),
}

pub type Result<T> = std::result::Result<T, CodeError>;
