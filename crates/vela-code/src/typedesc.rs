//! Type descriptions used for parameters and return values.
//!
//! The calling-convention transforms classify every parameter by its
//! description: primitives travel in registers, simple aggregates are
//! trivially movable blobs, complex values must be built and destroyed
//! through their own functions and are passed by pointer.

use crate::size::Size;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Integer,
    Pointer,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    /// A machine primitive.
    Primitive { kind: Primitive, size: Size },
    /// A trivially movable aggregate (plain data, possibly with GC
    /// pointers at known offsets).
    Simple { size: Size },
    /// A value with construction/destruction semantics; always handled
    /// through a pointer.
    Complex { size: Size },
}

impl TypeDesc {
    pub const fn byte() -> TypeDesc {
        TypeDesc::Primitive {
            kind: Primitive::Integer,
            size: Size::BYTE,
        }
    }

    pub const fn int() -> TypeDesc {
        TypeDesc::Primitive {
            kind: Primitive::Integer,
            size: Size::INT,
        }
    }

    pub const fn long() -> TypeDesc {
        TypeDesc::Primitive {
            kind: Primitive::Integer,
            size: Size::LONG,
        }
    }

    pub const fn ptr() -> TypeDesc {
        TypeDesc::Primitive {
            kind: Primitive::Pointer,
            size: Size::PTR,
        }
    }

    pub const fn float() -> TypeDesc {
        TypeDesc::Primitive {
            kind: Primitive::Float,
            size: Size::FLOAT,
        }
    }

    pub const fn double() -> TypeDesc {
        TypeDesc::Primitive {
            kind: Primitive::Float,
            size: Size::DOUBLE,
        }
    }

    /// An untyped void result.
    pub const fn void() -> TypeDesc {
        TypeDesc::Simple { size: Size::ZERO }
    }

    pub fn size(&self) -> Size {
        match self {
            TypeDesc::Primitive { size, .. } => *size,
            TypeDesc::Simple { size } => *size,
            TypeDesc::Complex { size } => *size,
        }
    }

    pub fn is_void(&self) -> bool {
        self.size().is_zero()
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            TypeDesc::Primitive {
                kind: Primitive::Float,
                ..
            }
        )
    }

    /// Must this value be handled through a pointer?
    pub fn is_complex(&self) -> bool {
        matches!(self, TypeDesc::Complex { .. })
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Primitive { kind, size } => write!(f, "{:?}{}", kind, size),
            TypeDesc::Simple { size } => write!(f, "simple{}", size),
            TypeDesc::Complex { size } => write!(f, "complex{}", size),
        }
    }
}
