//! Element types carried over `m_axi` ports.

use std::fmt;

/// Scalar element type of a host or device vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// IEEE-754 binary32 (`float`).
    F32,
    /// IEEE-754 binary64 (`double`).
    F64,
    /// Two's-complement 32-bit (`int`).
    I32,
    /// Two's-complement 64-bit (`long long`).
    I64,
    /// Unsigned 32-bit (`unsigned`).
    U32,
}

impl ElementType {
    /// Width in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// NumPy-style dtype name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U32 => "uint32",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
