//! Accelerator profiles and their `s_axi_control` register layouts.
//!
//! A profile is one synthesized kernel interface. The layout is an ABI between
//! host software and one hardware build, so it carries a version and is checked
//! against the build's hardware handoff before use.
//!
//! ```text
//! vvadd (f32, c = a + b)            vvdot (i32, result = Σ a·b)
//! ──────────────────────────        ──────────────────────────
//! 0x00  CTRL                        0x00  CTRL
//! 0x04  GIE                         0x04  GIE
//! 0x08  IER                         0x08  IER
//! 0x0C  ISR                         0x0C  ISR
//! 0x10  a_1   0x14  a_2             0x10  a_1   0x14  a_2
//! 0x1C  b_1   0x20  b_2             0x1C  b_1   0x20  b_2
//! 0x28  c_1   0x2C  c_2             0x28  n
//! 0x34  n                           0x30  result
//!                                   0x34  result_ap_vld
//! ```
//!
//! Pointer operands are 64-bit: `x_1` holds the low word, `x_2` the high word.

use crate::dtype::ElementType;
use std::fmt;

/// Version of the register tables in this module.
pub const LAYOUT_VERSION: u32 = 1;

/// Global interrupt enable register. Not touched by the polling driver.
pub const GIE: usize = 0x04;
/// Interrupt enable register.
pub const IER: usize = 0x08;
/// Interrupt status register.
pub const ISR: usize = 0x0C;

/// Named accelerator-visible operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    /// ap_ctrl_hs control word.
    Control,
    /// First input vector base address.
    OperandA,
    /// Second input vector base address.
    OperandB,
    /// Output vector base address.
    OperandC,
    /// Element count.
    Length,
    /// Scalar result.
    Result,
}

impl Operand {
    /// Every operand, in layout order.
    pub const ALL: [Self; 6] = [
        Self::Control,
        Self::OperandA,
        Self::OperandB,
        Self::OperandC,
        Self::Length,
        Self::Result,
    ];

    /// Driver-side name used by register map lookups.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::OperandA => "operand_a",
            Self::OperandB => "operand_b",
            Self::OperandC => "operand_c",
            Self::Length => "length",
            Self::Result => "result",
        }
    }

    /// `REGISTER NAME` in the hardware handoff (low word for pointers).
    #[must_use]
    pub const fn handoff_name(self) -> &'static str {
        match self {
            Self::Control => "CTRL",
            Self::OperandA => "a_1",
            Self::OperandB => "b_1",
            Self::OperandC => "c_1",
            Self::Length => "n",
            Self::Result => "result",
        }
    }

    /// Parse a driver-side name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One 32-bit word.
    W32,
    /// Two consecutive 32-bit words, low first.
    W64,
}

impl Width {
    /// Bytes covered in the control window.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }
}

/// Host access permitted on a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Host writes and reads.
    ReadWrite,
    /// Kernel writes, host reads.
    ReadOnly,
}

/// One entry of a register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    /// Operand this register carries.
    pub operand: Operand,
    /// Byte offset from the instance base.
    pub offset: usize,
    /// Register width.
    pub width: Width,
    /// Host access.
    pub access: Access,
}

impl RegisterSpec {
    const fn rw(operand: Operand, offset: usize, width: Width) -> Self {
        Self { operand, offset, width, access: Access::ReadWrite }
    }

    const fn ro(operand: Operand, offset: usize, width: Width) -> Self {
        Self { operand, offset, width, access: Access::ReadOnly }
    }
}

const VVADD_REGISTERS: [RegisterSpec; 5] = [
    RegisterSpec::rw(Operand::Control, 0x00, Width::W32),
    RegisterSpec::rw(Operand::OperandA, 0x10, Width::W64),
    RegisterSpec::rw(Operand::OperandB, 0x1C, Width::W64),
    RegisterSpec::rw(Operand::OperandC, 0x28, Width::W64),
    RegisterSpec::rw(Operand::Length, 0x34, Width::W32),
];

const VVDOT_REGISTERS: [RegisterSpec; 5] = [
    RegisterSpec::rw(Operand::Control, 0x00, Width::W32),
    RegisterSpec::rw(Operand::OperandA, 0x10, Width::W64),
    RegisterSpec::rw(Operand::OperandB, 0x1C, Width::W64),
    RegisterSpec::rw(Operand::Length, 0x28, Width::W32),
    RegisterSpec::ro(Operand::Result, 0x30, Width::W32),
];

/// How a profile returns its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Kernel writes an output vector through `operand_c`.
    Vector,
    /// Kernel leaves a scalar in the `result` register.
    Scalar,
}

/// A synthesized accelerator interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// `vvadd(const float*, const float*, float*, unsigned)`.
    VectorAdd,
    /// `vvdot(const int*, const int*, unsigned, int&)`.
    VectorDot,
}

impl Profile {
    /// Every known profile.
    pub const ALL: [Self; 2] = [Self::VectorAdd, Self::VectorDot];

    /// Kernel (top function) name.
    #[must_use]
    pub const fn kernel(self) -> &'static str {
        match self {
            Self::VectorAdd => "vvadd",
            Self::VectorDot => "vvdot",
        }
    }

    /// Conventional block-design instance name.
    #[must_use]
    pub const fn instance_name(self) -> &'static str {
        match self {
            Self::VectorAdd => "vvadd_0",
            Self::VectorDot => "vvdot_0",
        }
    }

    /// The one element type the kernel's `m_axi` ports carry.
    #[must_use]
    pub const fn element_type(self) -> ElementType {
        match self {
            Self::VectorAdd => ElementType::F32,
            Self::VectorDot => ElementType::I32,
        }
    }

    /// Result delivery.
    #[must_use]
    pub const fn output(self) -> OutputKind {
        match self {
            Self::VectorAdd => OutputKind::Vector,
            Self::VectorDot => OutputKind::Scalar,
        }
    }

    /// Register table.
    #[must_use]
    pub const fn registers(self) -> &'static [RegisterSpec] {
        match self {
            Self::VectorAdd => &VVADD_REGISTERS,
            Self::VectorDot => &VVDOT_REGISTERS,
        }
    }

    /// Register carrying `operand`, if the profile has one.
    #[must_use]
    pub fn register(self, operand: Operand) -> Option<RegisterSpec> {
        self.registers().iter().copied().find(|r| r.operand == operand)
    }

    /// Parse a kernel name (`vvadd`, `vvdot`).
    #[must_use]
    pub fn from_kernel(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.kernel() == name)
    }

    /// Match a block-design instance such as `vvadd_0` or `vvadd_3`.
    #[must_use]
    pub fn from_instance(instance: &str) -> Option<Self> {
        let (kernel, index) = instance.rsplit_once('_')?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::from_kernel(kernel)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel())
    }
}
