//! Register-level model of Vitis HLS accelerators driven over AXI4-Lite.
//!
//! This crate has **no dependencies** and **no hardware access**. It describes
//! what the synthesized kernels look like from the host: the ap_ctrl_hs
//! handshake bits, the element types carried on `m_axi` ports, and the
//! `s_axi_control` register layout of each known profile.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ctrl`] | ap_ctrl_hs bit definitions and pure bit tests |
//! | [`dtype`] | Element types (`float32`, `int32`, ...) |
//! | [`profile`] | `vvadd` / `vvdot` register layouts, operands, instance names |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ctrl;
pub mod dtype;
pub mod profile;

pub use dtype::ElementType;
pub use profile::{Access, Operand, OutputKind, Profile, RegisterSpec, Width};
