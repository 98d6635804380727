//! Host-side driver for Vitis HLS accelerators on FPGA SoCs.
//!
//! Programs a bitstream, locates the accelerator through the build's hardware
//! handoff, shares physically-contiguous buffers with it zero-copy, and runs
//! the kernel through the `ap_ctrl_hs` start/done handshake.
//!
//! # Platforms
//!
//! ```text
//! FabricPlatform   — /sys/class/fpga_manager + /dev/mem + u-dma-buf (Zynq/ZynqMP)
//! SoftwarePlatform — simulated fabric and memory (CI, development)
//! ```
//!
//! Selection follows [`PlatformSelection`]; the `XCEL_PLATFORM` environment
//! variable (`auto`, `fabric`, `software`) overrides it in the CLI.
//!
//! # Quick start
//!
//! ```no_run
//! use xcel_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut session = AcceleratorSession::open(
//!     PlatformSelection::Auto,
//!     SessionConfig::new(Profile::VectorAdd),
//! )?;
//! session.program("/home/xilinx/overlays/vvadd.bit")?;   // needs vvadd.hwh alongside
//! session.load_inputs(&[1.0f32, 2.0, 3.0], &[4.0f32, 5.0, 6.0])?;
//! session.allocate_output(3)?;
//!
//! let report = session.run()?;
//! let sum = report.output.vector().map(|c| c.to_vec::<f32>()).transpose()?;
//! println!("{sum:?} in {:?}", report.elapsed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
pub mod buffer;
pub mod dma;
mod error;
pub mod handoff;
pub mod platform;
pub mod regmap;
pub mod session;
pub mod wait;

pub use backends::{FabricConfig, FabricPlatform, SoftwareConfig, SoftwarePlatform};
pub use buffer::{DeviceBuffer, Element, HostSlice, SyncState};
pub use dma::{DmaDomain, DmaMapping, SyncDirection};
pub use error::{Result, XcelError};
pub use handoff::{companion_path, HardwareHandoff, IpModule};
pub use platform::{
    select_platform, Overlay, Platform, PlatformKind, PlatformSelection, RegisterIo,
    PLATFORM_ENV,
};
pub use regmap::{RegisterLayout, RegisterMap};
pub use session::{AcceleratorSession, Output, RunReport, SessionConfig, SessionState};
pub use wait::{CancelToken, WaitPolicy};
pub use xcel_chip::{ElementType, Operand, Profile};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AcceleratorSession, CancelToken, DeviceBuffer, ElementType, Output, PlatformSelection,
        Profile, Result, RunReport, SessionConfig, SessionState, WaitPolicy, XcelError,
    };
}
