//! Platform implementations
//!
//! - **Fabric**: Linux FPGA manager, `/dev/mem` control windows, `u-dma-buf` DMA
//! - **Software**: simulated fabric and memory, no hardware required

pub mod fabric;
pub mod software;

pub use fabric::{FabricConfig, FabricPlatform, MmioWindow, UdmabufConfig, UdmabufDomain};
pub use software::{
    SimulatedAccelerator, SimulatedMemory, SimulationProbe, SoftwareConfig, SoftwarePlatform,
};
