//! Platform abstraction
//!
//! A platform turns an image plus its hardware handoff into a programmed
//! [`Overlay`]: the named accelerator instances it contains (raw control-window
//! register access) and the DMA domain their buffers come from.
//!
//! ```text
//! FabricPlatform   — Linux FPGA manager + /dev/mem + u-dma-buf (real SoC)
//! SoftwarePlatform — simulated fabric and memory (CI, no hardware)
//! ```

use crate::backends::fabric::{FabricConfig, FabricPlatform};
use crate::backends::software::SoftwarePlatform;
use crate::dma::DmaDomain;
use crate::error::{Result, XcelError};
use crate::handoff::HardwareHandoff;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

/// Environment variable that overrides platform selection.
pub const PLATFORM_ENV: &str = "XCEL_PLATFORM";

/// Raw 32-bit access to one instance's control address space.
pub trait RegisterIo: Debug {
    /// Read the word at `offset` bytes from the instance base.
    ///
    /// Takes `&mut self`: status reads may have side effects (clear-on-read).
    ///
    /// # Errors
    ///
    /// Returns an error for unaligned or out-of-window offsets.
    fn read32(&mut self, offset: usize) -> Result<u32>;

    /// Write the word at `offset` bytes from the instance base.
    ///
    /// # Errors
    ///
    /// Returns an error for unaligned or out-of-window offsets.
    fn write32(&mut self, offset: usize, value: u32) -> Result<()>;

    /// Size of the control window in bytes.
    fn window_size(&self) -> usize;

    /// Instance name, for logs.
    fn name(&self) -> &str;
}

/// Check that a 32-bit access at `offset` fits in a window of `size` bytes.
pub(crate) fn check_access(name: &str, offset: usize, size: usize) -> Result<()> {
    if offset % 4 != 0 {
        return Err(XcelError::hardware(format!(
            "{name}: unaligned register access at {offset:#x}"
        )));
    }
    if offset.checked_add(4).is_none_or(|end| end > size) {
        return Err(XcelError::hardware(format!(
            "{name}: register access at {offset:#x} outside {size:#x}-byte window"
        )));
    }
    Ok(())
}

/// A programmed fabric.
#[derive(Debug)]
pub struct Overlay {
    image: PathBuf,
    instances: BTreeMap<String, Box<dyn RegisterIo>>,
    dma: Rc<dyn DmaDomain>,
}

impl Overlay {
    /// Empty overlay for `image` backed by `dma`.
    pub fn new(image: impl Into<PathBuf>, dma: Rc<dyn DmaDomain>) -> Self {
        Self {
            image: image.into(),
            instances: BTreeMap::new(),
            dma,
        }
    }

    /// Add a named instance.
    #[must_use]
    pub fn with_instance(mut self, name: impl Into<String>, io: Box<dyn RegisterIo>) -> Self {
        self.instances.insert(name.into(), io);
        self
    }

    /// Image this overlay was programmed from.
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Names of the instances still held by the overlay.
    pub fn instance_names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    /// Take ownership of one instance's register handle.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Configuration`] if the overlay has no such instance.
    pub fn take_instance(&mut self, name: &str) -> Result<Box<dyn RegisterIo>> {
        self.instances.remove(name).ok_or_else(|| {
            let available: Vec<&str> = self.instance_names().collect();
            XcelError::configuration(format!(
                "overlay {} has no instance '{name}' (available: {})",
                self.image.display(),
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            ))
        })
    }

    /// DMA domain for buffers used with this overlay.
    pub const fn dma(&self) -> &Rc<dyn DmaDomain> {
        &self.dma
    }
}

/// Platform loader: programs the fabric and exposes its instances.
pub trait Platform: Debug {
    /// Programs the fabric from `image`, using `handoff` to locate instances.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Configuration`] if the image cannot be loaded.
    fn program(&mut self, image: &Path, handoff: &HardwareHandoff) -> Result<Overlay>;

    /// Which platform this is.
    fn kind(&self) -> PlatformKind;
}

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    /// Linux FPGA manager, `/dev/mem`, `u-dma-buf`
    Fabric,
    /// Simulated fabric
    Software,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fabric => write!(f, "Fabric"),
            Self::Software => write!(f, "Software (simulated fabric)"),
        }
    }
}

/// Platform selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformSelection {
    /// Real fabric when present, otherwise the simulator
    #[default]
    Auto,
    /// Force the real fabric
    Fabric,
    /// Force the simulator
    Software,
}

impl PlatformSelection {
    /// Selection from [`PLATFORM_ENV`], if set.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Configuration`] if the variable holds an unknown value.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(PLATFORM_ENV) {
            Ok(value) => value.parse().map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl FromStr for PlatformSelection {
    type Err = XcelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fabric" | "hardware" | "hw" => Ok(Self::Fabric),
            "software" | "sim" | "simulated" => Ok(Self::Software),
            other => Err(XcelError::configuration(format!(
                "unknown platform '{other}' (expected auto, fabric or software)"
            ))),
        }
    }
}

/// Construct a platform.
///
/// # Errors
///
/// Returns an error if the fabric is forced but not present.
pub fn select_platform(selection: PlatformSelection) -> Result<Box<dyn Platform>> {
    let config = FabricConfig::default();
    match selection {
        PlatformSelection::Auto => {
            if FabricPlatform::available(&config) {
                tracing::info!("Using fabric platform");
                return Ok(Box::new(FabricPlatform::new(config)));
            }
            tracing::info!("FPGA manager unavailable, using simulated fabric");
            Ok(Box::new(SoftwarePlatform::default()))
        }
        PlatformSelection::Fabric => {
            if !FabricPlatform::available(&config) {
                return Err(XcelError::configuration(format!(
                    "fabric platform unavailable (need {}, {} and {})",
                    config.fpga_manager.display(),
                    config.mem_device.display(),
                    config.udmabuf.device.display()
                )));
            }
            Ok(Box::new(FabricPlatform::new(config)))
        }
        PlatformSelection::Software => Ok(Box::new(SoftwarePlatform::default())),
    }
}
