//! Linux fabric platform
//!
//! Programs a Zynq-class SoC through the kernel FPGA manager and drives the
//! result from user space:
//!
//! ```text
//! image  ──copy──▶ /lib/firmware/<name>
//!        ──name──▶ /sys/class/fpga_manager/fpga0/firmware
//!                  /sys/class/fpga_manager/fpga0/state == "operating"
//! control windows  /dev/mem (O_SYNC) mmap at each MEMRANGE base
//! buffers          /dev/udmabuf0 mmap, bump-allocated; cache maintenance via
//!                  /sys/class/u-dma-buf/udmabuf0/sync_*
//! ```
//!
//! Every path is configurable so the whole flow can be pointed at a scratch
//! directory.

use crate::backends::software::module_profile;
use crate::dma::{page_round, DmaDomain, DmaMapping, SyncDirection, PAGE_SIZE};
use crate::error::{Result, XcelError};
use crate::handoff::{AddressWindow, HardwareHandoff};
use crate::platform::{check_access, Overlay, Platform, PlatformKind, RegisterIo};
use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::rc::Rc;
use tracing::{debug, info, trace};

/// `u-dma-buf` device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdmabufConfig {
    /// Character device (`/dev/udmabuf0`)
    pub device: PathBuf,
    /// Sysfs attribute directory (`/sys/class/u-dma-buf/udmabuf0`)
    pub sysfs: PathBuf,
}

impl Default for UdmabufConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/udmabuf0"),
            sysfs: PathBuf::from("/sys/class/u-dma-buf/udmabuf0"),
        }
    }
}

/// Fabric platform configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricConfig {
    /// FPGA manager sysfs directory
    pub fpga_manager: PathBuf,
    /// Firmware search directory the FPGA manager loads from
    pub firmware_dir: PathBuf,
    /// Physical memory device for control windows
    pub mem_device: PathBuf,
    /// DMA buffer device
    pub udmabuf: UdmabufConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            fpga_manager: PathBuf::from("/sys/class/fpga_manager/fpga0"),
            firmware_dir: PathBuf::from("/lib/firmware"),
            mem_device: PathBuf::from("/dev/mem"),
            udmabuf: UdmabufConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Use a different FPGA manager (`fpga1`, ...).
    #[must_use]
    pub fn with_fpga_manager(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fpga_manager = dir.into();
        self
    }

    /// Use a different `u-dma-buf` device by name (`udmabuf1`, ...).
    #[must_use]
    pub fn with_udmabuf(mut self, name: &str) -> Self {
        self.udmabuf = UdmabufConfig {
            device: Path::new("/dev").join(name),
            sysfs: Path::new("/sys/class/u-dma-buf").join(name),
        };
        self
    }
}

fn read_attr(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| XcelError::configuration(format!("cannot read {}: {e}", path.display())))
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    trace!("{} <- {value}", path.display());
    std::fs::write(path, value)
        .map_err(|e| XcelError::hardware(format!("cannot write {}: {e}", path.display())))
}

/// Failures while bringing an overlay up are setup problems, not device faults.
fn loader_error(stage: &str, e: XcelError) -> XcelError {
    match e {
        XcelError::Hardware { reason } => XcelError::configuration(format!("{stage}: {reason}")),
        other => other,
    }
}

/// Parse a sysfs number, decimal or `0x` hex.
fn parse_attr_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Shared, read-write mapping of `size` bytes of `file` at `offset`.
fn map_shared(file: &File, size: usize, offset: u64) -> Result<NonNull<u8>> {
    // SAFETY: fd is open for read and write and outlives the mapping (the owning
    // struct keeps the File); size is non-zero; offset is page-aligned by callers.
    // The mapping is released in the owner's Drop.
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            file.as_fd(),
            offset,
        )
    }
    .map_err(|e| XcelError::hardware(format!("mmap of {size} bytes at {offset:#x} failed: {e}")))?;
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| XcelError::hardware("mmap returned a null mapping"))
}

/// An instance's control window mapped from physical memory.
#[derive(Debug)]
pub struct MmioWindow {
    ptr: NonNull<u8>,
    size: usize,
    base: u64,
    name: String,
    _file: File,
}

impl MmioWindow {
    /// Map `window` from `mem_device` (normally `/dev/mem`, opened `O_SYNC` so the
    /// mapping is uncached).
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened, the window is not
    /// page-aligned, or mmap fails.
    pub fn open(mem_device: &Path, name: &str, window: AddressWindow) -> Result<Self> {
        if window.base % PAGE_SIZE as u64 != 0 {
            return Err(XcelError::configuration(format!(
                "{name}: control window base {:#x} is not page-aligned",
                window.base
            )));
        }
        let size = usize::try_from(window.size())
            .ok()
            .filter(|&s| s >= 4)
            .ok_or_else(|| {
                XcelError::configuration(format!(
                    "{name}: unusable control window size {:#x}",
                    window.size()
                ))
            })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlags::SYNC.bits() as i32)
            .open(mem_device)
            .map_err(|e| {
                XcelError::hardware(format!(
                    "cannot open {}: {e} (root required)",
                    mem_device.display()
                ))
            })?;
        let ptr = map_shared(&file, size, window.base)?;
        debug!("{name}: mapped {size:#x} bytes of control space at {:#x}", window.base);
        Ok(Self {
            ptr,
            size,
            base: window.base,
            name: name.to_string(),
            _file: file,
        })
    }

    /// Physical base address.
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl RegisterIo for MmioWindow {
    fn read32(&mut self, offset: usize) -> Result<u32> {
        check_access(&self.name, offset, self.size)?;
        // SAFETY: offset + 4 <= size and offset is 4-aligned (check_access); ptr is a
        // live page-aligned mapping. Volatile: device registers have side effects.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        trace!("{}: read {offset:#x} = {value:#x}", self.name);
        Ok(value)
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<()> {
        check_access(&self.name, offset, self.size)?;
        trace!("{}: write {offset:#x} = {value:#x}", self.name);
        // SAFETY: as in read32.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }

    fn window_size(&self) -> usize {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned; unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::warn!("{}: munmap failed: {e}", self.name);
        }
    }
}

#[derive(Debug, Default)]
struct BumpState {
    next: usize,
    live: usize,
}

/// DMA domain over one `u-dma-buf` reserved region.
///
/// Allocation is a bump pointer. Releasing the most recent mapping gives its
/// pages back, and the region is recycled once every mapping has been
/// released. Space freed below a live mapping is not reused until then, so a
/// session that keeps reallocating under a long-lived buffer can exhaust the
/// region.
#[derive(Debug)]
pub struct UdmabufDomain {
    base: NonNull<u8>,
    size: usize,
    phys_addr: u64,
    sysfs: PathBuf,
    state: RefCell<BumpState>,
    _file: File,
}

impl UdmabufDomain {
    /// Open and map the whole reserved region.
    ///
    /// # Errors
    ///
    /// Returns an error if the device or its sysfs attributes are missing.
    pub fn open(config: &UdmabufConfig) -> Result<Self> {
        let phys_attr = read_attr(&config.sysfs.join("phys_addr"))?;
        let phys_addr = parse_attr_number(&phys_attr).ok_or_else(|| {
            XcelError::configuration(format!("unparseable u-dma-buf phys_addr '{phys_attr}'"))
        })?;
        let size_attr = read_attr(&config.sysfs.join("size"))?;
        let size = parse_attr_number(&size_attr)
            .and_then(|s| usize::try_from(s).ok())
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                XcelError::configuration(format!("unusable u-dma-buf size '{size_attr}'"))
            })?;

        // Cached mapping: coherence is maintained explicitly through sync_*.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|e| {
                XcelError::configuration(format!("cannot open {}: {e}", config.device.display()))
            })?;
        let base = map_shared(&file, size, 0)?;
        info!(
            "u-dma-buf {}: {} KiB at phys {phys_addr:#x}",
            config.device.display(),
            size >> 10
        );
        Ok(Self {
            base,
            size,
            phys_addr,
            sysfs: config.sysfs.clone(),
            state: RefCell::new(BumpState::default()),
            _file: file,
        })
    }

    /// Region size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Physical base address of the region.
    pub const fn phys_addr(&self) -> u64 {
        self.phys_addr
    }
}

impl DmaDomain for UdmabufDomain {
    fn map(&self, bytes: usize) -> Result<DmaMapping> {
        let size = page_round(bytes);
        let mut state = self.state.borrow_mut();
        let offset = state.next;
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(XcelError::allocation(
                bytes,
                format!(
                    "u-dma-buf exhausted ({} of {} bytes handed out)",
                    state.next, self.size
                ),
            ));
        }
        state.next += size;
        state.live += 1;

        // SAFETY: offset + size <= self.size, inside the live mapping.
        let host = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        // SAFETY: the region is ours exclusively; zero-fill matches DmaDomain::map.
        unsafe { std::ptr::write_bytes(host.as_ptr(), 0, size) };
        Ok(DmaMapping {
            host,
            device_address: self.phys_addr + offset as u64,
            size,
        })
    }

    fn unmap(&self, mapping: &DmaMapping) {
        let mut state = self.state.borrow_mut();
        state.live = state.live.saturating_sub(1);
        let offset = mapping
            .device_address
            .checked_sub(self.phys_addr)
            .and_then(|o| usize::try_from(o).ok());
        if state.live == 0 {
            state.next = 0;
        } else if let Some(offset) = offset.filter(|&o| o + mapping.size == state.next) {
            state.next = offset;
        }
        trace!("u-dma-buf release {:#x}", mapping.device_address);
    }

    fn sync(
        &self,
        mapping: &DmaMapping,
        offset: usize,
        len: usize,
        direction: SyncDirection,
    ) -> Result<()> {
        let region_offset = mapping
            .device_address
            .checked_sub(self.phys_addr)
            .ok_or_else(|| XcelError::hardware("sync of a mapping outside u-dma-buf"))?
            + offset as u64;
        let (code, trigger) = match direction {
            SyncDirection::ToDevice => ("1", "sync_for_device"),
            SyncDirection::FromDevice => ("2", "sync_for_cpu"),
        };
        write_attr(&self.sysfs.join("sync_offset"), &region_offset.to_string())?;
        write_attr(&self.sysfs.join("sync_size"), &len.to_string())?;
        write_attr(&self.sysfs.join("sync_direction"), code)?;
        write_attr(&self.sysfs.join(trigger), "1")
    }

    fn name(&self) -> &str {
        "u-dma-buf"
    }
}

impl Drop for UdmabufDomain {
    fn drop(&mut self) {
        // SAFETY: base/size are exactly what mmap returned; every DmaMemory holds an
        // Rc to this domain, so no mapping outlives it.
        if let Err(e) = unsafe { munmap(self.base.as_ptr().cast(), self.size) } {
            tracing::warn!("u-dma-buf munmap failed: {e}");
        }
    }
}

/// Real programmable logic driven through Linux interfaces.
#[derive(Debug)]
pub struct FabricPlatform {
    config: FabricConfig,
    dma: Option<Rc<UdmabufDomain>>,
}

impl FabricPlatform {
    /// Platform using `config`'s paths.
    pub const fn new(config: FabricConfig) -> Self {
        Self { config, dma: None }
    }

    /// `true` if the FPGA manager, physical memory device and DMA buffer exist.
    pub fn available(config: &FabricConfig) -> bool {
        config.fpga_manager.join("firmware").exists()
            && config.mem_device.exists()
            && config.udmabuf.device.exists()
    }

    fn load_bitstream(&self, image: &Path) -> Result<()> {
        let file_name = image
            .file_name()
            .ok_or_else(|| XcelError::configuration(format!("{} has no file name", image.display())))?;
        let staged = self.config.firmware_dir.join(file_name);
        if std::fs::canonicalize(image).ok() != std::fs::canonicalize(&staged).ok() {
            std::fs::copy(image, &staged).map_err(|e| {
                XcelError::configuration(format!(
                    "cannot stage {} into {}: {e}",
                    image.display(),
                    self.config.firmware_dir.display()
                ))
            })?;
        }

        let manager = &self.config.fpga_manager;
        if manager.join("flags").exists() {
            // Full reconfiguration.
            write_attr(&manager.join("flags"), "0")?;
        }
        write_attr(&manager.join("firmware"), &file_name.to_string_lossy())?;
        let state = read_attr(&manager.join("state"))?;
        if state != "operating" {
            return Err(XcelError::configuration(format!(
                "FPGA manager reports '{state}' after loading {}",
                image.display()
            )));
        }
        Ok(())
    }

    fn dma_domain(&mut self) -> Result<Rc<UdmabufDomain>> {
        if let Some(dma) = &self.dma {
            return Ok(Rc::clone(dma));
        }
        let dma = Rc::new(UdmabufDomain::open(&self.config.udmabuf)?);
        self.dma = Some(Rc::clone(&dma));
        Ok(dma)
    }
}

impl Platform for FabricPlatform {
    fn program(&mut self, image: &Path, handoff: &HardwareHandoff) -> Result<Overlay> {
        if !image.is_file() {
            return Err(XcelError::missing_artifact("bitstream", image));
        }
        self.load_bitstream(image).map_err(|e| loader_error("programming", e))?;
        info!("Programmed fabric with {}", image.display());

        let dma: Rc<dyn DmaDomain> = self.dma_domain().map_err(|e| loader_error("opening DMA", e))?;
        let mut overlay = Overlay::new(image, dma);
        for module in handoff.modules() {
            let (Some(window), Some(_)) = (module.window(), module_profile(module)) else {
                continue;
            };
            let io = MmioWindow::open(&self.config.mem_device, module.instance(), window)
                .map_err(|e| loader_error("mapping control window", e))?;
            overlay = overlay.with_instance(module.instance(), Box::new(io));
        }
        Ok(overlay)
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Fabric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A scratch directory laid out like the sysfs/devfs nodes the platform uses.
    fn scratch(udmabuf_bytes: u64, mem_bytes: u64) -> (TempDir, FabricConfig) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let config = FabricConfig {
            fpga_manager: root.join("fpga0"),
            firmware_dir: root.join("firmware"),
            mem_device: root.join("mem"),
            udmabuf: UdmabufConfig {
                device: root.join("udmabuf0"),
                sysfs: root.join("udmabuf-sysfs"),
            },
        };
        std::fs::create_dir_all(&config.fpga_manager).unwrap();
        std::fs::create_dir_all(&config.firmware_dir).unwrap();
        std::fs::create_dir_all(&config.udmabuf.sysfs).unwrap();
        std::fs::write(config.fpga_manager.join("firmware"), "").unwrap();
        std::fs::write(config.fpga_manager.join("state"), "operating\n").unwrap();
        File::create(&config.mem_device).unwrap().set_len(mem_bytes).unwrap();
        File::create(&config.udmabuf.device)
            .unwrap()
            .set_len(udmabuf_bytes)
            .unwrap();
        std::fs::write(config.udmabuf.sysfs.join("phys_addr"), "0x3f000000\n").unwrap();
        std::fs::write(
            config.udmabuf.sysfs.join("size"),
            format!("{udmabuf_bytes}\n"),
        )
        .unwrap();
        (dir, config)
    }

    #[test]
    fn attr_numbers() {
        assert_eq!(parse_attr_number("0x3f000000\n"), Some(0x3f00_0000));
        assert_eq!(parse_attr_number("1048576"), Some(1 << 20));
        assert_eq!(parse_attr_number("lots"), None);
    }

    #[test]
    fn udmabuf_bump_allocation_and_sync_attributes() {
        let (_dir, config) = scratch(16 * 4096, 4096);
        let domain = UdmabufDomain::open(&config.udmabuf).unwrap();
        assert_eq!(domain.phys_addr(), 0x3f00_0000);

        let a = domain.map(100).unwrap();
        let b = domain.map(5000).unwrap();
        assert_eq!(a.device_address, 0x3f00_0000);
        assert_eq!(b.device_address, 0x3f00_1000);

        domain.sync(&b, 8, 64, SyncDirection::FromDevice).unwrap();
        let attr = |name: &str| std::fs::read_to_string(config.udmabuf.sysfs.join(name)).unwrap();
        assert_eq!(attr("sync_offset"), "4104");
        assert_eq!(attr("sync_size"), "64");
        assert_eq!(attr("sync_direction"), "2");
        assert_eq!(attr("sync_for_cpu"), "1");

        assert!(domain.map(15 * 4096).is_err());
        domain.unmap(&b);
        let c = domain.map(4096).unwrap();
        assert_eq!(c.device_address, 0x3f00_1000);
        domain.unmap(&c);
        domain.unmap(&a);
        assert_eq!(domain.map(15 * 4096).unwrap().device_address, 0x3f00_0000);
    }

    #[test]
    fn mmio_window_round_trips_words() {
        let (_dir, config) = scratch(4096, 0x2_0000);
        let window = AddressWindow {
            base: 0x1_0000,
            high: 0x1_FFFF,
        };
        let mut io = MmioWindow::open(&config.mem_device, "vvadd_0", window).unwrap();
        io.write32(0x34, 7).unwrap();
        assert_eq!(io.read32(0x34).unwrap(), 7);
        assert!(io.read32(0x1_0000).is_err());
    }

    #[test]
    fn program_stages_firmware_and_maps_instances() {
        let (dir, config) = scratch(16 * 4096, 0x2_0000);
        let image = dir.path().join("vvadd.bit");
        std::fs::write(&image, b"bits").unwrap();
        let handoff = HardwareHandoff::parse(
            r#"<EDKSYSTEM><MODULES>
                 <MODULE INSTANCE="ps7" MODTYPE="processing_system7">
                   <MEMORYMAP>
                     <MEMRANGE INSTANCE="vvadd_0" BASEVALUE="0x10000" HIGHVALUE="0x1FFFF"/>
                   </MEMORYMAP>
                 </MODULE>
                 <MODULE INSTANCE="vvadd_0" MODTYPE="vvadd"/>
               </MODULES></EDKSYSTEM>"#,
        )
        .unwrap();

        assert!(FabricPlatform::available(&config));
        let mut platform = FabricPlatform::new(config.clone());
        let mut overlay = platform.program(&image, &handoff).unwrap();
        assert!(config.firmware_dir.join("vvadd.bit").exists());
        assert_eq!(
            std::fs::read_to_string(config.fpga_manager.join("firmware")).unwrap(),
            "vvadd.bit"
        );
        let io = overlay.take_instance("vvadd_0").unwrap();
        assert_eq!(io.window_size(), 0x1_0000);
    }

    #[test]
    fn program_fails_when_manager_not_operating() {
        let (dir, config) = scratch(4096, 4096);
        std::fs::write(config.fpga_manager.join("state"), "write error\n").unwrap();
        let image = dir.path().join("x.bit");
        std::fs::write(&image, b"bits").unwrap();
        let handoff = HardwareHandoff::parse("<EDKSYSTEM/>").unwrap();
        let err = FabricPlatform::new(config).program(&image, &handoff).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unwritable_firmware_attribute_is_configuration_error() {
        let (dir, config) = scratch(4096, 4096);
        std::fs::remove_file(config.fpga_manager.join("firmware")).unwrap();
        std::fs::create_dir(config.fpga_manager.join("firmware")).unwrap();
        let image = dir.path().join("x.bit");
        std::fs::write(&image, b"bits").unwrap();
        let handoff = HardwareHandoff::parse("<EDKSYSTEM/>").unwrap();
        let err = FabricPlatform::new(config).program(&image, &handoff).unwrap_err();
        assert!(err.is_configuration(), "{err:?}");
        assert!(err.to_string().contains("firmware"));
    }

    #[test]
    fn session_reports_loader_failure_as_configuration() {
        use crate::session::{AcceleratorSession, SessionConfig};
        use xcel_chip::Profile;

        let (dir, config) = scratch(4096, 0x2_0000);
        std::fs::remove_file(config.fpga_manager.join("firmware")).unwrap();
        std::fs::create_dir(config.fpga_manager.join("firmware")).unwrap();
        let image = dir.path().join("vvadd.bit");
        std::fs::write(&image, b"bits").unwrap();
        let layout = [("CTRL", 0x00), ("a_1", 0x10), ("b_1", 0x1C), ("c_1", 0x28), ("n", 0x34)];
        let registers: String = layout
            .iter()
            .map(|(name, offset)| {
                format!(
                    r#"<REGISTER NAME="{name}"><PROPERTY NAME="ADDRESS_OFFSET" VALUE="{offset}"/></REGISTER>"#
                )
            })
            .collect();
        std::fs::write(
            dir.path().join("vvadd.hwh"),
            format!(
                r#"<EDKSYSTEM><MODULES>
                     <MODULE INSTANCE="vvadd_0" MODTYPE="vvadd">{registers}</MODULE>
                   </MODULES></EDKSYSTEM>"#
            ),
        )
        .unwrap();

        let mut session = AcceleratorSession::new(
            Box::new(FabricPlatform::new(config)),
            SessionConfig::new(Profile::VectorAdd),
        );
        let err = session.program(&image).unwrap_err();
        assert!(err.is_configuration(), "{err:?}");
        assert!(session.register_map().is_none());
    }

    #[test]
    #[ignore = "requires programmable logic and root"]
    fn program_real_fabric() {
        let config = FabricConfig::default();
        assert!(FabricPlatform::available(&config));
    }
}
