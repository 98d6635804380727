// SPDX-License-Identifier: AGPL-3.0-only

//! Software (simulated fabric) platform
//!
//! Runs the whole host-side protocol without an FPGA:
//!
//! - [`SimulatedMemory`] is a [`DmaDomain`] over page-aligned heap allocations
//!   with a synthetic device address space starting at [`DEVICE_BASE`].
//! - [`SimulatedAccelerator`] is a [`RegisterIo`] register file that behaves like
//!   an HLS `ap_ctrl_hs` block: `ap_start` launches the kernel, `ap_done` rises
//!   after a configurable number of status polls and clears on read, `ap_idle`
//!   is set whenever the block is not running.
//! - [`SoftwarePlatform`] "programs" an image by instantiating one simulated
//!   accelerator for every handoff module that names a known kernel, at the
//!   register offsets the handoff declares.
//!
//! The kernels read and write simulated memory through device addresses only,
//! the same way the `m_axi` masters do on silicon.

use crate::dma::{page_round, DmaDomain, DmaMapping, PinnedAlloc, SyncDirection};
use crate::error::{Result, XcelError};
use crate::handoff::{HardwareHandoff, IpModule};
use crate::platform::{check_access, Overlay, Platform, PlatformKind, RegisterIo};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};
use xcel_chip::ctrl::{AP_DONE, AP_IDLE, AP_READY, AP_START, AUTO_RESTART, HOST_WRITABLE};
use xcel_chip::{Operand, Profile};

/// First device address handed out by [`SimulatedMemory`].
pub const DEVICE_BASE: u64 = 0x1000_0000;

/// Control window size used when the handoff declares none.
pub const DEFAULT_WINDOW: usize = 0x1_0000;

const MAX_WINDOW: usize = 1 << 20;

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareConfig {
    /// Capacity of the simulated DMA pool in bytes.
    pub memory_bytes: usize,
    /// Status polls between `ap_start` and `ap_done`.
    pub completion_polls: u32,
    /// Never assert `ap_done` (models a hung kernel).
    pub hang: bool,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 64 << 20,
            completion_polls: 4,
            hang: false,
        }
    }
}

impl SoftwareConfig {
    /// Set the DMA pool capacity.
    #[must_use]
    pub const fn with_memory_bytes(mut self, bytes: usize) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Set the completion latency in status polls.
    #[must_use]
    pub const fn with_completion_polls(mut self, polls: u32) -> Self {
        self.completion_polls = polls;
        self
    }

    /// Model a kernel that never finishes.
    #[must_use]
    pub const fn hung(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Access counters shared between a platform and everything it created.
#[derive(Debug, Default)]
struct Counters {
    register_reads: Cell<u64>,
    register_writes: Cell<u64>,
    launches: Cell<u64>,
}

impl Counters {
    fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }
}

/// Read-only view of a [`SoftwarePlatform`]'s activity, usable after the
/// platform has been moved into a session.
#[derive(Debug, Clone)]
pub struct SimulationProbe {
    counters: Rc<Counters>,
    memory: Rc<SimulatedMemory>,
}

impl SimulationProbe {
    /// Register reads across all simulated instances.
    pub fn register_reads(&self) -> u64 {
        self.counters.register_reads.get()
    }

    /// Register writes across all simulated instances.
    pub fn register_writes(&self) -> u64 {
        self.counters.register_writes.get()
    }

    /// Total register accesses.
    pub fn register_accesses(&self) -> u64 {
        self.register_reads() + self.register_writes()
    }

    /// Kernel launches (`ap_start` edges accepted).
    pub fn launches(&self) -> u64 {
        self.counters.launches.get()
    }

    /// The simulated DMA pool.
    pub fn memory(&self) -> &SimulatedMemory {
        &self.memory
    }
}

// ── Simulated memory ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    next: u64,
    in_use: usize,
    syncs: u64,
    regions: BTreeMap<u64, PinnedAlloc>,
}

/// Simulated device-visible memory pool.
///
/// Host pages are real heap pages; device addresses are synthetic and never
/// reused within one pool.
#[derive(Debug)]
pub struct SimulatedMemory {
    capacity: usize,
    state: RefCell<MemoryState>,
}

impl SimulatedMemory {
    /// Pool that can hold `capacity` bytes of page-rounded mappings.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: RefCell::new(MemoryState::default()),
        }
    }

    /// Pool capacity in bytes.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live mappings.
    pub fn mapped_regions(&self) -> usize {
        self.state.borrow().regions.len()
    }

    /// Bytes currently mapped (page-rounded).
    pub fn bytes_in_use(&self) -> usize {
        self.state.borrow().in_use
    }

    /// Cache maintenance operations performed.
    pub fn sync_count(&self) -> u64 {
        self.state.borrow().syncs
    }

    /// Locate `len` bytes at device `address`, returning the host pointer.
    fn resolve(&self, address: u64, len: usize) -> Result<*mut u8> {
        let state = self.state.borrow();
        let bus_error = || {
            XcelError::hardware(format!(
                "bus error: {len} bytes at device address {address:#x} not mapped"
            ))
        };
        let (&base, alloc) = state.regions.range(..=address).next_back().ok_or_else(bus_error)?;
        let offset = usize::try_from(address - base).map_err(|_| bus_error())?;
        if offset.checked_add(len).is_none_or(|end| end > alloc.size()) {
            return Err(bus_error());
        }
        // SAFETY: offset + len <= alloc.size(), so the result stays inside the allocation.
        Ok(unsafe { alloc.ptr().as_ptr().add(offset) })
    }

    /// Device-side read (an `m_axi` burst).
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Hardware`] if the range is not inside one mapping.
    pub fn device_read(&self, address: u64, out: &mut [u8]) -> Result<()> {
        let src = self.resolve(address, out.len())?;
        // SAFETY: src is valid for out.len() bytes (resolve checked the bounds) and
        // cannot overlap `out`, which is a distinct host allocation or stack buffer.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Device-side write.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Hardware`] if the range is not inside one mapping.
    pub fn device_write(&self, address: u64, data: &[u8]) -> Result<()> {
        let dst = self.resolve(address, data.len())?;
        // SAFETY: dst is valid for data.len() bytes; no host reference into the
        // mapping is alive while a kernel runs (the session holds &mut).
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }
}

impl DmaDomain for SimulatedMemory {
    fn map(&self, bytes: usize) -> Result<DmaMapping> {
        let size = page_round(bytes);
        let mut state = self.state.borrow_mut();
        if state.in_use.checked_add(size).is_none_or(|total| total > self.capacity) {
            return Err(XcelError::allocation(
                bytes,
                format!(
                    "simulated pool exhausted ({} of {} bytes in use)",
                    state.in_use, self.capacity
                ),
            ));
        }
        let alloc = PinnedAlloc::new(size)?;
        let device_address = DEVICE_BASE + state.next;
        state.next += size as u64;
        state.in_use += size;
        let mapping = DmaMapping {
            host: alloc.ptr(),
            device_address,
            size: alloc.size(),
        };
        state.regions.insert(device_address, alloc);
        Ok(mapping)
    }

    fn unmap(&self, mapping: &DmaMapping) {
        let mut state = self.state.borrow_mut();
        if let Some(alloc) = state.regions.remove(&mapping.device_address) {
            state.in_use -= alloc.size();
        } else {
            warn!(
                "unmap of unknown simulated region {:#x}",
                mapping.device_address
            );
        }
    }

    fn sync(
        &self,
        mapping: &DmaMapping,
        offset: usize,
        len: usize,
        direction: SyncDirection,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.regions.contains_key(&mapping.device_address) {
            return Err(XcelError::hardware(format!(
                "sync of unmapped region {:#x}",
                mapping.device_address
            )));
        }
        if offset.checked_add(len).is_none_or(|end| end > mapping.size) {
            return Err(XcelError::hardware(format!(
                "sync range {offset}+{len} exceeds {}-byte mapping",
                mapping.size
            )));
        }
        // Host and "device" share coherent memory; a fence is all the ordering needed.
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        state.syncs += 1;
        trace!(
            "sync {direction:?} {len} bytes at {:#x}+{offset}",
            mapping.device_address
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// ── Simulated accelerator ────────────────────────────────────────────────────

/// Register offsets the simulated block decodes.
#[derive(Debug, Clone, Copy)]
struct Ports {
    control: usize,
    a: usize,
    b: usize,
    c: Option<usize>,
    length: usize,
    result: Option<usize>,
}

impl Ports {
    /// Offsets from the handoff, falling back to the profile's table.
    fn resolve(profile: Profile, module: &IpModule) -> Result<Self> {
        let offset = |operand: Operand| -> Option<usize> {
            let spec = profile.register(operand)?;
            Some(
                module
                    .register_offset(operand.handoff_name())
                    .unwrap_or(spec.offset),
            )
        };
        let required = |operand: Operand| {
            offset(operand).ok_or_else(|| {
                XcelError::configuration(format!(
                    "profile {profile} has no {} register",
                    operand.name()
                ))
            })
        };
        Ok(Self {
            control: required(Operand::Control)?,
            a: required(Operand::OperandA)?,
            b: required(Operand::OperandB)?,
            c: offset(Operand::OperandC),
            length: required(Operand::Length)?,
            result: offset(Operand::Result),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    /// Running; `None` never completes.
    Busy { remaining: Option<u32> },
}

/// One simulated HLS block.
#[derive(Debug)]
pub struct SimulatedAccelerator {
    instance: String,
    profile: Profile,
    ports: Ports,
    words: Vec<u32>,
    status: u32,
    auto_restart: bool,
    run: RunState,
    config: SoftwareConfig,
    memory: Rc<SimulatedMemory>,
    counters: Rc<Counters>,
}

impl SimulatedAccelerator {
    fn new(
        module: &IpModule,
        profile: Profile,
        config: SoftwareConfig,
        memory: Rc<SimulatedMemory>,
        counters: Rc<Counters>,
    ) -> Result<Self> {
        let window = module
            .window()
            .and_then(|w| usize::try_from(w.size()).ok())
            .unwrap_or(DEFAULT_WINDOW)
            .clamp(64, MAX_WINDOW);
        let ports = Ports::resolve(profile, module)?;
        let highest = [
            Some(ports.control),
            Some(ports.a),
            Some(ports.b),
            ports.c,
            Some(ports.length),
            ports.result,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        // Every port is decoded as up to two words.
        if highest % 4 != 0 || highest + 8 > window {
            return Err(XcelError::configuration(format!(
                "{}: register offset {highest:#x} does not fit a {window:#x}-byte window",
                module.instance()
            )));
        }
        Ok(Self {
            instance: module.instance().to_string(),
            profile,
            ports,
            words: vec![0; window / 4],
            status: AP_IDLE,
            auto_restart: false,
            run: RunState::Idle,
            config,
            memory,
            counters,
        })
    }

    /// Kernel this block implements.
    pub const fn profile(&self) -> Profile {
        self.profile
    }

    fn word(&self, offset: usize) -> u32 {
        self.words[offset / 4]
    }

    fn address(&self, offset: usize) -> u64 {
        u64::from(self.word(offset)) | (u64::from(self.word(offset + 4)) << 32)
    }

    fn read_elements<T: bytemuck::Pod>(&self, address: u64, count: usize) -> Result<Vec<T>> {
        let mut values = vec![T::zeroed(); count];
        self.memory
            .device_read(address, bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }

    /// Execute the kernel body against simulated memory.
    fn execute(&mut self) -> Result<()> {
        let n = self.word(self.ports.length) as usize;
        let a = self.address(self.ports.a);
        let b = self.address(self.ports.b);
        debug!(
            "{}: {} n={n} a={a:#x} b={b:#x}",
            self.instance,
            self.profile.kernel()
        );
        match self.profile {
            Profile::VectorAdd => {
                let c_port = self.ports.c.ok_or_else(|| {
                    XcelError::configuration(format!("{}: no output port", self.instance))
                })?;
                let c = self.address(c_port);
                if n == 0 {
                    return Ok(());
                }
                let lhs: Vec<f32> = self.read_elements(a, n)?;
                let rhs: Vec<f32> = self.read_elements(b, n)?;
                let sum: Vec<f32> = lhs.iter().zip(&rhs).map(|(x, y)| x + y).collect();
                self.memory.device_write(c, bytemuck::cast_slice(&sum))?;
            }
            Profile::VectorDot => {
                let result_port = self.ports.result.ok_or_else(|| {
                    XcelError::configuration(format!("{}: no result port", self.instance))
                })?;
                let dot = if n == 0 {
                    0
                } else {
                    let lhs: Vec<i32> = self.read_elements(a, n)?;
                    let rhs: Vec<i32> = self.read_elements(b, n)?;
                    lhs.iter()
                        .zip(&rhs)
                        .fold(0i32, |acc, (x, y)| acc.wrapping_add(x.wrapping_mul(*y)))
                };
                // Two's complement bits of the int return value.
                self.words[result_port / 4] = dot as u32;
                if let Some(valid) = self.words.get_mut(result_port / 4 + 1) {
                    *valid = 1;
                }
            }
        }
        Ok(())
    }

    fn launch(&mut self) -> Result<()> {
        Counters::bump(&self.counters.launches);
        self.execute()?;
        self.status = AP_START;
        self.run = RunState::Busy {
            remaining: (!self.config.hang).then_some(self.config.completion_polls),
        };
        Ok(())
    }

    fn read_control(&mut self) -> u32 {
        if let RunState::Busy { remaining: Some(left) } = self.run {
            if left == 0 {
                self.status = AP_DONE | AP_IDLE | AP_READY;
                self.run = RunState::Idle;
            } else {
                self.run = RunState::Busy {
                    remaining: Some(left - 1),
                };
            }
        }
        let word = self.status | if self.auto_restart { AUTO_RESTART } else { 0 };
        // ap_done and ap_ready clear on read.
        self.status &= !(AP_DONE | AP_READY);
        word
    }

    fn write_control(&mut self, value: u32) -> Result<()> {
        let value = value & HOST_WRITABLE;
        self.auto_restart = value & AUTO_RESTART != 0;
        if value & AP_START != 0 {
            if self.run == RunState::Idle {
                return self.launch();
            }
            debug!("{}: ap_start while busy ignored", self.instance);
        }
        Ok(())
    }

    fn is_read_only(&self, offset: usize) -> bool {
        self.ports
            .result
            .is_some_and(|r| offset == r || offset == r + 4)
    }
}

impl RegisterIo for SimulatedAccelerator {
    fn read32(&mut self, offset: usize) -> Result<u32> {
        check_access(&self.instance, offset, self.window_size())?;
        Counters::bump(&self.counters.register_reads);
        if offset == self.ports.control {
            return Ok(self.read_control());
        }
        let value = self.word(offset);
        if self.ports.result.is_some_and(|r| offset == r + 4) {
            // result_ap_vld clears on read.
            self.words[offset / 4] = 0;
        }
        Ok(value)
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<()> {
        check_access(&self.instance, offset, self.window_size())?;
        Counters::bump(&self.counters.register_writes);
        if offset == self.ports.control {
            return self.write_control(value);
        }
        if self.is_read_only(offset) {
            trace!("{}: write to read-only {offset:#x} dropped", self.instance);
            return Ok(());
        }
        self.words[offset / 4] = value;
        Ok(())
    }

    fn window_size(&self) -> usize {
        self.words.len() * 4
    }

    fn name(&self) -> &str {
        &self.instance
    }
}

// ── Platform ─────────────────────────────────────────────────────────────────

/// Simulated fabric.
#[derive(Debug)]
pub struct SoftwarePlatform {
    config: SoftwareConfig,
    memory: Rc<SimulatedMemory>,
    counters: Rc<Counters>,
    programmed: Option<PathBuf>,
}

impl SoftwarePlatform {
    /// Simulator with the given configuration.
    pub fn new(config: SoftwareConfig) -> Self {
        let memory = Rc::new(SimulatedMemory::new(config.memory_bytes));
        info!(
            "Simulated fabric: {} MiB DMA pool, done after {} polls{}",
            config.memory_bytes >> 20,
            config.completion_polls,
            if config.hang { " (hang mode)" } else { "" }
        );
        Self {
            config,
            memory,
            counters: Rc::new(Counters::default()),
            programmed: None,
        }
    }

    /// Handle for observing activity after the platform is handed off.
    pub fn probe(&self) -> SimulationProbe {
        SimulationProbe {
            counters: Rc::clone(&self.counters),
            memory: Rc::clone(&self.memory),
        }
    }

    /// Image most recently programmed.
    pub fn programmed(&self) -> Option<&Path> {
        self.programmed.as_deref()
    }
}

impl Default for SoftwarePlatform {
    fn default() -> Self {
        Self::new(SoftwareConfig::default())
    }
}

/// Profile implemented by a handoff module, by instance name or module type.
pub(crate) fn module_profile(module: &IpModule) -> Option<Profile> {
    Profile::from_instance(module.instance())
        .or_else(|| module.modtype().and_then(Profile::from_kernel))
}

impl Platform for SoftwarePlatform {
    fn program(&mut self, image: &Path, handoff: &HardwareHandoff) -> Result<Overlay> {
        if !image.is_file() {
            return Err(XcelError::missing_artifact("bitstream", image));
        }
        let image_bytes = std::fs::metadata(image)
            .map_err(|e| XcelError::configuration(format!("cannot read {}: {e}", image.display())))?
            .len();
        if let Some(previous) = &self.programmed {
            info!("Reprogramming simulated fabric (was {})", previous.display());
        }

        let dma: Rc<dyn DmaDomain> = self.memory.clone();
        let mut overlay = Overlay::new(image, dma);
        for module in handoff.modules() {
            let Some(profile) = module_profile(module) else {
                trace!("{}: no simulated kernel, skipped", module.instance());
                continue;
            };
            let block = SimulatedAccelerator::new(
                module,
                profile,
                self.config.clone(),
                Rc::clone(&self.memory),
                Rc::clone(&self.counters),
            )?;
            debug!("{}: simulated {profile} block", module.instance());
            overlay = overlay.with_instance(module.instance(), Box::new(block));
        }

        info!(
            "Programmed simulated fabric from {} ({image_bytes} bytes, {} instances)",
            image.display(),
            overlay.instance_names().count()
        );
        self.programmed = Some(image.to_path_buf());
        Ok(overlay)
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Software
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xcel_chip::ctrl;

    const HWH: &str = r#"<EDKSYSTEM>
      <MODULES>
        <MODULE INSTANCE="vvadd_0" MODTYPE="vvadd">
          <REGISTERS>
            <REGISTER NAME="CTRL"><PROPERTY NAME="ADDRESS_OFFSET" VALUE="0x0"/></REGISTER>
          </REGISTERS>
        </MODULE>
        <MODULE INSTANCE="vvdot_0" MODTYPE="vvdot"/>
        <MODULE INSTANCE="axi_interconnect_0" MODTYPE="axi_interconnect"/>
      </MODULES>
    </EDKSYSTEM>"#;

    fn block(profile: Profile, config: SoftwareConfig) -> (SimulatedAccelerator, Rc<SimulatedMemory>) {
        let handoff = HardwareHandoff::parse(HWH).unwrap();
        let memory = Rc::new(SimulatedMemory::new(1 << 20));
        let module = handoff.module(profile.instance_name()).unwrap();
        let acc = SimulatedAccelerator::new(
            module,
            profile,
            config,
            Rc::clone(&memory),
            Rc::new(Counters::default()),
        )
        .unwrap();
        (acc, memory)
    }

    fn write_addr(acc: &mut SimulatedAccelerator, offset: usize, address: u64) {
        acc.write32(offset, address as u32).unwrap();
        acc.write32(offset + 4, (address >> 32) as u32).unwrap();
    }

    fn poll_done(acc: &mut SimulatedAccelerator) -> u32 {
        for polls in 1..=100 {
            let word = acc.read32(0).unwrap();
            if ctrl::is_done(word) {
                return polls;
            }
        }
        panic!("never completed");
    }

    #[test]
    fn device_addresses_are_bumped_and_disjoint() {
        let memory = SimulatedMemory::new(1 << 20);
        let a = memory.map(10).unwrap();
        let b = memory.map(5000).unwrap();
        assert_eq!(a.device_address, DEVICE_BASE);
        assert_eq!(b.device_address, DEVICE_BASE + 4096);
        assert_eq!(b.size, 8192);
        assert_eq!(memory.bytes_in_use(), 3 * 4096);
        memory.unmap(&a);
        memory.unmap(&b);
        assert_eq!(memory.bytes_in_use(), 0);
        assert_eq!(memory.map(1).unwrap().device_address, DEVICE_BASE + 3 * 4096);
    }

    #[test]
    fn pool_exhaustion_is_an_allocation_error() {
        let memory = SimulatedMemory::new(8192);
        let _a = memory.map(8192).unwrap();
        let err = memory.map(1).unwrap_err();
        assert!(matches!(err, XcelError::Allocation { bytes: 1, .. }));
    }

    #[test]
    fn device_access_outside_mappings_faults() {
        let memory = SimulatedMemory::new(1 << 20);
        let m = memory.map(16).unwrap();
        memory.device_write(m.device_address, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        memory.device_read(m.device_address, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        assert!(memory.device_read(DEVICE_BASE - 4, &mut out).is_err());
        assert!(memory.device_read(m.device_address + 4094, &mut out).is_err());
    }

    #[test]
    fn idle_after_reset_and_done_clears_on_read() {
        let (mut acc, memory) = block(Profile::VectorAdd, SoftwareConfig::default());
        assert!(ctrl::is_idle(acc.read32(0).unwrap()));

        let buf = memory.map(16).unwrap();
        for offset in [0x10, 0x1C, 0x28] {
            write_addr(&mut acc, offset, buf.device_address);
        }
        acc.write32(0x34, 0).unwrap();
        acc.write32(0, ctrl::start_bit()).unwrap();

        let busy = acc.read32(0).unwrap();
        assert!(ctrl::is_started(busy) && !ctrl::is_idle(busy));
        poll_done(&mut acc);
        let after = acc.read32(0).unwrap();
        assert!(!ctrl::is_done(after));
        assert!(ctrl::is_idle(after));
    }

    #[test]
    fn vvadd_kernel_adds_in_device_memory() {
        let config = SoftwareConfig {
            completion_polls: 0,
            ..SoftwareConfig::default()
        };
        let (mut acc, memory) = block(Profile::VectorAdd, config);
        let a = memory.map(12).unwrap();
        let b = memory.map(12).unwrap();
        let c = memory.map(12).unwrap();
        memory
            .device_write(a.device_address, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]))
            .unwrap();
        memory
            .device_write(b.device_address, bytemuck::cast_slice(&[4.0f32, 5.0, 6.0]))
            .unwrap();

        write_addr(&mut acc, 0x10, a.device_address);
        write_addr(&mut acc, 0x1C, b.device_address);
        write_addr(&mut acc, 0x28, c.device_address);
        acc.write32(0x34, 3).unwrap();
        acc.write32(0, ctrl::start_bit()).unwrap();
        assert_eq!(poll_done(&mut acc), 1);

        let mut out = [0f32; 3];
        memory
            .device_read(c.device_address, bytemuck::cast_slice_mut(&mut out))
            .unwrap();
        assert_eq!(out, [5.0, 7.0, 9.0]);
    }

    #[test]
    fn vvdot_result_register_is_read_only() {
        let config = SoftwareConfig {
            completion_polls: 2,
            ..SoftwareConfig::default()
        };
        let (mut acc, memory) = block(Profile::VectorDot, config);
        let a = memory.map(12).unwrap();
        let b = memory.map(12).unwrap();
        memory
            .device_write(a.device_address, bytemuck::cast_slice(&[1i32, 2, 3]))
            .unwrap();
        memory
            .device_write(b.device_address, bytemuck::cast_slice(&[4i32, -5, 6]))
            .unwrap();
        write_addr(&mut acc, 0x10, a.device_address);
        write_addr(&mut acc, 0x1C, b.device_address);
        acc.write32(0x28, 3).unwrap();
        acc.write32(0, ctrl::start_bit()).unwrap();
        assert_eq!(poll_done(&mut acc), 3);

        assert_eq!(acc.read32(0x30).unwrap() as i32, 12);
        acc.write32(0x30, 99).unwrap();
        assert_eq!(acc.read32(0x30).unwrap() as i32, 12);
        assert_eq!(acc.read32(0x34).unwrap(), 1);
        assert_eq!(acc.read32(0x34).unwrap(), 0);
    }

    #[test]
    fn hang_mode_never_completes() {
        let config = SoftwareConfig {
            hang: true,
            ..SoftwareConfig::default()
        };
        let (mut acc, _memory) = block(Profile::VectorDot, config);
        acc.write32(0x28, 0).unwrap();
        acc.write32(0, ctrl::start_bit()).unwrap();
        for _ in 0..1000 {
            assert!(!ctrl::is_done(acc.read32(0).unwrap()));
        }
    }

    #[test]
    fn kernel_fault_surfaces_on_start() {
        let (mut acc, _memory) = block(Profile::VectorAdd, SoftwareConfig::default());
        write_addr(&mut acc, 0x10, 0xdead_0000);
        acc.write32(0x34, 4).unwrap();
        let err = acc.write32(0, ctrl::start_bit()).unwrap_err();
        assert!(err.to_string().contains("bus error"));
    }

    #[test]
    fn out_of_window_access_rejected() {
        let (mut acc, _memory) = block(Profile::VectorAdd, SoftwareConfig::default());
        assert!(acc.read32(DEFAULT_WINDOW).is_err());
        assert!(acc.write32(3, 0).is_err());
    }

    #[test]
    fn program_instantiates_known_kernels_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("acc.bit");
        std::fs::write(&image, b"bitstream").unwrap();
        let handoff = HardwareHandoff::parse(HWH).unwrap();

        let mut platform = SoftwarePlatform::default();
        let overlay = platform.program(&image, &handoff).unwrap();
        let names: Vec<&str> = overlay.instance_names().collect();
        assert_eq!(names, ["vvadd_0", "vvdot_0"]);
        assert_eq!(platform.programmed(), Some(image.as_path()));
    }

    #[test]
    fn program_requires_image() {
        let handoff = HardwareHandoff::parse(HWH).unwrap();
        let mut platform = SoftwarePlatform::default();
        let err = platform
            .program(Path::new("/nonexistent/acc.bit"), &handoff)
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(platform.probe().register_accesses(), 0);
    }
}
