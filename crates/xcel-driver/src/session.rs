//! Accelerator session
//!
//! One programmed accelerator instance plus the buffers bound to it.
//!
//! ```text
//! Unprogrammed ──program──▶ Programmed ──load_inputs──▶ InputsLoaded
//!                                                          │
//!                         (vector profiles) allocate_output▼
//!                                                   OutputAllocated
//!                                                          │
//!                               run: sync ▶ args ▶ start ▶ poll ▶ sync
//!                                                          │
//!                               back to the bound state ◀──┘
//! ```
//!
//! The session owns every buffer it allocates; dropping it releases them.

use crate::buffer::{DeviceBuffer, HostSlice};
use crate::dma::DmaDomain;
use crate::error::{Result, XcelError};
use crate::handoff::{companion_path, HardwareHandoff};
use crate::platform::{select_platform, Overlay, Platform, PlatformSelection, RegisterIo};
use crate::regmap::RegisterMap;
use crate::wait::{wait_for_done, WaitPolicy};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};
use xcel_chip::{ctrl, ElementType, Operand, OutputKind, Profile};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Kernel interface to drive.
    pub profile: Profile,
    /// Instance to bind; the profile's conventional name when `None`.
    pub instance: Option<String>,
    /// Completion wait policy.
    pub wait: WaitPolicy,
}

impl SessionConfig {
    /// Defaults for `profile`.
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            instance: None,
            wait: WaitPolicy::unbounded(),
        }
    }

    /// Bind a specific block-design instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Use `wait` for completion.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Shorthand for a deadline-bounded wait.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wait = self.wait.with_deadline(timeout);
        self
    }

    fn instance_name(&self) -> &str {
        self.instance
            .as_deref()
            .unwrap_or_else(|| self.profile.instance_name())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Profile::VectorAdd)
    }
}

/// Lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No image bound.
    Unprogrammed,
    /// Bound, no buffers.
    Programmed,
    /// Input buffers hold data.
    InputsLoaded,
    /// Inputs and output buffer present.
    OutputAllocated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unprogrammed => "unprogrammed",
            Self::Programmed => "programmed",
            Self::InputsLoaded => "inputs loaded",
            Self::OutputAllocated => "output allocated",
        };
        f.write_str(name)
    }
}

/// What a run produced.
#[derive(Debug, Clone, Copy)]
pub enum Output<'a> {
    /// Output vector, synced for host reads.
    Vector(&'a DeviceBuffer),
    /// Value of the `result` register, sign-extended.
    Scalar(i64),
}

impl<'a> Output<'a> {
    /// The output buffer, for vector profiles.
    pub const fn vector(&self) -> Option<&'a DeviceBuffer> {
        match *self {
            Self::Vector(buffer) => Some(buffer),
            Self::Scalar(_) => None,
        }
    }

    /// The result value, for scalar profiles.
    pub const fn scalar(&self) -> Option<i64> {
        match *self {
            Self::Vector(_) => None,
            Self::Scalar(value) => Some(value),
        }
    }
}

/// Outcome of [`AcceleratorSession::run`].
#[derive(Debug, Clone, Copy)]
pub struct RunReport<'a> {
    /// Result view.
    pub output: Output<'a>,
    /// Time spent waiting for `ap_done` (poll loop only).
    pub elapsed: Duration,
    /// Control register reads during the wait.
    pub polls: u64,
}

/// Everything that exists only once the session is programmed.
#[derive(Debug)]
struct Binding {
    image: PathBuf,
    instance: String,
    io: Box<dyn RegisterIo>,
    map: RegisterMap,
    dma: Rc<dyn DmaDomain>,
    inputs: Option<(DeviceBuffer, DeviceBuffer)>,
    output: Option<DeviceBuffer>,
    _overlay: Overlay,
}

/// Host-side driver for one accelerator instance.
#[derive(Debug)]
pub struct AcceleratorSession {
    platform: Box<dyn Platform>,
    config: SessionConfig,
    binding: Option<Binding>,
}

impl AcceleratorSession {
    /// Unprogrammed session on `platform`.
    pub fn new(platform: Box<dyn Platform>, config: SessionConfig) -> Self {
        Self {
            platform,
            config,
            binding: None,
        }
    }

    /// Unprogrammed session on a selected platform.
    ///
    /// # Errors
    ///
    /// Returns an error if the selected platform is unavailable.
    pub fn open(selection: PlatformSelection, config: SessionConfig) -> Result<Self> {
        Ok(Self::new(select_platform(selection)?, config))
    }

    /// Lifecycle position.
    pub fn state(&self) -> SessionState {
        match &self.binding {
            None => SessionState::Unprogrammed,
            Some(b) if b.output.is_some() => SessionState::OutputAllocated,
            Some(b) if b.inputs.is_some() => SessionState::InputsLoaded,
            Some(_) => SessionState::Programmed,
        }
    }

    /// Profile being driven.
    pub const fn profile(&self) -> Profile {
        self.config.profile
    }

    /// Configuration.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register map, once programmed.
    pub fn register_map(&self) -> Option<&RegisterMap> {
        self.binding.as_ref().map(|b| &b.map)
    }

    /// Image the session is bound to.
    pub fn image(&self) -> Option<&Path> {
        self.binding.as_ref().map(|b| b.image.as_path())
    }

    /// Element count of the loaded inputs.
    pub fn input_len(&self) -> Option<usize> {
        self.binding
            .as_ref()
            .and_then(|b| b.inputs.as_ref())
            .map(|(a, _)| a.len())
    }

    /// Input buffers, once loaded.
    pub fn inputs(&self) -> Option<(&DeviceBuffer, &DeviceBuffer)> {
        self.binding
            .as_ref()
            .and_then(|b| b.inputs.as_ref())
            .map(|(a, b)| (a, b))
    }

    /// Output buffer, once allocated.
    pub fn output(&self) -> Option<&DeviceBuffer> {
        self.binding.as_ref().and_then(|b| b.output.as_ref())
    }

    fn binding_mut(&mut self, operation: &'static str) -> Result<&mut Binding> {
        self.binding
            .as_mut()
            .ok_or(XcelError::not_ready(operation, "a programmed session"))
    }

    /// Program the fabric with `image` and bind the profile's instance.
    ///
    /// The companion handoff (`<image stem>.hwh`) must exist next to the image.
    /// Both files are checked, and the register layout validated against the
    /// handoff, before the platform is asked to do anything.
    ///
    /// # Errors
    ///
    /// - [`XcelError::AlreadyProgrammed`] if the session is already bound
    /// - [`XcelError::MissingArtifact`] if the image or handoff is absent
    /// - [`XcelError::Configuration`] for an unusable handoff, a layout mismatch
    ///   or any failure of the platform loader
    pub fn program(&mut self, image: impl AsRef<Path>) -> Result<()> {
        let image = image.as_ref();
        if let Some(binding) = &self.binding {
            return Err(XcelError::AlreadyProgrammed {
                image: binding.image.clone(),
            });
        }
        if !image.is_file() {
            return Err(XcelError::missing_artifact("bitstream", image));
        }
        let handoff = HardwareHandoff::load(&companion_path(image))?;

        let profile = self.config.profile;
        let instance = self.config.instance_name().to_string();
        let module = handoff.module(&instance).ok_or_else(|| {
            XcelError::configuration(format!(
                "handoff {} has no instance '{instance}'",
                companion_path(image).display()
            ))
        })?;
        if let Some(kernel) = module.modtype().and_then(Profile::from_kernel) {
            if kernel != profile {
                return Err(XcelError::configuration(format!(
                    "instance {instance} implements {kernel}, session expects {profile}"
                )));
            }
        }
        let map = RegisterMap::from_handoff(profile, module)?;

        let mut overlay = self.platform.program(image, &handoff).map_err(|e| {
            if e.is_configuration() {
                e
            } else {
                XcelError::configuration(format!("loading {}: {e}", image.display()))
            }
        })?;
        let mut io = overlay.take_instance(&instance)?;
        map.write(&mut *io, Operand::Control.name(), u64::from(ctrl::reset_word()))?;
        let dma = Rc::clone(overlay.dma());

        info!(
            "Programmed {} on {}: {instance} ({profile}, DMA via {})",
            image.display(),
            self.platform.kind(),
            dma.name()
        );
        self.binding = Some(Binding {
            image: image.to_path_buf(),
            instance,
            io,
            map,
            dma,
            inputs: None,
            output: None,
            _overlay: overlay,
        });
        Ok(())
    }

    /// Copy two input vectors into device buffers (no sync yet).
    ///
    /// Buffers of the right length are reused; an output buffer survives only
    /// if its length still matches. Buffers of another length are released
    /// first, so a failed allocation leaves the session `Programmed`.
    ///
    /// # Errors
    ///
    /// - [`XcelError::NotReady`] before `program`
    /// - [`XcelError::Shape`] if the lengths differ
    /// - [`XcelError::Type`] if the element types differ or the profile does not
    ///   carry them
    /// - [`XcelError::InvalidValue`] for empty inputs
    pub fn load_inputs<'a>(
        &mut self,
        a: impl Into<HostSlice<'a>>,
        b: impl Into<HostSlice<'a>>,
    ) -> Result<()> {
        let (a, b) = (a.into(), b.into());
        let expected = self.config.profile.element_type();
        let binding = self.binding_mut("load_inputs")?;

        if a.len() != b.len() {
            return Err(XcelError::shape(format!(
                "inputs have {} and {} elements",
                a.len(),
                b.len()
            )));
        }
        if a.element_type() != b.element_type() {
            return Err(XcelError::Type {
                expected: a.element_type(),
                actual: b.element_type(),
            });
        }
        if a.element_type() != expected {
            return Err(XcelError::Type {
                expected,
                actual: a.element_type(),
            });
        }
        if a.is_empty() {
            return Err(XcelError::invalid_value("inputs must not be empty"));
        }

        let n = a.len();
        // Buffers of another length are released before the new pair is
        // allocated; if that allocation fails the session is left Programmed.
        if binding.inputs.as_ref().is_some_and(|(x, _)| x.len() != n) {
            binding.inputs = None;
        }
        if binding.output.as_ref().is_some_and(|c| c.len() != n) {
            debug!("{}: output length no longer matches, released", binding.instance);
            binding.output = None;
        }
        let (buf_a, buf_b) = match &mut binding.inputs {
            Some((x, y)) => (x, y),
            inputs @ None => {
                let buf_a = DeviceBuffer::allocate(&binding.dma, n, expected)?;
                let buf_b = DeviceBuffer::allocate(&binding.dma, n, expected)?;
                let (x, y) = inputs.insert((buf_a, buf_b));
                (x, y)
            }
        };
        buf_a.copy_from(a)?;
        buf_b.copy_from(b)?;
        debug!("{}: loaded {n} x {expected} inputs", binding.instance);
        Ok(())
    }

    /// Allocate the output vector.
    ///
    /// # Errors
    ///
    /// - [`XcelError::NotReady`] before `program` or before inputs are loaded
    /// - [`XcelError::UnsupportedOperation`] for scalar-result profiles
    /// - [`XcelError::InvalidValue`] for `n == 0`
    /// - [`XcelError::Shape`] if `n` differs from the input length
    pub fn allocate_output(&mut self, n: usize) -> Result<&DeviceBuffer> {
        let profile = self.config.profile;
        let binding = self.binding_mut("allocate_output")?;
        if profile.output() == OutputKind::Scalar {
            return Err(XcelError::UnsupportedOperation {
                operation: "allocate_output",
                profile,
            });
        }
        if n == 0 {
            return Err(XcelError::invalid_value("output length must be > 0"));
        }
        let input_len = binding
            .inputs
            .as_ref()
            .map(|(a, _)| a.len())
            .ok_or(XcelError::not_ready("allocate_output", "loaded inputs"))?;
        if n != input_len {
            return Err(XcelError::shape(format!(
                "output of {n} elements for inputs of {input_len}"
            )));
        }

        let output = match binding.output.take() {
            Some(existing) if existing.len() == n => existing,
            _ => DeviceBuffer::allocate(&binding.dma, n, profile.element_type())?,
        };
        let output: &DeviceBuffer = binding.output.insert(output);
        Ok(output)
    }

    /// Execute the kernel once over the bound buffers.
    ///
    /// # Errors
    ///
    /// - [`XcelError::NotReady`] if the buffers the profile needs are not bound
    /// - [`XcelError::Timeout`] / [`XcelError::Cancelled`] per the wait policy
    /// - register and sync failures from the platform
    pub fn run(&mut self) -> Result<RunReport<'_>> {
        let profile = self.config.profile;
        let wait = self.config.wait.clone();
        let binding = self.binding_mut("run")?;
        let Binding {
            io,
            map,
            inputs,
            output,
            instance,
            ..
        } = binding;
        let (a, b) = inputs
            .as_mut()
            .ok_or(XcelError::not_ready("run", "loaded inputs"))?;
        if profile.output() == OutputKind::Vector && output.is_none() {
            return Err(XcelError::not_ready("run", "an allocated output buffer"));
        }
        let io: &mut dyn RegisterIo = &mut **io;

        a.sync_to_device()?;
        b.sync_to_device()?;
        map.write(io, Operand::OperandA.name(), a.address())?;
        map.write(io, Operand::OperandB.name(), b.address())?;
        if let Some(c) = output.as_ref() {
            map.write(io, Operand::OperandC.name(), c.address())?;
        }
        map.write(io, Operand::Length.name(), a.len() as u64)?;
        debug!(
            "{instance}: start {profile} n={} a={:#x} b={:#x}",
            a.len(),
            a.address(),
            b.address()
        );
        map.write(io, Operand::Control.name(), u64::from(ctrl::start_bit()))?;

        let control = map.offset_of(Operand::Control.name())?;
        let completion = wait_for_done(io, control, &wait)?;

        let output = match profile.output() {
            OutputKind::Vector => {
                let c = output
                    .as_mut()
                    .ok_or(XcelError::not_ready("run", "an allocated output buffer"))?;
                c.mark_device_written();
                c.sync_from_device()?;
                Output::Vector(c)
            }
            OutputKind::Scalar => {
                let bits = map.read(io, Operand::Result.name())?;
                Output::Scalar(scalar_value(bits, profile.element_type()))
            }
        };
        info!(
            "{instance}: {profile} completed in {:?} ({} polls)",
            completion.elapsed, completion.polls
        );
        Ok(RunReport {
            output,
            elapsed: completion.elapsed,
            polls: completion.polls,
        })
    }
}

/// Interpret raw `result` register bits as the profile's element type.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn scalar_value(bits: u64, element_type: ElementType) -> i64 {
    match element_type {
        ElementType::I32 => i64::from(bits as u32 as i32),
        _ => bits as i64,
    }
}
