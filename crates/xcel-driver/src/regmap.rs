//! Named register access
//!
//! A [`RegisterMap`] resolves operand names (`control`, `operand_a`, ...) to the
//! offsets of one [`RegisterLayout`] and performs the raw 32-bit accesses on a
//! [`RegisterIo`] handle. Offsets never change after construction.

use crate::error::{Result, XcelError};
use crate::handoff::IpModule;
use crate::platform::RegisterIo;
use tracing::{debug, trace};
use xcel_chip::profile::LAYOUT_VERSION;
use xcel_chip::{ctrl, Access, Operand, Profile, RegisterSpec, Width};

/// A versioned register table for one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    profile: Profile,
    version: u32,
    entries: &'static [RegisterSpec],
}

impl RegisterLayout {
    /// Built-in layout of `profile`.
    pub const fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            version: LAYOUT_VERSION,
            entries: profile.registers(),
        }
    }

    /// Profile this layout describes.
    pub const fn profile(&self) -> Profile {
        self.profile
    }

    /// Layout version.
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// All entries.
    pub const fn entries(&self) -> &'static [RegisterSpec] {
        self.entries
    }

    /// Check every entry against the register offsets a handoff declares.
    ///
    /// The low word of a 64-bit register is looked up as `x_1`; when the
    /// handoff also lists `x_2` it must sit four bytes above.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Configuration`] naming the first register that is
    /// absent or placed differently.
    pub fn validate(&self, module: &IpModule) -> Result<()> {
        for entry in self.entries {
            let name = entry.operand.handoff_name();
            let found = module.register_offset(name).ok_or_else(|| {
                XcelError::configuration(format!(
                    "{}: handoff has no register {name} required by {} layout v{}",
                    module.instance(),
                    self.profile,
                    self.version
                ))
            })?;
            if found != entry.offset {
                return Err(XcelError::configuration(format!(
                    "{}: register {name} at {found:#x} in handoff, {} layout v{} expects {:#x}",
                    module.instance(),
                    self.profile,
                    self.version,
                    entry.offset
                )));
            }
            if entry.width == Width::W64 {
                let high_name = name.replace("_1", "_2");
                if let Some(high) = module.register_offset(&high_name) {
                    if high != entry.offset + 4 {
                        return Err(XcelError::configuration(format!(
                            "{}: register {high_name} at {high:#x}, expected {:#x}",
                            module.instance(),
                            entry.offset + 4
                        )));
                    }
                }
            }
        }
        debug!(
            "{}: {} layout v{} matches handoff",
            module.instance(),
            self.profile,
            self.version
        );
        Ok(())
    }
}

/// Immutable operand-name to offset map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    layout: RegisterLayout,
}

impl RegisterMap {
    /// Map over the built-in layout of `profile`.
    pub const fn new(profile: Profile) -> Self {
        Self {
            layout: RegisterLayout::for_profile(profile),
        }
    }

    /// Map for `profile`, validated against a handoff module.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Configuration`] on any layout mismatch.
    pub fn from_handoff(profile: Profile, module: &IpModule) -> Result<Self> {
        let map = Self::new(profile);
        map.layout.validate(module)?;
        Ok(map)
    }

    /// Underlying layout.
    pub const fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    /// Profile of the layout.
    pub const fn profile(&self) -> Profile {
        self.layout.profile
    }

    /// Entry for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::UnknownRegister`] if the layout has no such operand.
    pub fn spec(&self, name: &str) -> Result<RegisterSpec> {
        Operand::from_name(name)
            .and_then(|op| self.layout.profile.register(op))
            .ok_or_else(|| XcelError::UnknownRegister {
                name: name.to_string(),
                profile: self.layout.profile,
            })
    }

    /// Byte offset of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::UnknownRegister`] if the layout has no such operand.
    pub fn offset_of(&self, name: &str) -> Result<usize> {
        self.spec(name).map(|spec| spec.offset)
    }

    /// Write `value` to `name`. 64-bit registers take the low word first.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::UnknownRegister`] for unknown names,
    /// [`XcelError::InvalidValue`] for values wider than a 32-bit register or
    /// writes to a read-only register or to the status bits of `control`, and
    /// propagates access failures.
    pub fn write(&self, io: &mut dyn RegisterIo, name: &str, value: u64) -> Result<()> {
        let spec = self.spec(name)?;
        if spec.access == Access::ReadOnly {
            return Err(XcelError::invalid_value(format!(
                "register {name} is read-only"
            )));
        }
        if spec.operand == Operand::Control && value & !u64::from(ctrl::HOST_WRITABLE) != 0 {
            return Err(XcelError::invalid_value(format!(
                "control word {value:#x} sets status bits ({})",
                ctrl::describe(u32::try_from(value).unwrap_or(u32::MAX))
            )));
        }
        trace!("{}: {name} @ {:#x} <- {value:#x}", io.name(), spec.offset);
        match spec.width {
            Width::W32 => {
                let word = u32::try_from(value).map_err(|_| {
                    XcelError::invalid_value(format!(
                        "{value:#x} does not fit 32-bit register {name}"
                    ))
                })?;
                io.write32(spec.offset, word)
            }
            Width::W64 => {
                // Truncation intended: the value is split into two words.
                #[allow(clippy::cast_possible_truncation)]
                let (low, high) = (value as u32, (value >> 32) as u32);
                io.write32(spec.offset, low)?;
                io.write32(spec.offset + 4, high)
            }
        }
    }

    /// Read `name`. 64-bit registers read the low word first.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::UnknownRegister`] for unknown names and propagates
    /// access failures.
    pub fn read(&self, io: &mut dyn RegisterIo, name: &str) -> Result<u64> {
        let spec = self.spec(name)?;
        let value = match spec.width {
            Width::W32 => u64::from(io.read32(spec.offset)?),
            Width::W64 => {
                let low = io.read32(spec.offset)?;
                let high = io.read32(spec.offset + 4)?;
                u64::from(low) | (u64::from(high) << 32)
            }
        };
        trace!("{}: {name} @ {:#x} = {value:#x}", io.name(), spec.offset);
        Ok(value)
    }
}
