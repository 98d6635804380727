//! Hardware handoff (`.hwh`) reader
//!
//! Vivado writes a hardware handoff next to every bitstream. It is the only
//! authoritative description of a build: which IP instances exist, where their
//! control windows sit in the physical address map, and the byte offset of each
//! register in those windows.
//!
//! Only the subset needed by the driver is extracted:
//!
//! ```text
//! <EDKSYSTEM ...>
//!   <MODULE INSTANCE="vvadd_0" MODTYPE="vvadd" VLNV="xilinx.com:hls:vvadd:1.0">
//!     <REGISTER NAME="a_1">
//!       <PROPERTY NAME="ADDRESS_OFFSET" VALUE="16"/>
//!       <FIELDS> ... </FIELDS>           (field properties are ignored)
//!     </REGISTER>
//!   </MODULE>
//!   <MEMRANGE INSTANCE="vvadd_0" BASEVALUE="0x43C00000" HIGHVALUE="0x43C0FFFF" .../>
//! </EDKSYSTEM>
//! ```

use crate::error::{Result, XcelError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extension of the companion handoff.
pub const HANDOFF_EXTENSION: &str = "hwh";

/// Conventional handoff path for an image: same directory, same stem, `.hwh`.
pub fn companion_path(image: &Path) -> PathBuf {
    image.with_extension(HANDOFF_EXTENSION)
}

/// Physical address window of an instance's slave interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    /// First byte.
    pub base: u64,
    /// Last byte (inclusive).
    pub high: u64,
}

impl AddressWindow {
    /// Window size in bytes, saturating at `u64::MAX` for a full 64-bit range.
    pub const fn size(&self) -> u64 {
        self.high.saturating_sub(self.base).saturating_add(1)
    }
}

/// One IP instance in the block design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpModule {
    instance: String,
    modtype: Option<String>,
    vlnv: Option<String>,
    registers: BTreeMap<String, usize>,
    window: Option<AddressWindow>,
}

impl IpModule {
    fn from_tag(tag: &Tag<'_>) -> Option<Self> {
        tag.attr("INSTANCE").map(|instance| Self {
            instance: instance.to_string(),
            modtype: tag.attr("MODTYPE").map(str::to_string),
            vlnv: tag.attr("VLNV").map(str::to_string),
            registers: BTreeMap::new(),
            window: None,
        })
    }

    /// Block-design instance name (`vvadd_0`).
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// IP type (`vvadd`), when recorded.
    pub fn modtype(&self) -> Option<&str> {
        self.modtype.as_deref()
    }

    /// Vendor:library:name:version identifier.
    pub fn vlnv(&self) -> Option<&str> {
        self.vlnv.as_deref()
    }

    /// Byte offset of a register by handoff name.
    pub fn register_offset(&self, name: &str) -> Option<usize> {
        self.registers.get(name).copied()
    }

    /// All registers, by name.
    pub const fn registers(&self) -> &BTreeMap<String, usize> {
        &self.registers
    }

    /// Control window in the physical address map, when mapped.
    pub const fn window(&self) -> Option<AddressWindow> {
        self.window
    }
}

/// Parsed hardware handoff.
#[derive(Debug, Clone)]
pub struct HardwareHandoff {
    path: Option<PathBuf>,
    modules: Vec<IpModule>,
}

impl HardwareHandoff {
    /// Read and parse a handoff file.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::MissingArtifact`] if the file does not exist and
    /// [`XcelError::Configuration`] if it cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(XcelError::missing_artifact("hardware handoff", path));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            XcelError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut handoff = Self::parse(&text)?;
        handoff.path = Some(path.to_path_buf());
        debug!(
            "Loaded handoff {}: {} modules",
            path.display(),
            handoff.modules.len()
        );
        Ok(handoff)
    }

    /// Parse handoff XML text.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Configuration`] if the text is not a handoff or a
    /// register offset / address value is malformed.
    pub fn parse(text: &str) -> Result<Self> {
        let mut saw_root = false;
        let mut stack: Vec<Option<IpModule>> = Vec::new();
        let mut modules: Vec<IpModule> = Vec::new();
        let mut windows: BTreeMap<String, AddressWindow> = BTreeMap::new();
        let mut register: Option<(String, Option<usize>)> = None;
        let mut field_depth = 0usize;

        for tag in Tags::new(text) {
            match (tag.kind, tag.name) {
                (TagKind::Open | TagKind::SelfClosing, "EDKSYSTEM") => saw_root = true,
                (TagKind::Open, "MODULE") => {
                    // Keep the stack balanced even for modules without an instance name.
                    stack.push(IpModule::from_tag(&tag));
                }
                (TagKind::SelfClosing, "MODULE") => modules.extend(IpModule::from_tag(&tag)),
                (TagKind::Close, "MODULE") => {
                    if let Some(Some(module)) = stack.pop() {
                        modules.push(module);
                    }
                }
                (TagKind::Open, "REGISTER") => {
                    register = tag.attr("NAME").map(|n| (n.to_string(), None));
                    field_depth = 0;
                }
                (TagKind::Close, "REGISTER") => {
                    if let (Some((name, Some(offset))), Some(module)) =
                        (register.take(), stack.last_mut().and_then(Option::as_mut))
                    {
                        module.registers.insert(name, offset);
                    }
                }
                (TagKind::Open, "FIELD") => field_depth += 1,
                (TagKind::Close, "FIELD") => field_depth = field_depth.saturating_sub(1),
                (_, "PROPERTY") if field_depth == 0 => {
                    if let Some((name, offset @ None)) = register.as_mut() {
                        if tag.attr("NAME") == Some("ADDRESS_OFFSET") {
                            let value = tag.attr("VALUE").unwrap_or_default();
                            let parsed = parse_number(value).ok_or_else(|| {
                                XcelError::configuration(format!(
                                    "register {name}: bad ADDRESS_OFFSET '{value}'"
                                ))
                            })?;
                            *offset = Some(usize::try_from(parsed).map_err(|_| {
                                XcelError::configuration(format!(
                                    "register {name}: offset {parsed:#x} out of range"
                                ))
                            })?);
                        }
                    }
                }
                (TagKind::Open | TagKind::SelfClosing, "MEMRANGE") => {
                    let Some(instance) = tag.attr("INSTANCE") else {
                        continue;
                    };
                    let base = tag.attr("BASEVALUE").and_then(parse_number);
                    let high = tag.attr("HIGHVALUE").and_then(parse_number);
                    match (base, high) {
                        (Some(base), Some(high)) if high >= base && high - base < u64::MAX => {
                            windows
                                .entry(instance.to_string())
                                .or_insert(AddressWindow { base, high });
                        }
                        _ => {
                            return Err(XcelError::configuration(format!(
                                "MEMRANGE for {instance} has a malformed address range"
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        if !saw_root {
            return Err(XcelError::configuration(
                "not a hardware handoff (missing <EDKSYSTEM> root)",
            ));
        }

        modules.extend(stack.into_iter().flatten());
        for module in &mut modules {
            module.window = windows.get(&module.instance).copied();
        }

        Ok(Self {
            path: None,
            modules,
        })
    }

    /// File this handoff was loaded from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All IP instances.
    pub fn modules(&self) -> &[IpModule] {
        &self.modules
    }

    /// Look up an instance by name.
    pub fn module(&self, instance: &str) -> Option<&IpModule> {
        self.modules.iter().find(|m| m.instance == instance)
    }
}

/// Parse `16`, `0x10` or `0X10`.
fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
}

#[derive(Debug)]
struct Tag<'a> {
    kind: TagKind,
    name: &'a str,
    attrs: &'a str,
}

impl<'a> Tag<'a> {
    fn attr(&self, key: &str) -> Option<&'a str> {
        Attrs { rest: self.attrs }.find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Iterator over `key="value"` pairs of one tag.
struct Attrs<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Attrs<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest.trim_start();
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let body = &after[1..];
        let end = body.find(quote)?;
        self.rest = &body[end + 1..];
        Some((key, &body[..end]))
    }
}

/// Iterator over element tags, skipping comments, declarations and text.
struct Tags<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Tags<'a> {
    const fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Index of the `>` closing the tag that starts at `from`, honouring quotes.
    fn tag_end(&self, from: usize) -> Option<usize> {
        let mut quote: Option<u8> = None;
        for (i, &b) in self.text.as_bytes()[from..].iter().enumerate() {
            match (quote, b) {
                (None, b'"' | b'\'') => quote = Some(b),
                (Some(q), _) if q == b => quote = None,
                (None, b'>') => return Some(from + i),
                _ => {}
            }
        }
        None
    }
}

impl<'a> Iterator for Tags<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Tag<'a>> {
        loop {
            let start = self.pos + self.text[self.pos..].find('<')?;
            let rest = &self.text[start..];

            if rest.starts_with("<!--") {
                let end = rest.find("-->")?;
                self.pos = start + end + 3;
                continue;
            }

            let end = self.tag_end(start)?;
            self.pos = end + 1;
            let body = &self.text[start + 1..end];

            if body.starts_with('?') || body.starts_with('!') {
                continue;
            }

            if let Some(name) = body.strip_prefix('/') {
                return Some(Tag {
                    kind: TagKind::Close,
                    name: name.trim(),
                    attrs: "",
                });
            }

            let (body, kind) = match body.strip_suffix('/') {
                Some(inner) => (inner, TagKind::SelfClosing),
                None => (body, TagKind::Open),
            };
            let split = body
                .find(|c: char| c.is_ascii_whitespace())
                .unwrap_or(body.len());
            return Some(Tag {
                kind,
                name: &body[..split],
                attrs: &body[split..],
            });
        }
    }
}
