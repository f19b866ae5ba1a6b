use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::debugger::eval::{LazyCondition, LogSink};
use crate::debugger::modules::Location;
use crate::engine::{HwAccess, MemAccess, HW_SLOT_COUNT};
use crate::error::{DebugError, Result};

/// Breakpoint kind classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BpKind {
    /// Byte-patch breakpoint at an instruction
    Software,
    /// Debug-register breakpoint
    Hardware,
    /// Page-protection breakpoint over a range
    Memory,
    /// Fires when a module with a matching name is loaded
    DllLoad,
    /// Fires when a module with a matching name is unloaded
    DllUnload,
    /// Fires when an exception with a matching code is raised
    Exception,
}

impl BpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Software => "software",
            Self::Hardware => "hardware",
            Self::Memory => "memory",
            Self::DllLoad => "dll load",
            Self::DllUnload => "dll unload",
            Self::Exception => "exception",
        }
    }

    /// Kinds armed at a code/data address, as opposed to the symbolic kinds
    /// keyed by module name or exception code.
    pub fn is_addressed(&self) -> bool {
        matches!(self, Self::Software | Self::Hardware | Self::Memory)
    }
}

impl fmt::Display for BpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific breakpoint payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BpPayload {
    Software {
        /// Byte captured when the patch was applied; kept for the lifetime
        /// of the arming so removal restores the exact pre-patch byte.
        original: Option<u8>,
    },
    Hardware {
        /// Debug-register slot while armed.
        slot: Option<u8>,
        access: HwAccess,
        size: u8,
    },
    Memory {
        size: u64,
        access: MemAccess,
    },
    DllLoad {
        name: String,
    },
    DllUnload {
        name: String,
    },
    Exception {
        code: u32,
    },
}

impl BpPayload {
    pub fn kind(&self) -> BpKind {
        match self {
            Self::Software { .. } => BpKind::Software,
            Self::Hardware { .. } => BpKind::Hardware,
            Self::Memory { .. } => BpKind::Memory,
            Self::DllLoad { .. } => BpKind::DllLoad,
            Self::DllUnload { .. } => BpKind::DllUnload,
            Self::Exception { .. } => BpKind::Exception,
        }
    }
}

/// Identity of a breakpoint: kind plus session-independent location.
///
/// Addressed kinds use (module hash, offset); symbolic kinds hash the module
/// name or exception code into the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BpKey {
    pub kind: BpKind,
    pub location: Location,
}

/// A breakpoint record: the common envelope around a kind payload.
#[derive(Clone)]
pub struct Breakpoint {
    key: BpKey,
    /// Currently resolved absolute address; 0 for symbolic kinds.
    address: u64,
    /// Owning module name, empty when the address is module-less.
    module: String,
    payload: BpPayload,
    enabled: bool,
    /// Deactivate and delete after the first break.
    singleshot: bool,
    /// Currently armed in the debuggee.
    active: bool,
    /// Suppress the default hit description.
    silent: bool,
    /// When the break condition is false, skip logging and commands too.
    fast_resume: bool,
    name: String,
    /// Shared so copies taken during hit evaluation observe increments.
    hits: Arc<AtomicU64>,
    break_condition: LazyCondition,
    log_condition: LazyCondition,
    command_condition: LazyCondition,
    log_text: String,
    command_text: String,
    /// Per-breakpoint log destination override.
    log_sink: Option<Arc<dyn LogSink>>,
}

impl Breakpoint {
    pub fn new(key: BpKey, address: u64, module: impl Into<String>, payload: BpPayload) -> Self {
        debug_assert_eq!(key.kind, payload.kind());
        Self {
            key,
            address,
            module: module.into(),
            payload,
            enabled: true,
            singleshot: false,
            active: false,
            silent: false,
            fast_resume: false,
            name: String::new(),
            hits: Arc::new(AtomicU64::new(0)),
            break_condition: LazyCondition::default(),
            log_condition: LazyCondition::default(),
            command_condition: LazyCondition::default(),
            log_text: String::new(),
            command_text: String::new(),
            log_sink: None,
        }
    }

    pub fn key(&self) -> BpKey {
        self.key
    }

    pub fn kind(&self) -> BpKind {
        self.key.kind
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn payload(&self) -> &BpPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut BpPayload {
        &mut self.payload
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_singleshot(&self) -> bool {
        self.singleshot
    }

    pub fn set_singleshot(&mut self, singleshot: bool) {
        self.singleshot = singleshot;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn is_fast_resume(&self) -> bool {
        self.fast_resume
    }

    pub fn set_fast_resume(&mut self, fast_resume: bool) {
        self.fast_resume = fast_resume;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Record one hit and return the new count.
    pub fn hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn reset_hit_count(&self) {
        self.hits.store(0, Ordering::SeqCst);
    }

    pub fn break_condition(&self) -> &LazyCondition {
        &self.break_condition
    }

    /// Replace the break condition text; the compiled handle is rebuilt on
    /// the next hit.
    pub fn set_break_condition(&mut self, text: impl Into<String>) {
        self.break_condition = LazyCondition::new(text);
    }

    pub fn log_condition(&self) -> &LazyCondition {
        &self.log_condition
    }

    pub fn set_log_condition(&mut self, text: impl Into<String>) {
        self.log_condition = LazyCondition::new(text);
    }

    pub fn command_condition(&self) -> &LazyCondition {
        &self.command_condition
    }

    pub fn set_command_condition(&mut self, text: impl Into<String>) {
        self.command_condition = LazyCondition::new(text);
    }

    pub fn log_text(&self) -> &str {
        &self.log_text
    }

    pub fn set_log_text(&mut self, text: impl Into<String>) {
        self.log_text = text.into();
    }

    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    pub fn set_command_text(&mut self, text: impl Into<String>) {
        self.command_text = text.into();
    }

    pub fn log_sink(&self) -> Option<&Arc<dyn LogSink>> {
        self.log_sink.as_ref()
    }

    pub fn set_log_sink(&mut self, sink: Option<Arc<dyn LogSink>>) {
        self.log_sink = sink;
    }

    /// Kind-specific one-line description printed on a non-silent break.
    pub fn describe(&self) -> String {
        let label = if self.name.is_empty() {
            String::new()
        } else {
            format!(" {:?}", self.name)
        };
        match &self.payload {
            BpPayload::Software { .. } => {
                format!("software breakpoint{} at {:#x}", label, self.address)
            }
            BpPayload::Hardware { slot, access, size } => match slot {
                Some(slot) => format!(
                    "hardware breakpoint{} at {:#x} (slot {}, {}, {} byte(s))",
                    label,
                    self.address,
                    slot,
                    access.as_str(),
                    size
                ),
                None => format!(
                    "hardware breakpoint{} at {:#x} ({}, {} byte(s))",
                    label,
                    self.address,
                    access.as_str(),
                    size
                ),
            },
            BpPayload::Memory { size, access } => format!(
                "memory breakpoint{} at {:#x} ({} bytes, {})",
                label,
                self.address,
                size,
                access.as_str()
            ),
            BpPayload::DllLoad { name } => format!("dll load breakpoint{label} on {name:?}"),
            BpPayload::DllUnload { name } => {
                format!("dll unload breakpoint{label} on {name:?}")
            }
            BpPayload::Exception { code } => {
                format!("exception breakpoint{label} on code {code:#x}")
            }
        }
    }
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("key", &self.key)
            .field("address", &format_args!("{:#x}", self.address))
            .field("module", &self.module)
            .field("payload", &self.payload)
            .field("enabled", &self.enabled)
            .field("singleshot", &self.singleshot)
            .field("active", &self.active)
            .field("hits", &self.hit_count())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.enabled { "enabled" } else { "disabled" };
        write!(f, "{} ({})", self.describe(), status)?;
        let hits = self.hit_count();
        if hits > 0 {
            write!(f, ", hit {hits} time(s)")?;
        }
        if !self.break_condition.is_empty() {
            write!(f, ", condition: {}", self.break_condition.text())?;
        }
        Ok(())
    }
}

/// All breakpoints of the session, keyed by identity.
///
/// The table holds no engine state: arming and disarming go through the
/// session, which updates `active` and the payload here.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: BTreeMap<BpKey, Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Fails if an enabled record with the same key is
    /// already present; a disabled leftover is replaced.
    pub fn add(&mut self, breakpoint: Breakpoint) -> Result<()> {
        if let Some(existing) = self.entries.get(&breakpoint.key()) {
            if existing.is_enabled() {
                return Err(DebugError::BreakpointExists);
            }
        }
        self.entries.insert(breakpoint.key(), breakpoint);
        Ok(())
    }

    pub fn get(&self, key: &BpKey) -> Option<&Breakpoint> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &BpKey) -> Option<&mut Breakpoint> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &BpKey) -> Option<Breakpoint> {
        self.entries.remove(key)
    }

    /// Find the enabled record of `kind` resolved at `address`. A disabled
    /// leftover does not explain a trap and is never returned.
    pub fn find_at(&self, kind: BpKind, address: u64) -> Option<&Breakpoint> {
        self.entries
            .values()
            .find(|bp| bp.is_enabled() && bp.kind() == kind && bp.address() == address)
    }

    /// Copies of every record matching `filter`.
    pub fn enum_all(&self, filter: impl Fn(&Breakpoint) -> bool) -> Vec<Breakpoint> {
        self.entries.values().filter(|bp| filter(bp)).cloned().collect()
    }

    /// Copies of every record owned by `module`.
    pub fn enum_module(&self, module: &str) -> Vec<Breakpoint> {
        self.enum_all(|bp| bp.module() == module)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Breakpoint> {
        self.entries.values_mut()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The four hardware debug-register slots.
///
/// Serialized independently of the breakpoint table; a slot must be released
/// before it can be handed out again.
#[derive(Debug, Default)]
pub struct HwSlots {
    slots: [Option<BpKey>; HW_SLOT_COUNT],
}

impl HwSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free slot for `key`.
    pub fn allocate(&mut self, key: BpKey) -> Result<u8> {
        if self.slot_of(&key).is_some() {
            return Err(DebugError::BreakpointExists);
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(key);
                return Ok(index as u8);
            }
        }
        Err(DebugError::NoFreeSlot)
    }

    /// Release a slot by index.
    pub fn release(&mut self, slot: u8) -> Option<BpKey> {
        self.slots.get_mut(slot as usize).and_then(Option::take)
    }

    /// Release whichever slot `key` occupies.
    pub fn release_key(&mut self, key: &BpKey) -> Option<u8> {
        let slot = self.slot_of(key)?;
        self.slots[slot as usize] = None;
        Some(slot)
    }

    pub fn slot_of(&self, key: &BpKey) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref() == Some(key))
            .map(|index| index as u8)
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
