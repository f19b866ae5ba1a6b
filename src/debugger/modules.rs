//! Loaded-module bookkeeping.
//!
//! Breakpoints are persisted as (module, offset) pairs so they survive
//! relocation; the table maps loader events into base-range lookups and
//! classifies modules as user or system code for the break-on-load policy.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};

/// Whether a module belongs to the debuggee or to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleParty {
    User,
    System,
}

impl ModuleParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ModuleParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    base: u64,
    size: u64,
    name: String,
    path: String,
    party: ModuleParty,
}

impl Module {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// File name without directory, lower-cased.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn party(&self) -> ModuleParty {
        self.party
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.size
    }
}

/// FNV-1a over the lower-cased module name; stable across sessions, so it
/// can key persisted breakpoint locations.
pub fn module_hash(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte.to_ascii_lowercase());
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

/// A session-independent breakpoint location: module hash plus offset, or
/// the absolute address when no module contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub module: u64,
    pub offset: u64,
}

impl Location {
    pub fn absolute(address: u64) -> Self {
        Self {
            module: 0,
            offset: address,
        }
    }
}

/// Table of loaded modules keyed by base address.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: BTreeMap<u64, Module>,
    /// Path prefixes that mark a module as system code.
    system_prefixes: Vec<String>,
}

impl ModuleTable {
    pub fn new(system_prefixes: Vec<String>) -> Self {
        Self {
            modules: BTreeMap::new(),
            system_prefixes,
        }
    }

    fn classify(&self, path: &str) -> ModuleParty {
        let lowered = path.to_ascii_lowercase();
        if self
            .system_prefixes
            .iter()
            .any(|prefix| lowered.starts_with(&prefix.to_ascii_lowercase()))
        {
            ModuleParty::System
        } else {
            ModuleParty::User
        }
    }

    /// Record a loaded module and return a copy of the entry.
    pub fn load(&mut self, base: u64, size: u64, path: &str) -> Module {
        let name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path)
            .to_ascii_lowercase();
        let module = Module {
            base,
            size,
            name,
            path: path.to_string(),
            party: self.classify(path),
        };
        debug!(
            "module {} loaded at {:#x} ({} bytes, {})",
            module.name, base, size, module.party
        );
        if self.modules.insert(base, module.clone()).is_some() {
            warn!("module reloaded at occupied base {base:#x}");
        }
        module
    }

    /// Drop the module at `base`, returning the entry if it was tracked.
    pub fn unload(&mut self, base: u64) -> Option<Module> {
        let module = self.modules.remove(&base);
        match &module {
            Some(module) => debug!("module {} unloaded from {:#x}", module.name(), base),
            None => warn!("unload event for untracked base {base:#x}"),
        }
        module
    }

    /// Module containing `address`, if any.
    pub fn find(&self, address: u64) -> Option<&Module> {
        self.modules
            .range(..=address)
            .next_back()
            .map(|(_, module)| module)
            .filter(|module| module.contains(address))
    }

    pub fn find_by_base(&self, base: u64) -> Option<&Module> {
        self.modules.get(&base)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Module> {
        let lowered = name.to_ascii_lowercase();
        self.modules.values().find(|module| module.name == lowered)
    }

    /// Translate an absolute address into a persistable location.
    pub fn location_of(&self, address: u64) -> Location {
        match self.find(address) {
            Some(module) => Location {
                module: module_hash(module.name()),
                offset: address - module.base(),
            },
            None => Location::absolute(address),
        }
    }

    /// Translate a persisted location back into an absolute address, if the
    /// owning module is currently loaded.
    pub fn resolve(&self, location: Location) -> Option<u64> {
        if location.module == 0 {
            return Some(location.offset);
        }
        self.modules
            .values()
            .find(|module| module_hash(module.name()) == location.module)
            .map(|module| module.base() + location.offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ModuleTable {
        let mut table = ModuleTable::new(vec!["/usr/lib".into(), "C:\\Windows".into()]);
        table.load(0x400000, 0x10000, "/home/user/app");
        table.load(0x7ff0_0000, 0x20000, "/usr/lib/libc.so");
        table
    }

    #[test]
    fn test_party_classification() {
        let table = table();
        assert_eq!(
            table.find_by_base(0x400000).unwrap().party(),
            ModuleParty::User
        );
        assert_eq!(
            table.find_by_base(0x7ff0_0000).unwrap().party(),
            ModuleParty::System
        );
    }

    #[test]
    fn test_find_by_address_range() {
        let table = table();
        assert_eq!(table.find(0x400000).unwrap().name(), "app");
        assert_eq!(table.find(0x40ffff).unwrap().name(), "app");
        assert!(table.find(0x410000).is_none());
        assert!(table.find(0x3fffff).is_none());
    }

    #[test]
    fn test_location_round_trip() {
        let table = table();
        let loc = table.location_of(0x401000);
        assert_eq!(loc.module, module_hash("app"));
        assert_eq!(loc.offset, 0x1000);
        assert_eq!(table.resolve(loc), Some(0x401000));
    }

    #[test]
    fn test_location_outside_any_module_is_absolute() {
        let table = table();
        let loc = table.location_of(0xdead_0000);
        assert_eq!(loc, Location::absolute(0xdead_0000));
        assert_eq!(table.resolve(loc), Some(0xdead_0000));
    }

    #[test]
    fn test_resolve_after_relocation() {
        let mut table = table();
        let loc = table.location_of(0x401000);
        table.unload(0x400000);
        assert_eq!(table.resolve(loc), None);
        table.load(0x500000, 0x10000, "/home/user/app");
        assert_eq!(table.resolve(loc), Some(0x501000));
    }

    #[test]
    fn test_module_hash_case_insensitive() {
        assert_eq!(module_hash("Kernel32.DLL"), module_hash("kernel32.dll"));
        assert_ne!(module_hash("a"), module_hash("b"));
    }
}
