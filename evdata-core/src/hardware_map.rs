//! Hardware map: which (crate, slot) cells hold which modules.
//!
//! The engine only talks to maps through the [`HardwareMap`] and
//! [`MapResolver`] traits. [`CrateMap`] is the in-memory snapshot used by the
//! bundled resolvers: [`StaticMapResolver`] for maps built in code and
//! [`TomlMapResolver`] for map files on disk.
//!
//! # Map file format
//!
//! A map named `cratemap` is read from `<dir>/cratemap.toml`. Each
//! `[[period]]` applies from its `valid_from` run timestamp onwards; the
//! latest period not after the requested timestamp wins.
//!
//! ```toml
//! [[period]]
//! valid_from = 0
//!
//! [[period.slot]]
//! crate = 3
//! slot = 5
//! module = "ADC"
//! channels = 4
//! data_per_channel = 1
//! clear = true
//! ```

use crate::types::{
    ChannelCapacity, ModuleTypeId, SlotAddress, GRID_SIZE, MAX_CHANNELS, MAX_SLOT_WORDS,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while resolving or building a hardware map.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("Cannot read map file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid map file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unknown hardware map: {0}")]
    UnknownMap(String),

    #[error("Hardware map {name} has no period valid at run time {run_time}")]
    NoValidPeriod { name: String, run_time: u64 },

    #[error("Map entry for crate {crate_num} slot {slot} is outside the address grid")]
    OutOfRange { crate_num: usize, slot: usize },

    #[error("Duplicate map entry for {0}")]
    Duplicate(SlotAddress),

    #[error("Map entry for {addr} has invalid capacity: {n_channels} channels x {n_data} data words (limits {} channels, {} words)", MAX_CHANNELS, MAX_SLOT_WORDS)]
    InvalidCapacity {
        addr: SlotAddress,
        n_channels: usize,
        n_data: usize,
    },
}

/// Checks that `entry` can be backed by preallocated channel storage.
pub fn validate_entry(addr: SlotAddress, entry: &MapEntry) -> Result<(), MapError> {
    if entry.capacity.is_valid() {
        Ok(())
    } else {
        Err(MapError::InvalidCapacity {
            addr,
            n_channels: entry.capacity.n_channels,
            n_data: entry.capacity.n_data,
        })
    }
}

/// Configuration of one used (crate, slot) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub module_type: ModuleTypeId,
    pub capacity: ChannelCapacity,
    pub clear_on_event: bool,
}

impl MapEntry {
    pub fn new(module_type: impl Into<String>, n_channels: usize, n_data: usize) -> Self {
        Self {
            module_type: ModuleTypeId::new(module_type),
            capacity: ChannelCapacity::new(n_channels, n_data),
            clear_on_event: true,
        }
    }

    /// Sets the clear-on-event policy.
    pub fn clear_on_event(mut self, clear: bool) -> Self {
        self.clear_on_event = clear;
        self
    }
}

/// Query interface of a resolved hardware map snapshot.
///
/// Queries for cells the map does not mark used return neutral values
/// (`false`, `None`, zero capacity).
pub trait HardwareMap: Send {
    /// Identifier the map was resolved from.
    fn name(&self) -> &str;

    fn is_used(&self, addr: SlotAddress) -> bool;

    fn module_type(&self, addr: SlotAddress) -> Option<&ModuleTypeId>;

    fn channel_capacity(&self, addr: SlotAddress) -> ChannelCapacity;

    fn clear_on_event(&self, addr: SlotAddress) -> bool;

    /// Demotes a cell to unused.
    fn set_unused(&mut self, addr: SlotAddress);

    /// Full configuration of a used cell.
    fn entry(&self, addr: SlotAddress) -> Option<MapEntry> {
        if !self.is_used(addr) {
            return None;
        }
        Some(MapEntry {
            module_type: self.module_type(addr)?.clone(),
            capacity: self.channel_capacity(addr),
            clear_on_event: self.clear_on_event(addr),
        })
    }

    /// Every used address, in linear-index order.
    fn used_slots(&self) -> Vec<SlotAddress> {
        SlotAddress::all().filter(|&a| self.is_used(a)).collect()
    }
}

/// Resolves a map identifier and run timestamp to a map snapshot.
///
/// May block on file or network access; it is only called from
/// `DecodeEngine::init`.
pub trait MapResolver: Send {
    fn resolve(&self, name: &str, run_time: u64) -> Result<Box<dyn HardwareMap>, MapError>;
}

/// In-memory hardware map snapshot.
#[derive(Debug, Clone)]
pub struct CrateMap {
    name: String,
    entries: Vec<Option<MapEntry>>,
}

impl CrateMap {
    /// Creates an empty map (no cell used).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: vec![None; GRID_SIZE],
        }
    }

    /// Marks (crate, slot) used with the given configuration, replacing any
    /// previous entry. Capacities beyond the storage limits are rejected.
    pub fn insert(&mut self, crate_num: usize, slot: usize, entry: MapEntry) -> Result<(), MapError> {
        let addr =
            SlotAddress::new(crate_num, slot).ok_or(MapError::OutOfRange { crate_num, slot })?;
        validate_entry(addr, &entry)?;
        self.entries[addr.index()] = Some(entry);
        Ok(())
    }

    /// Builder form of [`CrateMap::insert`].
    pub fn with_slot(mut self, crate_num: usize, slot: usize, entry: MapEntry) -> Result<Self, MapError> {
        self.insert(crate_num, slot, entry)?;
        Ok(self)
    }

    /// Number of used cells.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn get(&self, addr: SlotAddress) -> Option<&MapEntry> {
        self.entries[addr.index()].as_ref()
    }
}

impl HardwareMap for CrateMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_used(&self, addr: SlotAddress) -> bool {
        self.get(addr).is_some()
    }

    fn module_type(&self, addr: SlotAddress) -> Option<&ModuleTypeId> {
        self.get(addr).map(|e| &e.module_type)
    }

    fn channel_capacity(&self, addr: SlotAddress) -> ChannelCapacity {
        self.get(addr).map(|e| e.capacity).unwrap_or_default()
    }

    fn clear_on_event(&self, addr: SlotAddress) -> bool {
        self.get(addr).is_some_and(|e| e.clear_on_event)
    }

    fn set_unused(&mut self, addr: SlotAddress) {
        self.entries[addr.index()] = None;
    }

    fn entry(&self, addr: SlotAddress) -> Option<MapEntry> {
        self.get(addr).cloned()
    }
}

/// Resolver over maps registered in code, each with time-dependent periods.
///
/// Every resolution hands out a fresh copy, so engines never share a live
/// map.
#[derive(Debug, Clone, Default)]
pub struct StaticMapResolver {
    maps: HashMap<String, Vec<(u64, CrateMap)>>,
}

impl StaticMapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `map` under its own name, valid from `valid_from` onwards.
    pub fn insert(&mut self, valid_from: u64, map: CrateMap) {
        let periods = self.maps.entry(map.name.clone()).or_default();
        periods.retain(|(t, _)| *t != valid_from);
        periods.push((valid_from, map));
        periods.sort_by_key(|(t, _)| *t);
    }

    /// Builder form of [`StaticMapResolver::insert`].
    pub fn with_map(mut self, valid_from: u64, map: CrateMap) -> Self {
        self.insert(valid_from, map);
        self
    }
}

impl MapResolver for StaticMapResolver {
    fn resolve(&self, name: &str, run_time: u64) -> Result<Box<dyn HardwareMap>, MapError> {
        let periods = self
            .maps
            .get(name)
            .ok_or_else(|| MapError::UnknownMap(name.to_string()))?;
        let (_, map) = periods
            .iter()
            .rev()
            .find(|(t, _)| *t <= run_time)
            .ok_or_else(|| MapError::NoValidPeriod {
                name: name.to_string(),
                run_time,
            })?;
        Ok(Box::new(map.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct MapFile {
    #[serde(default)]
    period: Vec<PeriodDef>,
}

#[derive(Debug, Deserialize)]
struct PeriodDef {
    #[serde(default)]
    valid_from: u64,
    #[serde(default)]
    slot: Vec<SlotDef>,
}

#[derive(Debug, Deserialize)]
struct SlotDef {
    #[serde(rename = "crate")]
    crate_num: usize,
    slot: usize,
    module: String,
    channels: usize,
    #[serde(default = "default_data_per_channel")]
    data_per_channel: usize,
    #[serde(default = "default_clear")]
    clear: bool,
}

fn default_data_per_channel() -> usize {
    1
}

fn default_clear() -> bool {
    true
}

/// Resolver reading `<dir>/<name>.toml` map files.
#[derive(Debug, Clone)]
pub struct TomlMapResolver {
    dir: PathBuf,
}

impl TomlMapResolver {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the file backing map `name`.
    pub fn map_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", name))
    }
}

impl MapResolver for TomlMapResolver {
    fn resolve(&self, name: &str, run_time: u64) -> Result<Box<dyn HardwareMap>, MapError> {
        let path = self.map_path(name);
        let text = fs::read_to_string(&path).map_err(|source| MapError::Io {
            path: path.clone(),
            source,
        })?;
        let map = parse_map_file(name, &path, &text, run_time)?;
        Ok(Box::new(map))
    }
}

/// Parses the text of a map file and selects the period valid at `run_time`.
pub fn parse_map_str(name: &str, text: &str, run_time: u64) -> Result<CrateMap, MapError> {
    parse_map_file(name, Path::new(name), text, run_time)
}

fn parse_map_file(name: &str, path: &Path, text: &str, run_time: u64) -> Result<CrateMap, MapError> {
    let file: MapFile = toml::from_str(text).map_err(|source| MapError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let period = file
        .period
        .iter()
        .filter(|p| p.valid_from <= run_time)
        .max_by_key(|p| p.valid_from)
        .ok_or_else(|| MapError::NoValidPeriod {
            name: name.to_string(),
            run_time,
        })?;

    let mut map = CrateMap::new(name);
    for def in &period.slot {
        let addr = SlotAddress::new(def.crate_num, def.slot).ok_or(MapError::OutOfRange {
            crate_num: def.crate_num,
            slot: def.slot,
        })?;
        if map.is_used(addr) {
            return Err(MapError::Duplicate(addr));
        }
        let entry = MapEntry::new(def.module.as_str(), def.channels, def.data_per_channel)
            .clear_on_event(def.clear);
        map.insert(def.crate_num, def.slot, entry)?;
    }
    Ok(map)
}
