//! Event decoding engine.
//!
//! [`DecodeEngine`] owns the hardware map, the address grid and the slot
//! records, and routes the segments of each event buffer to the decoder of
//! the addressed slot.
//!
//! The engine is either uninitialized or ready. Changing the map identifier
//! or the run timestamp makes it uninitialized again; [`DecodeEngine::init`]
//! must then succeed before the next event can be decoded.

use crate::bench::{stage, Benchmark, TimingReporter};
use crate::config::EngineConfig;
use crate::dump;
use crate::grid::{AddressGrid, GridError};
use crate::hardware_map::{validate_entry, HardwareMap, MapError, MapResolver};
use crate::module::{ModuleDecoder, ModuleFactory, StandardModules};
use crate::parser;
use crate::registry::{InstanceHandle, InstanceRegistry, RegistryError};
use crate::slot::SlotRecord;
use crate::types::{DecodeStats, EventSummary, ModuleTypeId, SlotAddress};
use parking_lot::{const_rwlock, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Map identifier used when none has been set anywhere.
pub const DEFAULT_MAP_NAME: &str = "cratemap";

// Empty until overridden by set_default_map_name.
static DEFAULT_MAP_OVERRIDE: RwLock<String> = const_rwlock(String::new());

/// Sets the process-wide default map identifier used by engines that have
/// no identifier of their own. Takes effect at their next initialization.
pub fn set_default_map_name(name: &str) -> Result<(), DecodeError> {
    if name.is_empty() {
        return Err(DecodeError::EmptyMapName);
    }
    *DEFAULT_MAP_OVERRIDE.write() = name.to_string();
    Ok(())
}

/// The process-wide default map identifier.
pub fn default_map_name() -> String {
    let name = DEFAULT_MAP_OVERRIDE.read();
    if name.is_empty() {
        DEFAULT_MAP_NAME.to_string()
    } else {
        name.clone()
    }
}

/// Errors that stop decoding until the caller intervenes.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Cannot resolve hardware map {name} for run time {run_time}: {source}")]
    MapResolution {
        name: String,
        run_time: u64,
        #[source]
        source: MapError,
    },

    #[error("Decoder is not initialized, call init() first")]
    NotInitialized,

    #[error(transparent)]
    Instances(#[from] RegistryError),

    #[error("Default hardware map name must not be empty")]
    EmptyMapName,
}

/// Crate/slot event decoder.
pub struct DecodeEngine {
    instance: InstanceHandle<'static>,
    resolver: Box<dyn MapResolver>,
    factory: Box<dyn ModuleFactory>,
    map: Option<Box<dyn HardwareMap>>,
    grid: AddressGrid,

    // Empty selects the process-wide default
    map_name: String,
    // Identifier of the map the grid was last built from
    resolved_name: Option<String>,
    run_time: u64,
    needs_init: bool,
    first_decode: bool,
    data_version: u32,

    // Diagnostics
    debug_level: u32,
    reporter: Option<Box<dyn TimingReporter>>,
    debug_sink: Option<Box<dyn Write + Send>>,
    warned: HashSet<(usize, usize)>,
    // Linear indices of records that decoded a segment in the last event
    decoded: Vec<usize>,
    stats: DecodeStats,
}

impl DecodeEngine {
    /// Creates an engine resolving maps through `resolver` and building
    /// decoders through `factory`.
    ///
    /// The run timestamp defaults to the current time.
    pub fn new(
        resolver: impl MapResolver + 'static,
        factory: impl ModuleFactory + 'static,
    ) -> Result<Self, DecodeError> {
        let instance = InstanceRegistry::global().acquire()?;
        let run_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            instance,
            resolver: Box::new(resolver),
            factory: Box::new(factory),
            map: None,
            grid: AddressGrid::new(),
            map_name: String::new(),
            resolved_name: None,
            run_time,
            needs_init: true,
            first_decode: true,
            data_version: 0,
            debug_level: 0,
            reporter: None,
            debug_sink: None,
            warned: HashSet::new(),
            decoded: Vec::new(),
            stats: DecodeStats::default(),
        })
    }

    /// Creates an engine using the bundled [`StandardModules`] decoders.
    pub fn with_standard_modules(resolver: impl MapResolver + 'static) -> Result<Self, DecodeError> {
        Self::new(resolver, StandardModules)
    }

    /// Applies every setting of `config` except `map_dir`, which only
    /// concerns how the resolver is built.
    pub fn apply_config(&mut self, config: &EngineConfig) {
        self.set_map_name(&config.map_name);
        if let Some(t) = config.run_time {
            self.set_run_time(t);
        }
        if let Some(v) = config.data_version {
            self.set_data_version(v);
        }
        self.set_debug_level(config.debug_level);
        self.enable_benchmark(config.benchmark);
    }

    /// Identity of this engine in the process-wide registry.
    pub fn instance(&self) -> usize {
        self.instance.id()
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Sets the hardware map identifier. An empty name selects the
    /// process-wide default.
    pub fn set_map_name(&mut self, name: &str) {
        let name = if name.is_empty() {
            default_map_name()
        } else {
            name.to_string()
        };
        if self.map_name != name {
            self.map_name = name;
            self.needs_init = true;
        }
    }

    /// Identifier the next initialization will resolve.
    pub fn map_name(&self) -> String {
        if self.map_name.is_empty() {
            default_map_name()
        } else {
            self.map_name.clone()
        }
    }

    /// Sets the run timestamp. The hardware configuration depends on it, so
    /// a different value requires re-initialization.
    pub fn set_run_time(&mut self, run_time: u64) {
        if self.run_time != run_time {
            self.run_time = run_time;
            self.needs_init = true;
        }
    }

    pub fn run_time(&self) -> u64 {
        self.run_time
    }

    pub fn set_data_version(&mut self, version: u32) {
        self.data_version = version;
    }

    pub fn data_version(&self) -> u32 {
        self.data_version
    }

    /// Returns true until the next successful [`DecodeEngine::init`].
    pub fn needs_init(&self) -> bool {
        self.needs_init
    }

    /// Returns true if no event has been decoded since the last
    /// initialization.
    pub fn is_first_event(&self) -> bool {
        self.first_decode
    }

    /// Resolves the hardware map and rebuilds the grid.
    ///
    /// Does nothing if the engine is already initialized for the current
    /// identifier and timestamp. A resolution failure, including a map entry
    /// whose capacity exceeds the storage limits, is fatal: the engine stays
    /// uninitialized and will not retry by itself.
    pub fn init(&mut self) -> Result<(), DecodeError> {
        if !self.needs_init && self.map.is_some() {
            return Ok(());
        }
        let start = self.reporter.is_some().then(Instant::now);
        let name = self.map_name();
        if self.debug_level > 0 {
            info!(
                instance = self.instance(),
                map = %name,
                run_time = self.run_time,
                "initializing hardware map"
            );
        }

        let mut map = self
            .resolver
            .resolve(&name, self.run_time)
            .map_err(|source| DecodeError::MapResolution {
                name: name.clone(),
                run_time: self.run_time,
                source,
            })?;

        // Custom resolvers can hand out maps that never went through
        // CrateMap::insert
        for addr in map.used_slots() {
            if let Some(entry) = map.entry(addr) {
                validate_entry(addr, &entry).map_err(|source| DecodeError::MapResolution {
                    name: name.clone(),
                    run_time: self.run_time,
                    source,
                })?;
            }
        }

        if self.resolved_name.as_deref() != Some(name.as_str()) {
            self.grid.reset();
        }
        let created = self.grid.sync(&*map, &*self.factory);
        let demoted = self.grid.mark_unused_if_no_module(&mut *map);
        self.stats.config_warnings += demoted.len() as u64;
        self.grid.rebuild_indices(&*map);

        debug!(
            instance = self.instance(),
            map = %name,
            created,
            active = self.grid.active_indices().len(),
            clearable = self.grid.clear_indices().len(),
            demoted = demoted.len(),
            "hardware map initialized"
        );

        self.map = Some(map);
        self.resolved_name = Some(name);
        self.needs_init = false;
        self.first_decode = true;
        self.warned.clear();

        if let (Some(start), Some(r)) = (start, self.reporter.as_mut()) {
            r.record(stage::INIT, start.elapsed());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-event decoding
    // ------------------------------------------------------------------

    /// Decodes one event buffer.
    ///
    /// Clearable slots are emptied first, then segments are routed in
    /// buffer order. Segments for in-grid addresses missing from the map
    /// are skipped. Malformed segments are discarded and reported through
    /// [`EventSummary::status`]; the rest of the event is still decoded.
    pub fn decode_event(&mut self, buffer: &[u32]) -> Result<EventSummary, DecodeError> {
        if self.needs_init {
            return Err(DecodeError::NotInitialized);
        }
        let Some(map) = self.map.as_deref() else {
            return Err(DecodeError::NotInitialized);
        };
        let start = self.reporter.is_some().then(Instant::now);

        self.grid.clear_slots();
        for idx in self.decoded.drain(..) {
            if let Some(rec) = SlotAddress::from_index(idx).and_then(|a| self.grid.get_mut(a)) {
                rec.begin_event();
            }
        }
        if let (Some(start), Some(r)) = (start, self.reporter.as_mut()) {
            r.record(stage::CLEAR, start.elapsed());
        }

        if self.first_decode && self.debug_level > 0 {
            debug!(instance = self.instance.id(), words = buffer.len(), "first event after init");
        }

        let mut summary = EventSummary::new();
        for segment in parser::segments(buffer) {
            let segment = match segment {
                Ok(s) => s,
                Err(e) => {
                    summary.discard();
                    if let parser::ParseError::Truncated { crate_num, slot, .. } = &e {
                        warn_once(&mut self.warned, *crate_num, *slot, &e);
                    }
                    continue;
                }
            };

            let addr = match AddressGrid::address(segment.crate_num, segment.slot) {
                Ok(a) => a,
                Err(e) => {
                    summary.discard();
                    warn_once(&mut self.warned, segment.crate_num, segment.slot, &e);
                    continue;
                }
            };

            if !map.is_used(addr) {
                summary.segments_skipped += 1;
                continue;
            }
            let Some(record) = self.grid.get_mut(addr) else {
                summary.segments_skipped += 1;
                continue;
            };

            if let Some(sink) = self.debug_sink.as_mut() {
                let written = writeln!(sink, "{} ({} words)", addr, segment.payload.len())
                    .and_then(|_| dump::dump_words(segment.payload, sink));
                if let Err(e) = written {
                    debug!(error = %e, "debug sink write failed");
                }
            }

            match record.decode(segment.payload) {
                Ok(_) => {
                    summary.segments_decoded += 1;
                    if record.event_segments() == 1 {
                        self.decoded.push(addr.index());
                    }
                }
                Err(e) => {
                    summary.discard();
                    warn_once(&mut self.warned, addr.crate_num(), addr.slot(), &e);
                }
            }
        }

        self.stats.record(&summary);
        self.first_decode = false;
        if self.debug_level > 1 {
            trace!(instance = self.instance.id(), ?summary, "event decoded");
        }
        if let (Some(start), Some(r)) = (start, self.reporter.as_mut()) {
            r.record(stage::DECODE, start.elapsed());
        }
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Per-slot queries
    // ------------------------------------------------------------------

    /// Decoded record of (crate, slot).
    ///
    /// Addresses the current map does not use report `NotFound`, even if a
    /// stale record is still allocated for them.
    pub fn slot_record(&self, crate_num: usize, slot: usize) -> Result<&SlotRecord, GridError> {
        let addr = AddressGrid::address(crate_num, slot)?;
        if !self.map.as_deref().is_some_and(|m| m.is_used(addr)) {
            return Err(GridError::NotFound(addr));
        }
        self.grid.find(crate_num, slot)
    }

    /// Module type of (crate, slot), if it holds a record.
    pub fn dev_type(&self, crate_num: usize, slot: usize) -> Option<&ModuleTypeId> {
        self.slot_record(crate_num, slot).ok().map(SlotRecord::dev_type)
    }

    /// Decoder attached to (crate, slot).
    pub fn module(&self, crate_num: usize, slot: usize) -> Option<&dyn ModuleDecoder> {
        self.slot_record(crate_num, slot).ok()?.module()
    }

    /// Human-readable contents of (crate, slot).
    pub fn print_slot_data(&self, crate_num: usize, slot: usize) -> Result<String, GridError> {
        self.slot_record(crate_num, slot).map(|r| r.to_string())
    }

    /// Active records in activation order.
    pub fn active_records(&self) -> impl Iterator<Item = &SlotRecord> + '_ {
        self.grid.active_records()
    }

    /// Active records that decoded at least one segment in the last event,
    /// in activation order.
    pub fn decoded_records(&self) -> impl Iterator<Item = &SlotRecord> + '_ {
        self.grid.active_records().filter(|r| r.event_segments() > 0)
    }

    pub fn active_indices(&self) -> &[usize] {
        self.grid.active_indices()
    }

    pub fn clear_indices(&self) -> &[usize] {
        self.grid.clear_indices()
    }

    /// The resolved hardware map, once initialized.
    pub fn hardware_map(&self) -> Option<&dyn HardwareMap> {
        self.map.as_deref()
    }

    /// Drops records whose address the current map no longer uses.
    /// Returns the number of records dropped.
    pub fn reclaim_unused_slots(&mut self) -> usize {
        match self.map.as_deref() {
            Some(map) => self.grid.reclaim_unused(map),
            None => 0,
        }
    }

    /// Number of allocated slot records, stale ones included.
    pub fn allocated_slots(&self) -> usize {
        self.grid.occupied()
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn set_debug_level(&mut self, level: u32) {
        self.debug_level = level;
    }

    /// Same as [`DecodeEngine::set_debug_level`].
    pub fn set_verbose(&mut self, level: u32) {
        self.set_debug_level(level);
    }

    pub fn debug_level(&self) -> u32 {
        self.debug_level
    }

    /// Sets a writer receiving a dump of every routed segment.
    pub fn set_debug_sink(&mut self, sink: Option<Box<dyn Write + Send>>) {
        self.debug_sink = sink;
    }

    /// Attaches or detaches the bundled [`Benchmark`] reporter. Detaching
    /// reports the accumulated statistics first.
    pub fn enable_benchmark(&mut self, enable: bool) {
        if enable {
            if self.reporter.is_none() {
                self.reporter = Some(Box::new(Benchmark::new()));
            }
        } else if let Some(mut reporter) = self.reporter.take() {
            reporter.report();
        }
    }

    /// Replaces the timing reporter. A previous reporter is reported first.
    pub fn set_timing_reporter(&mut self, reporter: Option<Box<dyn TimingReporter>>) {
        if let Some(mut old) = self.reporter.take() {
            old.report();
        }
        self.reporter = reporter;
    }

    pub fn is_benchmark_enabled(&self) -> bool {
        self.reporter.is_some()
    }

    /// Hex/ASCII dump of raw words.
    pub fn dump_buffer(&self, words: &[u32]) -> String {
        dump::dump_words_to_string(words)
    }
}

/// Logs a per-address problem once per initialization; repeats go to trace.
fn warn_once(warned: &mut HashSet<(usize, usize)>, crate_num: usize, slot: usize, err: &dyn fmt::Display) {
    if warned.insert((crate_num, slot)) {
        warn!(crate_num, slot, error = %err, "discarding malformed segment");
    } else {
        trace!(crate_num, slot, error = %err, "discarding malformed segment");
    }
}

impl fmt::Debug for DecodeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeEngine")
            .field("instance", &self.instance.id())
            .field("map_name", &self.map_name())
            .field("run_time", &self.run_time)
            .field("needs_init", &self.needs_init)
            .field("active", &self.grid.active_indices().len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        if let Some(mut reporter) = self.reporter.take() {
            reporter.report();
        }
    }
}
