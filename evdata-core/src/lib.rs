//! Crate/slot event decoder for data-acquisition buffers.
//!
//! Front-end electronics deliver each event as a buffer of 32-bit words split
//! into segments, each tagged with the (crate, slot) address of the module
//! that produced it. This crate routes every segment to the decoder of the
//! module the hardware map places at that address, and keeps the decoded
//! per-channel data available until the next event.
//!
//! # Example
//!
//! ```no_run
//! use evdata_core::{CrateMap, DecodeEngine, MapEntry, StaticMapResolver};
//! use evdata_core::parser::push_segment;
//!
//! let map = CrateMap::new("cratemap")
//!     .with_slot(3, 5, MapEntry::new("ADC", 4, 1))
//!     .unwrap();
//! let mut engine =
//!     DecodeEngine::with_standard_modules(StaticMapResolver::new().with_map(0, map)).unwrap();
//! engine.set_map_name("cratemap");
//! engine.init().unwrap();
//!
//! let mut event = Vec::new();
//! push_segment(&mut event, 3, 5, &[10, 20, 30, 40]);
//! engine.decode_event(&event).unwrap();
//!
//! println!("{}", engine.print_slot_data(3, 5).unwrap());
//! ```
//!
//! # Features
//!
//! - O(1) bounds-checked lookup over the fixed crate x slot address space
//! - Compact active/clear index lists so per-event work scales with the
//!   number of mapped modules
//! - Time-dependent hardware maps loaded from TOML files
//! - Process-wide instance identities for engines running on several threads
//! - Optional stage timing and hex dumps for diagnostics

pub mod bench;
pub mod config;
pub mod dump;
pub mod engine;
pub mod grid;
pub mod hardware_map;
pub mod module;
pub mod output;
pub mod parser;
pub mod registry;
pub mod slot;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use engine::{default_map_name, set_default_map_name, DecodeEngine, DecodeError};
pub use grid::{AddressGrid, GridError};
pub use hardware_map::{
    CrateMap, HardwareMap, MapEntry, MapError, MapResolver, StaticMapResolver, TomlMapResolver,
};
pub use module::{ChannelData, ModuleDecoder, ModuleError, ModuleFactory, StandardModules};
pub use output::{OutputError, SlotCsvWriter};
pub use registry::{InstanceRegistry, RegistryError};
pub use slot::SlotRecord;
pub use types::{
    ChannelCapacity, DecodeStats, EventStatus, EventSummary, ModuleTypeId, SlotAddress,
    MAX_CHANNELS, MAX_CRATES, MAX_SLOTS, MAX_SLOT_WORDS,
};
