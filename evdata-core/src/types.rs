//! Core types for crate/slot addressed event data.
//!
//! This module defines the hardware address space, module type identifiers
//! and the per-event result types shared by the rest of the crate.

use std::fmt;

/// Number of crates (readout controllers) in the hardware address space.
pub const MAX_CRATES: usize = 32;

/// Number of slots per crate.
pub const MAX_SLOTS: usize = 27;

/// Total number of addressable (crate, slot) cells.
pub const GRID_SIZE: usize = MAX_CRATES * MAX_SLOTS;

/// Upper bound on the number of channels of one module.
pub const MAX_CHANNELS: usize = 4096;

/// Upper bound on the data words one slot can hold per event
/// (`n_channels * n_data`).
pub const MAX_SLOT_WORDS: usize = 1 << 20;

/// A validated (crate, slot) hardware address.
///
/// Construction through [`SlotAddress::new`] guarantees both coordinates lie
/// inside `[0, MAX_CRATES) x [0, MAX_SLOTS)`, so the linear index derived
/// from it is always a valid grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotAddress {
    crate_num: u16,
    slot: u16,
}

impl SlotAddress {
    /// Creates an address, returning `None` if it lies outside the grid.
    #[inline]
    pub fn new(crate_num: usize, slot: usize) -> Option<Self> {
        if crate_num < MAX_CRATES && slot < MAX_SLOTS {
            Some(Self {
                crate_num: crate_num as u16,
                slot: slot as u16,
            })
        } else {
            None
        }
    }

    /// Recovers an address from a linear grid index.
    #[inline]
    pub fn from_index(index: usize) -> Option<Self> {
        if index < GRID_SIZE {
            Self::new(index / MAX_SLOTS, index % MAX_SLOTS)
        } else {
            None
        }
    }

    /// Crate number.
    #[inline]
    pub fn crate_num(&self) -> usize {
        self.crate_num as usize
    }

    /// Slot number within the crate.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    /// Linear index `slot + MAX_SLOTS * crate`.
    #[inline]
    pub fn index(&self) -> usize {
        self.slot as usize + MAX_SLOTS * self.crate_num as usize
    }

    /// Iterates over every address of the grid in linear-index order.
    pub fn all() -> impl Iterator<Item = SlotAddress> {
        (0..GRID_SIZE).filter_map(Self::from_index)
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crate {} slot {}", self.crate_num, self.slot)
    }
}

/// Identifier of a module (digitizer) type, e.g. `"ADC"` or `"TDC"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ModuleTypeId(String);

impl ModuleTypeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleTypeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Channel layout of one module: number of channels and the maximum number
/// of data words each channel can hold per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCapacity {
    pub n_channels: usize,
    pub n_data: usize,
}

impl ChannelCapacity {
    #[inline]
    pub fn new(n_channels: usize, n_data: usize) -> Self {
        Self { n_channels, n_data }
    }

    /// Total data words per event, or `None` on overflow.
    #[inline]
    pub fn total_words(&self) -> Option<usize> {
        self.n_channels.checked_mul(self.n_data)
    }

    /// Returns true if storage for this layout can be reserved up front.
    pub fn is_valid(&self) -> bool {
        self.n_channels <= MAX_CHANNELS
            && self.n_data <= MAX_SLOT_WORDS
            && self.total_words().is_some_and(|w| w <= MAX_SLOT_WORDS)
    }
}

/// Outcome of decoding one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Every segment was either decoded or intentionally skipped.
    Complete,
    /// At least one segment was malformed and discarded.
    Partial,
}

/// Per-event accounting returned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSummary {
    pub status: EventStatus,
    /// Segments forwarded to a module decoder successfully
    pub segments_decoded: usize,
    /// Segments addressed to in-grid slots that are not in the hardware map
    pub segments_skipped: usize,
    /// Malformed segments (bad address, bad length, decoder failure)
    pub segments_discarded: usize,
}

impl EventSummary {
    pub(crate) fn new() -> Self {
        Self {
            status: EventStatus::Complete,
            segments_decoded: 0,
            segments_skipped: 0,
            segments_discarded: 0,
        }
    }

    pub(crate) fn discard(&mut self) {
        self.segments_discarded += 1;
        self.status = EventStatus::Partial;
    }

    /// Returns true if no data was lost in this event.
    pub fn is_complete(&self) -> bool {
        self.status == EventStatus::Complete
    }
}

/// Running counters kept by an engine across events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeStats {
    pub events: u64,
    pub partial_events: u64,
    pub segments_decoded: u64,
    pub segments_skipped: u64,
    pub segments_discarded: u64,
    /// Mapped slots demoted to unused because no decoder exists for them
    pub config_warnings: u64,
}

impl DecodeStats {
    pub(crate) fn record(&mut self, summary: &EventSummary) {
        self.events += 1;
        if !summary.is_complete() {
            self.partial_events += 1;
        }
        self.segments_decoded += summary.segments_decoded as u64;
        self.segments_skipped += summary.segments_skipped as u64;
        self.segments_discarded += summary.segments_discarded as u64;
    }
}
