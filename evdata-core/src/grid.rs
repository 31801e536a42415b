//! Fixed-size (crate x slot) arena of slot records.
//!
//! Every access goes through [`AddressGrid::address`], the single bounds
//! check between raw-data coordinates and the arena. Two compact index lists
//! keep per-event work proportional to the number of active slots:
//!
//! - `active`: linear indices of records the current map marks used
//! - `clear`: the subset of `active` reset before every event
//!
//! Records whose address drops out of the map are removed from both lists
//! but stay allocated until [`AddressGrid::reset`] or
//! [`AddressGrid::reclaim_unused`] drops them.

use crate::hardware_map::{HardwareMap, MapEntry};
use crate::module::ModuleFactory;
use crate::slot::SlotRecord;
use crate::types::{SlotAddress, GRID_SIZE, MAX_CRATES, MAX_SLOTS};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by grid lookups.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridError {
    #[error("Crate {crate_num} slot {slot} is outside the {}x{} address grid", MAX_CRATES, MAX_SLOTS)]
    OutOfRange { crate_num: usize, slot: usize },

    #[error("No slot record for {0}")]
    NotFound(SlotAddress),

    #[error("Capacity of {0} exceeds the per-slot storage limits")]
    InvalidCapacity(SlotAddress),
}

/// Arena of optional slot records indexed by hardware address.
pub struct AddressGrid {
    cells: Vec<Option<SlotRecord>>,
    active: Vec<usize>,
    clear: Vec<usize>,
}

impl Default for AddressGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressGrid {
    pub fn new() -> Self {
        Self {
            cells: (0..GRID_SIZE).map(|_| None).collect(),
            active: Vec::new(),
            clear: Vec::new(),
        }
    }

    /// Validates raw (crate, slot) coordinates.
    #[inline]
    pub fn address(crate_num: usize, slot: usize) -> Result<SlotAddress, GridError> {
        SlotAddress::new(crate_num, slot).ok_or(GridError::OutOfRange { crate_num, slot })
    }

    /// Looks up the record at (crate, slot).
    #[inline]
    pub fn find(&self, crate_num: usize, slot: usize) -> Result<&SlotRecord, GridError> {
        let addr = Self::address(crate_num, slot)?;
        self.get(addr).ok_or(GridError::NotFound(addr))
    }

    /// Mutable form of [`AddressGrid::find`].
    #[inline]
    pub fn find_mut(&mut self, crate_num: usize, slot: usize) -> Result<&mut SlotRecord, GridError> {
        let addr = Self::address(crate_num, slot)?;
        self.get_mut(addr).ok_or(GridError::NotFound(addr))
    }

    #[inline]
    pub fn get(&self, addr: SlotAddress) -> Option<&SlotRecord> {
        self.cells[addr.index()].as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, addr: SlotAddress) -> Option<&mut SlotRecord> {
        self.cells[addr.index()].as_mut()
    }

    /// Creates the record for (crate, slot) from `entry`, dropping any record
    /// already there, and appends it to the index lists.
    ///
    /// Entries whose capacity fails [`ChannelCapacity::is_valid`] are
    /// rejected before anything is allocated.
    ///
    /// [`ChannelCapacity::is_valid`]: crate::types::ChannelCapacity::is_valid
    pub fn activate(
        &mut self,
        crate_num: usize,
        slot: usize,
        entry: &MapEntry,
        factory: &dyn ModuleFactory,
    ) -> Result<&mut SlotRecord, GridError> {
        let addr = Self::address(crate_num, slot)?;
        if !entry.capacity.is_valid() {
            return Err(GridError::InvalidCapacity(addr));
        }
        let idx = addr.index();

        if self.cells[idx].take().is_some() {
            self.active.retain(|&i| i != idx);
            self.clear.retain(|&i| i != idx);
        }

        self.active.push(idx);
        if entry.clear_on_event {
            self.clear.push(idx);
        }
        debug!(%addr, module = %entry.module_type, "activating slot");

        Ok(self.cells[idx].insert(SlotRecord::new(addr, entry, factory)))
    }

    /// Recomputes both index lists against the map's current flags.
    ///
    /// Order is preserved. Only entries already in `active` are considered,
    /// so the cost is bounded by the active set, not the grid.
    pub fn rebuild_indices(&mut self, map: &dyn HardwareMap) {
        let cells = &self.cells;
        self.active.retain(|&idx| {
            cells[idx].is_some()
                && SlotAddress::from_index(idx).is_some_and(|addr| map.is_used(addr))
        });
        self.clear.clear();
        self.clear.extend(
            self.active
                .iter()
                .copied()
                .filter(|&idx| SlotAddress::from_index(idx).is_some_and(|a| map.clear_on_event(a))),
        );
    }

    /// Brings occupancy in line with `map`.
    ///
    /// Every used address gets a record; records built from an equivalent
    /// entry are kept as they are. Returns the number of records created.
    pub fn sync(&mut self, map: &dyn HardwareMap, factory: &dyn ModuleFactory) -> usize {
        let mut created = 0;
        for addr in map.used_slots() {
            let Some(entry) = map.entry(addr) else {
                continue;
            };
            let idx = addr.index();
            let keep = self.cells[idx].as_ref().is_some_and(|rec| rec.matches(&entry));
            if keep {
                if !self.active.contains(&idx) {
                    self.active.push(idx);
                }
            } else if self
                .activate(addr.crate_num(), addr.slot(), &entry, factory)
                .is_ok()
            {
                created += 1;
            }
        }
        self.rebuild_indices(map);
        created
    }

    /// Demotes every used address that has no decoder to unused in `map`.
    ///
    /// Returns the demoted addresses.
    pub fn mark_unused_if_no_module(&self, map: &mut dyn HardwareMap) -> Vec<SlotAddress> {
        let mut demoted = Vec::new();
        for addr in map.used_slots() {
            if self.get(addr).is_some_and(SlotRecord::has_module) {
                continue;
            }
            warn!(
                %addr,
                module = %map.module_type(addr).map(|m| m.as_str()).unwrap_or("?"),
                "no module decoder defined, slot will be ignored"
            );
            map.set_unused(addr);
            demoted.push(addr);
        }
        demoted
    }

    /// Clears every record in the clear list.
    #[inline]
    pub fn clear_slots(&mut self) {
        for &idx in &self.clear {
            if let Some(rec) = self.cells[idx].as_mut() {
                rec.clear();
            }
        }
    }

    /// Drops every record the map no longer marks used. Returns the number
    /// of records dropped.
    pub fn reclaim_unused(&mut self, map: &dyn HardwareMap) -> usize {
        let mut dropped = 0;
        for addr in SlotAddress::all() {
            let cell = &mut self.cells[addr.index()];
            if cell.is_some() && !map.is_used(addr) {
                *cell = None;
                dropped += 1;
            }
        }
        self.rebuild_indices(map);
        dropped
    }

    /// Drops every record and empties both lists.
    pub fn reset(&mut self) {
        self.cells.iter_mut().for_each(|cell| *cell = None);
        self.active.clear();
        self.clear.clear();
    }

    /// Linear indices of active records, in activation order.
    pub fn active_indices(&self) -> &[usize] {
        &self.active
    }

    /// Linear indices of records cleared before each event.
    pub fn clear_indices(&self) -> &[usize] {
        &self.clear
    }

    /// Active records in activation order.
    pub fn active_records(&self) -> impl Iterator<Item = &SlotRecord> + '_ {
        self.active.iter().filter_map(|&idx| self.cells[idx].as_ref())
    }

    /// Number of allocated records, including stale ones.
    pub fn occupied(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }
}
