//! Per-slot decode state.

use crate::hardware_map::MapEntry;
use crate::module::{ChannelData, ModuleDecoder, ModuleError, ModuleFactory};
use crate::types::{ChannelCapacity, ModuleTypeId, SlotAddress};
use std::fmt;

/// Decoded state of one active (crate, slot).
///
/// Owns the module decoder attached at activation and the channel data of
/// the current event only.
pub struct SlotRecord {
    address: SlotAddress,
    module_type: ModuleTypeId,
    decoder: Option<Box<dyn ModuleDecoder>>,
    data: ChannelData,
    // Segments decoded since the last clear
    n_segments: usize,
    // Segments decoded during the current event only
    event_segments: usize,
}

impl SlotRecord {
    /// Creates a record configured from a map entry, asking `factory` for a
    /// decoder of the entry's module type.
    pub fn new(address: SlotAddress, entry: &MapEntry, factory: &dyn ModuleFactory) -> Self {
        Self {
            address,
            module_type: entry.module_type.clone(),
            decoder: factory.create(&entry.module_type),
            data: ChannelData::new(entry.capacity),
            n_segments: 0,
            event_segments: 0,
        }
    }

    #[inline]
    pub fn address(&self) -> SlotAddress {
        self.address
    }

    #[inline]
    pub fn crate_num(&self) -> usize {
        self.address.crate_num()
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.address.slot()
    }

    /// Module type name from the hardware map.
    pub fn dev_type(&self) -> &ModuleTypeId {
        &self.module_type
    }

    pub fn capacity(&self) -> ChannelCapacity {
        self.data.capacity()
    }

    /// Returns true if a decoder could be created for the module type.
    pub fn has_module(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn module(&self) -> Option<&dyn ModuleDecoder> {
        self.decoder.as_deref()
    }

    /// Channel data of the current event.
    pub fn data(&self) -> &ChannelData {
        &self.data
    }

    /// Data of one channel in the current event.
    pub fn channel(&self, channel: usize) -> &[u32] {
        self.data.channel(channel)
    }

    /// Number of segments decoded into this record since the last clear.
    pub fn num_segments(&self) -> usize {
        self.n_segments
    }

    /// Number of segments decoded into this record during the current
    /// event. Unlike [`SlotRecord::num_segments`] this restarts at every
    /// event, also for records that keep their data across events.
    pub fn event_segments(&self) -> usize {
        self.event_segments
    }

    pub(crate) fn begin_event(&mut self) {
        self.event_segments = 0;
    }

    /// Returns true if the record was created from an equivalent map entry,
    /// i.e. it can be kept across a map re-resolution.
    pub(crate) fn matches(&self, entry: &MapEntry) -> bool {
        self.module_type == entry.module_type && self.data.capacity() == entry.capacity
    }

    /// Empties the event data and resets decoder state.
    pub fn clear(&mut self) {
        self.data.clear();
        self.n_segments = 0;
        self.event_segments = 0;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.clear();
        }
    }

    /// Decodes one segment payload. On failure, whatever the segment had
    /// already written is rolled back.
    ///
    /// Records without a decoder ignore the payload and return `Ok(0)`.
    pub fn decode(&mut self, payload: &[u32]) -> Result<usize, ModuleError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(0);
        };
        self.data.checkpoint();
        match decoder.decode(payload, &mut self.data) {
            Ok(n) => {
                self.n_segments += 1;
                self.event_segments += 1;
                Ok(n)
            }
            Err(e) => {
                self.data.rollback();
                Err(e)
            }
        }
    }
}

impl fmt::Debug for SlotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRecord")
            .field("address", &self.address)
            .field("module_type", &self.module_type)
            .field("has_module", &self.has_module())
            .field("data", &self.data)
            .finish()
    }
}

impl fmt::Display for SlotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cap = self.capacity();
        writeln!(
            f,
            "{} module {} ({} channels x {} data){}",
            self.address,
            self.module_type,
            cap.n_channels,
            cap.n_data,
            if self.has_module() { "" } else { " [no decoder]" }
        )?;
        for (ch, hits) in self.data.iter() {
            write!(f, "  ch {:3}:", ch)?;
            for value in hits {
                write!(f, " {:#x}", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
