//! Module decoders and per-slot channel storage.
//!
//! A [`ModuleDecoder`] turns the payload words of one segment into channel
//! data. Decoders are created once per slot through a [`ModuleFactory`] and
//! reused for every event.

use crate::types::{ChannelCapacity, ModuleTypeId};
use thiserror::Error;

/// Errors raised by module decoders while filling channel data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Channel {channel} out of range (module has {n_channels} channels)")]
    ChannelOutOfRange { channel: usize, n_channels: usize },

    #[error("Channel {channel} exceeds its capacity of {capacity} data words")]
    DataOverflow { channel: usize, capacity: usize },

    #[error("Payload of {len} words exceeds module capacity of {max} words")]
    PayloadTooLong { len: usize, max: usize },
}

/// Decoded data of one slot for the current event.
///
/// Storage is reserved once from the slot's capacity; filling and clearing
/// never reallocate.
#[derive(Debug, Clone)]
pub struct ChannelData {
    capacity: ChannelCapacity,
    channels: Vec<Vec<u32>>,
    checkpoint: Vec<usize>,
    total: usize,
}

impl ChannelData {
    pub fn new(capacity: ChannelCapacity) -> Self {
        Self {
            capacity,
            channels: (0..capacity.n_channels)
                .map(|_| Vec::with_capacity(capacity.n_data))
                .collect(),
            checkpoint: vec![0; capacity.n_channels],
            total: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> ChannelCapacity {
        self.capacity
    }

    /// Appends one datum to `channel`.
    #[inline]
    pub fn push(&mut self, channel: usize, value: u32) -> Result<(), ModuleError> {
        let n_channels = self.capacity.n_channels;
        let hits = self
            .channels
            .get_mut(channel)
            .ok_or(ModuleError::ChannelOutOfRange {
                channel,
                n_channels,
            })?;
        if hits.len() >= self.capacity.n_data {
            return Err(ModuleError::DataOverflow {
                channel,
                capacity: self.capacity.n_data,
            });
        }
        hits.push(value);
        self.total += 1;
        Ok(())
    }

    /// Data of one channel; empty for channels out of range.
    #[inline]
    pub fn channel(&self, channel: usize) -> &[u32] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of data words recorded for `channel`.
    #[inline]
    pub fn num_hits(&self, channel: usize) -> usize {
        self.channel(channel).len()
    }

    /// Total number of data words over all channels.
    #[inline]
    pub fn len(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Channels that received data, with their values, in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u32])> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, hits)| !hits.is_empty())
            .map(|(ch, hits)| (ch, hits.as_slice()))
    }

    /// All values flattened in channel order.
    pub fn values(&self) -> Vec<u32> {
        self.channels.iter().flatten().copied().collect()
    }

    /// Empties every channel, keeping the reserved storage.
    pub fn clear(&mut self) {
        for hits in &mut self.channels {
            hits.clear();
        }
        self.total = 0;
    }

    /// Remembers the current fill level so a failed segment can be undone.
    pub(crate) fn checkpoint(&mut self) {
        for (mark, hits) in self.checkpoint.iter_mut().zip(&self.channels) {
            *mark = hits.len();
        }
    }

    /// Drops everything added since the last [`ChannelData::checkpoint`].
    pub(crate) fn rollback(&mut self) {
        let mut total = 0;
        for (hits, &mark) in self.channels.iter_mut().zip(&self.checkpoint) {
            hits.truncate(mark);
            total += hits.len();
        }
        self.total = total;
    }
}

/// Decodes the payload of one segment into a slot's channel data.
pub trait ModuleDecoder: Send {
    /// Module type this decoder handles.
    fn module_type(&self) -> &ModuleTypeId;

    /// Decodes `payload`, appending to `data`. Returns the number of words
    /// consumed.
    fn decode(&mut self, payload: &[u32], data: &mut ChannelData) -> Result<usize, ModuleError>;

    /// Resets any decoder state carried between segments of one event.
    fn clear(&mut self) {}
}

/// Creates module decoders by type. Returns `None` for unknown types.
pub trait ModuleFactory: Send {
    fn create(&self, module_type: &ModuleTypeId) -> Option<Box<dyn ModuleDecoder>>;
}

impl<F> ModuleFactory for F
where
    F: Fn(&ModuleTypeId) -> Option<Box<dyn ModuleDecoder>> + Send,
{
    fn create(&self, module_type: &ModuleTypeId) -> Option<Box<dyn ModuleDecoder>> {
        self(module_type)
    }
}

/// One datum per word, filling channels in order: word `i` belongs to
/// channel `i / n_data`.
#[derive(Debug, Clone)]
pub struct SequentialDecoder {
    module_type: ModuleTypeId,
}

impl SequentialDecoder {
    pub fn new(module_type: ModuleTypeId) -> Self {
        Self { module_type }
    }
}

impl ModuleDecoder for SequentialDecoder {
    fn module_type(&self) -> &ModuleTypeId {
        &self.module_type
    }

    fn decode(&mut self, payload: &[u32], data: &mut ChannelData) -> Result<usize, ModuleError> {
        let cap = data.capacity();
        let max = cap.total_words().unwrap_or(usize::MAX);
        if payload.len() > max {
            return Err(ModuleError::PayloadTooLong {
                len: payload.len(),
                max,
            });
        }
        for (i, &word) in payload.iter().enumerate() {
            data.push(i / cap.n_data, word)?;
        }
        Ok(payload.len())
    }
}

// ============================================================================
// Tagged data word
// Bits: [31:24] channel | [23:0] value
// ============================================================================

/// Extracts the channel number from a tagged data word.
#[inline]
pub fn tagged_get_channel(word: u32) -> usize {
    ((word >> 24) & 0xFF) as usize
}

/// Extracts the 24-bit value from a tagged data word.
#[inline]
pub fn tagged_get_value(word: u32) -> u32 {
    word & 0x00FF_FFFF
}

/// Multi-hit decoder where every word carries its own channel number.
#[derive(Debug, Clone)]
pub struct TaggedDecoder {
    module_type: ModuleTypeId,
}

impl TaggedDecoder {
    pub fn new(module_type: ModuleTypeId) -> Self {
        Self { module_type }
    }
}

impl ModuleDecoder for TaggedDecoder {
    fn module_type(&self) -> &ModuleTypeId {
        &self.module_type
    }

    fn decode(&mut self, payload: &[u32], data: &mut ChannelData) -> Result<usize, ModuleError> {
        for &word in payload {
            data.push(tagged_get_channel(word), tagged_get_value(word))?;
        }
        Ok(payload.len())
    }
}

/// Factory for the bundled module types.
///
/// | type                    | decoder               |
/// |-------------------------|-----------------------|
/// | `ADC`, `Scaler`, `Raw`  | [`SequentialDecoder`] |
/// | `TDC`                   | [`TaggedDecoder`]     |
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardModules;

impl ModuleFactory for StandardModules {
    fn create(&self, module_type: &ModuleTypeId) -> Option<Box<dyn ModuleDecoder>> {
        match module_type.as_str() {
            "ADC" | "Scaler" | "Raw" => Some(Box::new(SequentialDecoder::new(module_type.clone()))),
            "TDC" => Some(Box::new(TaggedDecoder::new(module_type.clone()))),
            _ => None,
        }
    }
}
