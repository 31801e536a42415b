//! Process-wide pool of small integer identities for live engines.
//!
//! The global registry lives for the whole process and starts empty. Each
//! [`crate::DecodeEngine`] holds an [`InstanceHandle`] that returns its
//! identity to the pool when dropped.

use parking_lot::{const_mutex, Mutex};
use thiserror::Error;

/// Maximum number of simultaneously live identities.
pub const MAX_INSTANCES: usize = 256;

const WORDS: usize = MAX_INSTANCES / 64;

static GLOBAL: InstanceRegistry = InstanceRegistry::new();

/// Errors raised by the instance registry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("All {0} instance identities are in use")]
    Exhausted(usize),
}

/// Bit-indexed identity pool guarded by a mutex.
#[derive(Debug)]
pub struct InstanceRegistry {
    bits: Mutex<[u64; WORDS]>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub const fn new() -> Self {
        Self {
            bits: const_mutex([0; WORDS]),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static InstanceRegistry {
        &GLOBAL
    }

    /// Takes the lowest free identity.
    pub fn acquire(&self) -> Result<InstanceHandle<'_>, RegistryError> {
        let mut bits = self.bits.lock();
        for (w, word) in bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                *word |= 1 << bit;
                return Ok(InstanceHandle {
                    registry: self,
                    id: w * 64 + bit,
                });
            }
        }
        Err(RegistryError::Exhausted(MAX_INSTANCES))
    }

    // Only called from InstanceHandle::drop.
    fn release(&self, id: usize) {
        if id >= MAX_INSTANCES {
            return;
        }
        let mut bits = self.bits.lock();
        bits[id / 64] &= !(1 << (id % 64));
    }

    /// Returns true if `id` is currently held.
    pub fn is_live(&self, id: usize) -> bool {
        id < MAX_INSTANCES && self.bits.lock()[id / 64] & (1 << (id % 64)) != 0
    }

    /// Number of identities currently held.
    pub fn live_count(&self) -> usize {
        self.bits
            .lock()
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}

/// A held identity; released when dropped.
///
/// Dropping the handle is the only way to return an identity:
///
/// ```compile_fail
/// evdata_core::InstanceRegistry::global().release(0);
/// ```
#[derive(Debug)]
pub struct InstanceHandle<'a> {
    registry: &'a InstanceRegistry,
    id: usize,
}

impl InstanceHandle<'_> {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for InstanceHandle<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
