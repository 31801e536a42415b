//! Low-level framing of raw 32-bit event words.
//!
//! An event buffer is a sequence of segments, each introduced by a header
//! word carrying the hardware address and the payload length:
//!
//! ```text
//! [31:24] crate | [23:16] slot | [15:0] payload length (words)
//! ```
//!
//! On disk, events are stored back to back as little-endian words, each
//! event preceded by a single word holding its length.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Upper bound on a single event's length in words. Anything larger is
/// treated as a corrupt length word rather than allocated.
pub const MAX_EVENT_WORDS: usize = 1 << 24;

/// Errors raised while framing raw words.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Segment for crate {crate_num} slot {slot} declares {declared} words but only {available} remain")]
    Truncated {
        crate_num: usize,
        slot: usize,
        declared: usize,
        available: usize,
    },

    #[error("Invalid event length: {0} words")]
    InvalidEventLength(usize),

    #[error("Unexpected end of file")]
    UnexpectedEof,
}

// ============================================================================
// Segment header word
// Bits: [31:24] crate | [23:16] slot | [15:0] length
// ============================================================================

/// Extracts the crate number from a segment header.
#[inline]
pub fn header_get_crate(word: u32) -> usize {
    ((word >> 24) & 0xFF) as usize
}

/// Extracts the slot number from a segment header.
#[inline]
pub fn header_get_slot(word: u32) -> usize {
    ((word >> 16) & 0xFF) as usize
}

/// Extracts the payload length (in words) from a segment header.
#[inline]
pub fn header_get_length(word: u32) -> usize {
    (word & 0xFFFF) as usize
}

/// Builds a segment header word. Fields wider than their bit range are
/// truncated.
#[inline]
pub fn make_header(crate_num: usize, slot: usize, length: usize) -> u32 {
    (((crate_num & 0xFF) as u32) << 24) | (((slot & 0xFF) as u32) << 16) | (length & 0xFFFF) as u32
}

/// Appends a complete segment (header + payload) to `buffer`.
pub fn push_segment(buffer: &mut Vec<u32>, crate_num: usize, slot: usize, payload: &[u32]) {
    buffer.push(make_header(crate_num, slot, payload.len()));
    buffer.extend_from_slice(payload);
}

/// One address-tagged segment of an event buffer.
///
/// The address is exactly as found in the raw data and has not been checked
/// against the grid bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub crate_num: usize,
    pub slot: usize,
    pub payload: &'a [u32],
}

/// Iterator over the segments of one event buffer, in buffer order.
///
/// A segment whose declared length runs past the end of the buffer yields a
/// single [`ParseError::Truncated`], after which the iterator is exhausted.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Segments<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<Segment<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = *self.words.get(self.pos)?;
        let crate_num = header_get_crate(header);
        let slot = header_get_slot(header);
        let declared = header_get_length(header);

        let start = self.pos + 1;
        let available = self.words.len() - start;
        if declared > available {
            self.pos = self.words.len();
            return Some(Err(ParseError::Truncated {
                crate_num,
                slot,
                declared,
                available,
            }));
        }

        self.pos = start + declared;
        Some(Ok(Segment {
            crate_num,
            slot,
            payload: &self.words[start..start + declared],
        }))
    }
}

/// Splits an event buffer into its segments.
#[inline]
pub fn segments(words: &[u32]) -> Segments<'_> {
    Segments::new(words)
}

/// Reads length-prefixed events from a little-endian word stream.
pub struct EventReader<R: Read> {
    reader: R,
}

impl<R: Read> EventReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next event into `event`, replacing its contents.
    ///
    /// Returns `Ok(false)` on a clean end of stream.
    pub fn read_event(&mut self, event: &mut Vec<u32>) -> Result<bool, ParseError> {
        let length = match self.reader.read_u32::<LittleEndian>() {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if length > MAX_EVENT_WORDS {
            return Err(ParseError::InvalidEventLength(length));
        }

        event.clear();
        event.resize(length, 0);
        match self.reader.read_u32_into::<LittleEndian>(event) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ParseError::UnexpectedEof),
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: Read> Iterator for EventReader<R> {
    type Item = Result<Vec<u32>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut event = Vec::new();
        match self.read_event(&mut event) {
            Ok(true) => Some(Ok(event)),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Reads every event of a raw file into memory.
pub fn read_event_file<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<u32>>, ParseError> {
    let file = File::open(path)?;
    EventReader::new(BufReader::new(file)).collect()
}
