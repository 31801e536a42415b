//! Output writers for decoded slot data.

use crate::slot::SlotRecord;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Column header written by [`SlotCsvWriter::write_header`].
pub const CSV_HEADER: &str = "event,crate,slot,channel,hit,value";

/// CSV writer emitting one row per decoded datum:
/// `event,crate,slot,channel,hit,value`.
pub struct SlotCsvWriter<W: Write> {
    writer: BufWriter<W>,
    rows: u64,
}

impl SlotCsvWriter<File> {
    /// Creates a writer for a new file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, OutputError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> SlotCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            rows: 0,
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "{}", CSV_HEADER)?;
        Ok(())
    }

    /// Writes the data of every record for event number `event`.
    pub fn write_event<'a, I>(&mut self, event: u64, records: I) -> Result<(), OutputError>
    where
        I: IntoIterator<Item = &'a SlotRecord>,
    {
        for record in records {
            self.write_record(event, record)?;
        }
        Ok(())
    }

    #[inline]
    fn write_record(&mut self, event: u64, record: &SlotRecord) -> Result<(), OutputError> {
        for (channel, hits) in record.data().iter() {
            for (hit, value) in hits.iter().enumerate() {
                writeln!(
                    self.writer,
                    "{},{},{},{},{},{}",
                    event,
                    record.crate_num(),
                    record.slot(),
                    channel,
                    hit,
                    value
                )?;
                self.rows += 1;
            }
        }
        Ok(())
    }

    /// Number of data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}
