//! Hex/ASCII dumps for troubleshooting malformed input.

use std::io::{self, Write};

const BYTES_PER_ROW: usize = 16;

/// Writes a dump of `bytes`, 16 per row: decimal offset, hex bytes (the
/// last row zero-padded), then printable ASCII with `.` for anything else.
///
/// ```text
/// 0000  41 42 00 ...  AB.
/// ```
pub fn dump_buffer<W: Write>(bytes: &[u8], out: &mut W) -> io::Result<()> {
    for (row, chunk) in bytes.chunks(BYTES_PER_ROW).enumerate() {
        write!(out, "{:04} ", row * BYTES_PER_ROW)?;
        for i in 0..BYTES_PER_ROW {
            write!(out, " {:02x}", chunk.get(i).copied().unwrap_or(0))?;
        }
        write!(out, "  ")?;
        for &b in chunk {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(out, "{}", c)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Dumps 32-bit words as their little-endian bytes.
pub fn dump_words<W: Write>(words: &[u32], out: &mut W) -> io::Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    dump_buffer(&bytes, out)
}

/// Returns the dump of `words` as a string.
pub fn dump_words_to_string(words: &[u32]) -> String {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = dump_words(words, &mut out);
    String::from_utf8_lossy(&out).into_owned()
}
