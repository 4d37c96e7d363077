//! Framed encode/decode of log entries (§4.1).
//!
//! Each record, on disk and on the wire, is a 24-byte header followed by
//! `data_len` bytes of payload:
//!
//! ```text
//! bytes 0..8   big-endian u64, top 4 bits = entry type, low 60 bits = data_len
//! bytes 8..16  big-endian u64, entry index
//! bytes 16..24 big-endian u64, entry term
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size in bytes of the fixed entry header.
pub const HEADER_LEN: usize = 24;

const TYPE_SHIFT: u32 = 60;
const LEN_MASK: u64 = (1u64 << TYPE_SHIFT) - 1;

/// The kind of a log entry.
///
/// `Command` and `Nop` carry application/protocol payloads; `Config` carries
/// a serialized [`crate::membership::Config`]. A fourth value is reserved for
/// a future snapshot-pointer entry and is rejected by [`decode`] until that
/// feature exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    Command = 0,
    Nop = 1,
    Config = 2,
}

impl EntryType {
    fn from_nibble(n: u64) -> Result<Self> {
        match n {
            0 => Ok(EntryType::Command),
            1 => Ok(EntryType::Nop),
            2 => Ok(EntryType::Config),
            _ => Err(Error::Truncated),
        }
    }
}

/// The unit of replication (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub entry_type: EntryType,
    pub index: u64,
    pub term: u64,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(entry_type: EntryType, index: u64, term: u64, data: impl Into<Bytes>) -> Self {
        Self {
            entry_type,
            index,
            term,
            data: data.into(),
        }
    }

    /// Number of bytes this entry occupies once encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }
}

/// Encode `entry` into `out`, appending the header and payload.
pub fn encode(entry: &LogEntry, out: &mut BytesMut) {
    let type_bits = (entry.entry_type as u64) << TYPE_SHIFT;
    let len_bits = entry.data.len() as u64 & LEN_MASK;
    out.reserve(entry.encoded_len());
    out.put_u64(type_bits | len_bits);
    out.put_u64(entry.index);
    out.put_u64(entry.term);
    out.put_slice(&entry.data);
}

/// Parse just the `data_len` field out of a standalone 24-byte header, for
/// callers streaming a header and its payload separately (e.g. `read_from`
/// reading off a socket rather than a fully-buffered `Bytes`).
pub fn peek_data_len(header: &[u8]) -> Result<usize> {
    if header.len() < 8 {
        return Err(Error::Truncated);
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&header[0..8]);
    let type_and_len = u64::from_be_bytes(raw);
    Ok((type_and_len & LEN_MASK) as usize)
}

/// Decode a single entry from the front of `buf`, advancing `buf` past the
/// consumed bytes. Fails with `Truncated` on a short read, or `Oversize` if
/// `data_len` exceeds `max_entry_size`.
pub fn decode(buf: &mut Bytes, max_entry_size: usize) -> Result<LogEntry> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }
    let type_and_len = buf.get_u64();
    let index = buf.get_u64();
    let term = buf.get_u64();

    let entry_type = EntryType::from_nibble(type_and_len >> TYPE_SHIFT)?;
    let data_len = (type_and_len & LEN_MASK) as usize;

    if data_len > max_entry_size {
        return Err(Error::Oversize);
    }
    if buf.len() < data_len {
        return Err(Error::Truncated);
    }
    let data = buf.split_to(data_len);
    Ok(LogEntry {
        entry_type,
        index,
        term,
        data,
    })
}
