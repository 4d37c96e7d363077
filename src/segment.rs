//! The durable, append-only entry log (§4.2).
//!
//! A `Segment` owns exactly one backing file (`<data-dir>/1.log`) plus an
//! in-memory mirror of its bytes and an index of per-entry offsets. Tail
//! writers register a bounded channel under the segment's lock (§9's design
//! note: an explicit broadcast primitive rather than a naked writer handle);
//! `append` fans new bytes out to every registered channel, drops any whose
//! receiver has gone away, and flags (then drops) any that can't keep up so
//! `write_to` can report that writer's stream as failed rather than merely
//! closed (§4.2).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::codec::{self, LogEntry};
use crate::error::{Error, Result};

/// The first index of any segment in this single-active-segment design.
pub const BASE_INDEX: u64 = 1;

/// Channel depth for each registered tail writer. A writer that cannot keep
/// up within this many buffered appends is dropped rather than allowed to
/// apply unbounded back-pressure to `append` (§4.2: "a failing tail writer is
/// removed and its completion signal delivers the error").
const TAIL_CHANNEL_DEPTH: usize = 256;

/// A registered tail writer: the data channel `append` fans bytes out
/// through, plus a flag `append` sets before dropping a writer that couldn't
/// keep up, so `write_to` can tell a lagging writer apart from one released
/// by a normal `seal`/`close`.
struct TailWriter {
    data_tx: mpsc::Sender<Bytes>,
    failed: Arc<AtomicBool>,
}

struct Inner {
    file: File,
    buf: BytesMut,
    /// `offsets[i]` is the byte offset of entry `BASE_INDEX + i` within `buf`.
    offsets: Vec<u64>,
    sealed: bool,
    tail_writers: Vec<TailWriter>,
}

/// A contiguous, append-only range of log entries (§3).
pub struct Segment {
    path: PathBuf,
    max_entry_size: usize,
    inner: Mutex<Inner>,
}

impl Segment {
    /// Open (creating if absent) the segment file at `path`, replaying its
    /// contents to rebuild the in-memory buffer and offsets index.
    pub async fn open(path: impl AsRef<Path>, max_entry_size: usize) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path).await?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).await?;

        let mut buf = BytesMut::with_capacity(raw.len());
        buf.extend_from_slice(&raw);

        let offsets = replay_offsets(&buf, max_entry_size)?;

        Ok(Arc::new(Self {
            path,
            max_entry_size,
            inner: Mutex::new(Inner {
                file,
                buf,
                offsets,
                sealed: false,
                tail_writers: Vec::new(),
            }),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The highest entry index durably present in this segment, or `BASE_INDEX - 1` if empty.
    pub async fn current_index(&self) -> u64 {
        let inner = self.inner.lock().await;
        BASE_INDEX + inner.offsets.len() as u64 - 1
    }

    pub async fn is_sealed(&self) -> bool {
        self.inner.lock().await.sealed
    }

    /// Decode and return the entry at `index`, if present.
    pub async fn entry_at(&self, index: u64) -> Result<Option<LogEntry>> {
        let inner = self.inner.lock().await;
        entry_at_locked(&inner, index, self.max_entry_size)
    }

    /// Append `entry` to the segment, persisting it to the backing file and
    /// fanning the encoded bytes out to every live tail writer.
    ///
    /// Appends must be serialized by the caller (the Node's coarse lock
    /// guarantees this); this method does not itself prevent concurrent
    /// callers from interleaving, beyond guaranteeing each individual append
    /// is atomic with respect to this segment's own lock.
    pub async fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.sealed {
            return Err(Error::Sealed);
        }

        let offset = inner.buf.len() as u64;
        let mut encoded = BytesMut::with_capacity(entry.encoded_len());
        codec::encode(entry, &mut encoded);
        let encoded = encoded.freeze();

        inner.file.write_all(&encoded).await?;
        inner.file.sync_data().await?;

        inner.buf.extend_from_slice(&encoded);
        inner.offsets.push(offset);

        let mut live = Vec::with_capacity(inner.tail_writers.len());
        for writer in inner.tail_writers.drain(..) {
            match writer.data_tx.try_send(encoded.clone()) {
                Ok(()) => live.push(writer),
                // The receiver is gone: a normal `write_to` return (dropped
                // future, or already released by `seal`/`close`). Nothing to
                // signal.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
                // The writer is lagging too far behind to keep up with
                // `append`. Mark it failed before dropping its sender, so
                // `write_to` reports an error instead of a clean EOF.
                Err(mpsc::error::TrySendError::Full(_)) => {
                    writer.failed.store(true, Ordering::SeqCst);
                }
            }
        }
        inner.tail_writers = live;
        Ok(())
    }

    /// Remove every entry with index ≥ `index`. Fails with `Sealed` if the
    /// segment is sealed, or `OutOfRange` if `index < BASE_INDEX`.
    pub async fn truncate(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.sealed {
            return Err(Error::Sealed);
        }
        if index < BASE_INDEX {
            return Err(Error::OutOfRange(index));
        }

        let keep = (index - BASE_INDEX) as usize;
        if keep >= inner.offsets.len() {
            return Ok(()); // Nothing to remove.
        }

        let new_len = inner.offsets[keep];
        inner.offsets.truncate(keep);
        inner.buf.truncate(new_len as usize);
        inner.file.set_len(new_len).await?;
        inner.file.flush().await?;
        Ok(())
    }

    /// Deliver `from_index` through the current tail to `writer`, then keep
    /// delivering subsequent appends until the segment is sealed or the
    /// writer's channel fails. Bytes arrive in entry order with no
    /// interleaving from concurrent tails.
    pub async fn write_to<W>(&self, mut writer: W, from_index: u64) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (catchup, registration, already_sealed) = {
            let mut inner = self.inner.lock().await;
            if from_index < BASE_INDEX || (from_index - BASE_INDEX) as usize > inner.offsets.len() {
                return Err(Error::OutOfRange(from_index));
            }
            let idx = (from_index - BASE_INDEX) as usize;
            let start = inner.offsets.get(idx).copied().unwrap_or(inner.buf.len() as u64);
            let catchup = inner.buf[start as usize..].to_vec();

            if inner.sealed {
                (catchup, None, true)
            } else {
                let (tx, rx) = mpsc::channel(TAIL_CHANNEL_DEPTH);
                let failed = Arc::new(AtomicBool::new(false));
                inner.tail_writers.push(TailWriter {
                    data_tx: tx,
                    failed: failed.clone(),
                });
                (catchup, Some((rx, failed)), false)
            }
        };

        writer.write_all(&catchup).await?;
        writer.flush().await?;

        if already_sealed {
            return Ok(());
        }

        let (mut rx, failed) = registration.expect("registered a tail writer above");
        while let Some(bytes) = rx.recv().await {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        if failed.load(Ordering::SeqCst) {
            return Err(Error::TailWriterLagging);
        }
        Ok(())
    }

    /// Mark the segment immutable and release every live tail writer with
    /// normal completion. Idempotent.
    pub async fn seal(&self) {
        let mut inner = self.inner.lock().await;
        inner.sealed = true;
        inner.tail_writers.clear();
    }

    /// Release all live tail writers without sealing the segment.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.tail_writers.clear();
    }
}

fn entry_at_locked(inner: &Inner, index: u64, max_entry_size: usize) -> Result<Option<LogEntry>> {
    if index < BASE_INDEX {
        return Ok(None);
    }
    let idx = (index - BASE_INDEX) as usize;
    let offset = match inner.offsets.get(idx) {
        Some(&offset) => offset,
        None => return Ok(None),
    };
    let mut slice = inner.buf.clone().freeze();
    bytes::Buf::advance(&mut slice, offset as usize);
    let entry = codec::decode(&mut slice, max_entry_size)?;
    Ok(Some(entry))
}

/// Replay the raw buffer to rebuild the offsets index, verifying every
/// record decodes cleanly.
fn replay_offsets(buf: &BytesMut, max_entry_size: usize) -> Result<Vec<u64>> {
    let mut offsets = Vec::new();
    let mut cursor = buf.clone().freeze();
    let mut consumed = 0u64;
    while !cursor.is_empty() {
        offsets.push(consumed);
        let before = cursor.len();
        let entry = codec::decode(&mut cursor, max_entry_size)?;
        consumed += (before - cursor.len()) as u64;
        debug_assert_eq!(consumed as usize - *offsets.last().unwrap() as usize, entry.encoded_len());
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EntryType;

    async fn temp_segment() -> Arc<Segment> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("raftlog-segment-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        Segment::open(dir.join("1.log"), 1 << 20).await.unwrap()
    }

    fn entry(index: u64, term: u64, data: &'static str) -> LogEntry {
        LogEntry::new(EntryType::Command, index, term, data.as_bytes())
    }

    #[tokio::test]
    async fn append_then_read_back() {
        let seg = temp_segment().await;
        seg.append(&entry(1, 1, "a")).await.unwrap();
        seg.append(&entry(2, 1, "b")).await.unwrap();

        assert_eq!(seg.current_index().await, 2);
        let got = seg.entry_at(2).await.unwrap().unwrap();
        assert_eq!(got.data, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn truncate_removes_suffix_and_resets_length() {
        let seg = temp_segment().await;
        for i in 1..=5u64 {
            seg.append(&entry(i, 1, "x")).await.unwrap();
        }
        seg.truncate(3).await.unwrap();
        assert_eq!(seg.current_index().await, 2);
        assert!(seg.entry_at(3).await.unwrap().is_none());

        // Re-append should resume cleanly at index 3 with a fresh term.
        seg.append(&entry(3, 2, "y")).await.unwrap();
        assert_eq!(seg.current_index().await, 3);
    }

    #[tokio::test]
    async fn truncate_below_base_index_is_out_of_range() {
        let seg = temp_segment().await;
        assert!(matches!(seg.truncate(0).await, Err(Error::OutOfRange(0))));
    }

    #[tokio::test]
    async fn seal_rejects_further_appends_and_truncation() {
        let seg = temp_segment().await;
        seg.append(&entry(1, 1, "a")).await.unwrap();
        seg.seal().await;
        assert!(matches!(seg.append(&entry(2, 1, "b")).await, Err(Error::Sealed)));
        assert!(matches!(seg.truncate(1).await, Err(Error::Sealed)));
    }

    #[tokio::test]
    async fn write_to_streams_catchup_then_new_appends() {
        let seg = temp_segment().await;
        for i in 1..=3u64 {
            seg.append(&entry(i, 1, "x")).await.unwrap();
        }

        let seg2 = seg.clone();
        let handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            seg2.write_to(&mut buf, 2).await.unwrap();
            buf
        });

        // Give the writer a moment to register before appending index 4.
        tokio::task::yield_now().await;
        seg.append(&entry(4, 1, "y")).await.unwrap();
        seg.seal().await;

        let sink = handle.await.unwrap();
        let mut cursor = Bytes::from(sink);
        let e2 = codec::decode(&mut cursor, 1 << 20).unwrap();
        let e3 = codec::decode(&mut cursor, 1 << 20).unwrap();
        let e4 = codec::decode(&mut cursor, 1 << 20).unwrap();
        assert_eq!((e2.index, e3.index, e4.index), (2, 3, 4));
        assert!(cursor.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_to_reports_lagging_writer_as_an_error() {
        use tokio::io::AsyncReadExt;

        let seg = temp_segment().await;
        // Tiny buffer: the very first real entry already exceeds it, so the
        // writer stalls on `poll_write` until something reads `there` below.
        let (here, mut there) = tokio::io::duplex(16);

        let seg2 = seg.clone();
        let handle = tokio::spawn(async move { seg2.write_to(here, 1).await });

        // Let the writer register and get stuck on its first write before we
        // start overflowing its channel.
        tokio::task::yield_now().await;

        for i in 1..=(TAIL_CHANNEL_DEPTH as u64 + 50) {
            seg.append(&entry(i, 1, "x")).await.unwrap();
        }

        // Draining now lets the stalled writer work through its backlog and
        // discover its sender was dropped for falling behind.
        let mut sink = Vec::new();
        there.read_to_end(&mut sink).await.unwrap();

        assert!(matches!(handle.await.unwrap(), Err(Error::TailWriterLagging)));
    }
}
