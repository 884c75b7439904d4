//! Segment files: append-side writer and scan/random-access reader.
//!
//! A segment is `<N>.wal` in the log directory, `N` a plain decimal segment
//! ID. Content is a concatenation of frames (9-byte header + payload); a
//! record never straddles two segments.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::buffer::BufferedWriter;
use crate::entry::{Entry, EntryRegistry};
use crate::error::{Result, WalError};
use crate::frame::{payload_crc, FrameHeader, FRAME_HEADER_SIZE};

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id}.wal"))
}

/// Parses a segment ID from a `<N>.wal` path. Non-canonical names (leading
/// zeros, non-numeric stems, other extensions) are not segments.
pub(crate) fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension()?.to_str()? != "wal" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let id: u32 = stem.parse().ok()?;
    (stem == id.to_string()).then_some(id)
}

/// All segment IDs in `dir`, ascending.
pub(crate) async fn list_segment_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = parse_segment_id(&entry.path()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Appends frames to one segment file. Single writer at a time; the
/// coordinator's write lock enforces that.
pub struct SegmentWriter {
    id: u32,
    writer: BufferedWriter,
    size: u64,
}

impl SegmentWriter {
    /// Opens `<id>.wal` for appending, creating it if absent. `size` starts
    /// at the existing file length so returned offsets and the rollover
    /// check see the real end of the segment.
    pub async fn open(dir: &Path, id: u32) -> Result<Self> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .await?;

        let size = file.metadata().await?.len();
        if size > 0 {
            file.seek(SeekFrom::End(0)).await?;
        }

        Ok(Self {
            id,
            writer: BufferedWriter::new(file),
            size,
        })
    }

    /// Appends one framed record and returns the byte offset at which it
    /// begins.
    pub async fn append(&mut self, header: FrameHeader, payload: &[u8]) -> Result<u64> {
        let offset = self.size;
        self.writer.write(&header.encode()).await?;
        self.writer.write(payload).await?;
        self.size += (FRAME_HEADER_SIZE + payload.len()) as u64;
        Ok(offset)
    }

    /// Durability point: drain the write buffer and fsync.
    pub async fn sync(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Sync, then release the handle.
    pub async fn close(mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.close().await
    }

    /// Cuts the segment down to `len` bytes.
    pub async fn truncate(&mut self, len: u64) -> Result<()> {
        self.writer.truncate(len).await?;
        self.size = len;
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current segment length in bytes, used for rollover decisions.
    pub fn size(&self) -> u64 {
        self.size
    }
}

struct BufferedFrame {
    header: FrameHeader,
    payload: Bytes,
}

/// Sequential and random-access decoding of one segment file.
///
/// `read_next` is the scanning fast path: it parses the header and buffers
/// the payload without touching the checksum. `decode` validates the CRC and
/// produces the typed entry.
pub struct SegmentReader {
    file: File,
    registry: Arc<EntryRegistry>,
    /// Unconsumed bytes starting at file offset `pos`.
    buf: Vec<u8>,
    /// File offset of `buf[0]`; after a successful `read_next` this is the
    /// end of the buffered frame.
    pos: u64,
    current: Option<BufferedFrame>,
    last_index: Option<u32>,
}

impl SegmentReader {
    pub async fn open(dir: &Path, id: u32, registry: Arc<EntryRegistry>) -> Result<Self> {
        Self::open_path(&segment_path(dir, id), registry).await
    }

    pub async fn open_path(path: &Path, registry: Arc<EntryRegistry>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            registry,
            buf: Vec::new(),
            pos: 0,
            current: None,
            last_index: None,
        })
    }

    /// Advances the cursor by one frame.
    ///
    /// Returns `false` on clean EOF (zero bytes left). A torn header or a
    /// payload cut off mid-way is `UnexpectedEof`; an unregistered tag is
    /// `UnknownType`. The checksum is not validated here.
    pub async fn read_next(&mut self) -> Result<bool> {
        self.current = None;

        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(false);
        }
        while self.buf.len() < FRAME_HEADER_SIZE {
            if self.fill().await? == 0 {
                return Err(WalError::UnexpectedEof);
            }
        }

        let header = FrameHeader::decode(&self.buf)?;
        let probe = self.registry.create(header.type_tag)?;

        let payload_len = loop {
            match probe.read(&self.buf[FRAME_HEADER_SIZE..]) {
                Ok(len) => break len,
                Err(WalError::Incomplete) => {
                    if self.fill().await? == 0 {
                        return Err(WalError::UnexpectedEof);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        while self.buf.len() < frame_len {
            if self.fill().await? == 0 {
                return Err(WalError::UnexpectedEof);
            }
        }

        let payload = Bytes::copy_from_slice(&self.buf[FRAME_HEADER_SIZE..frame_len]);
        self.buf.drain(..frame_len);
        self.pos += frame_len as u64;
        self.last_index = Some(header.index);
        self.current = Some(BufferedFrame { header, payload });
        Ok(true)
    }

    /// Validates the buffered frame's CRC and decodes its payload through a
    /// fresh codec.
    pub fn decode(&self) -> Result<Entry> {
        let frame = self.current.as_ref().ok_or(WalError::NoCurrentEntry)?;

        let computed = payload_crc(&frame.payload);
        if computed != frame.header.crc {
            return Err(WalError::CorruptEntry {
                index: frame.header.index,
                stored: frame.header.crc,
                computed,
            });
        }

        let mut codec = self.registry.create(frame.header.type_tag)?;
        codec.decode(&frame.payload)?;
        Ok(Entry {
            index: frame.header.index,
            type_tag: frame.header.type_tag,
            payload: codec,
        })
    }

    /// Scans to clean EOF and returns the last `Index` seen, if any.
    pub async fn seek_end(&mut self) -> Result<Option<u32>> {
        while self.read_next().await? {}
        Ok(self.last_index)
    }

    /// Repositions the cursor and reads the frame starting at `offset`
    /// without decoding it. Returns `false` when `offset` is clean EOF.
    pub async fn read_at(&mut self, offset: u64) -> Result<bool> {
        self.buf.clear();
        self.pos = offset;
        self.current = None;
        self.read_next().await
    }

    /// One-shot random read: the frame at `offset`, CRC-checked and decoded.
    pub async fn read_offset(&mut self, offset: u64) -> Result<Entry> {
        if !self.read_at(offset).await? {
            return Err(WalError::UnexpectedEof);
        }
        self.decode()
    }

    /// File offset of the next unread byte; after `read_next` this is the
    /// end of the frame just read.
    pub fn offset(&self) -> u64 {
        self.pos
    }

    /// Header of the buffered frame, if any.
    pub fn current_header(&self) -> Option<&FrameHeader> {
        self.current.as_ref().map(|f| &f.header)
    }

    async fn fill(&mut self) -> Result<usize> {
        let read_pos = self.pos + self.buf.len() as u64;
        self.file.seek(SeekFrom::Start(read_pos)).await?;

        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let n = self.file.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}
