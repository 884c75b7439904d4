//! Buffered append-only file writer with an explicit durability point.
//!
//! Small appends are coalesced into one `write` syscall per buffer-full;
//! [`BufferedWriter::flush`] drains the buffer and fsyncs. The fsync is
//! elided when nothing reached the file since the previous flush.

use std::io::SeekFrom;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{Result, WalError};

/// Matches the segment reader's chunk size.
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

pub struct BufferedWriter {
    file: File,
    buf: BytesMut,
    capacity: usize,
    /// Bytes reached the file since the last sync.
    unsynced: bool,
}

impl BufferedWriter {
    pub fn new(file: File) -> Self {
        Self::with_capacity(file, WRITE_BUFFER_SIZE)
    }

    pub fn with_capacity(file: File, capacity: usize) -> Self {
        Self {
            file,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            unsynced: false,
        }
    }

    /// Appends `bytes` at the logical end of the file.
    ///
    /// Inputs at least as large as the buffer skip it entirely when the
    /// buffer is empty; otherwise the buffer is filled, drained when full,
    /// and the trailing remainder stays buffered.
    pub async fn write(&mut self, mut bytes: &[u8]) -> Result<()> {
        if self.buf.is_empty() && bytes.len() >= self.capacity {
            return self.write_to_file(bytes).await;
        }

        while !bytes.is_empty() {
            let room = self.capacity - self.buf.len();
            let take = room.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.buf.len() == self.capacity {
                self.drain_buffer().await?;
            }
        }
        Ok(())
    }

    /// Drains the buffer and fsyncs. Idempotent: a flush with no new bytes
    /// since the previous one issues no sync.
    pub async fn flush(&mut self) -> Result<()> {
        self.drain_buffer().await?;
        if self.unsynced {
            self.file.sync_data().await?;
            self.unsynced = false;
        }
        Ok(())
    }

    /// Flush, then release the handle.
    pub async fn close(mut self) -> Result<()> {
        self.flush().await
    }

    /// Cuts the file down to `len` bytes. Pending buffered bytes are written
    /// first so the cut point is measured against real file content.
    pub async fn truncate(&mut self, len: u64) -> Result<()> {
        self.drain_buffer().await?;
        self.file.set_len(len).await?;
        // The cursor must follow the cut, or the next write leaves a hole.
        self.file.seek(SeekFrom::Start(len)).await?;
        self.file.sync_data().await?;
        self.unsynced = false;
        Ok(())
    }

    async fn drain_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.write_to_file(&chunk).await
    }

    async fn write_to_file(&mut self, bytes: &[u8]) -> Result<()> {
        let written = self.file.write(bytes).await?;
        if written != bytes.len() {
            return Err(WalError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        self.unsynced = true;
        Ok(())
    }
}
