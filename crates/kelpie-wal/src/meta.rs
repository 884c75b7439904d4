//! The meta index: a crash-safe map from logical record index to
//! `(segment, byte offset)`.
//!
//! `index.META` holds a fixed 20-byte header followed by a dense array of
//! 8-byte slots; slot `i` locates logical index `base + i`. All integers are
//! big-endian; the commit pointer is a signed 32-bit field so `-1` encodes
//! as `0xFFFFFFFF`.
//!
//! ```text
//! ┌ "META" (4B) ┬ Base (4B) ┬ Head (4B) ┬ Commit (4B, signed) ┬ CurrentSegment (4B) ┐
//! ┌ SegmentID (4B) ┬ ByteOffset (4B) ┐  … repeated
//! ```
//!
//! Compaction and archival rewrite the file through `index.META.tmp` and an
//! atomic rename; a crash can therefore leave a stale `.tmp` behind, which
//! [`MetaIndex::open`] cleans up.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut};
use kelpie_observe::{Meter, WalEvent};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, WalError};

pub(crate) const META_FILE: &str = "index.META";
pub(crate) const META_TMP_FILE: &str = "index.META.tmp";
const META_MARKER: [u8; 4] = *b"META";
pub(crate) const META_HEADER_SIZE: u64 = 20;
pub(crate) const INDEX_ENTRY_SIZE: u64 = 8;
/// Slots moved per read/write while rewriting the index array.
const COMPACTION_BATCH_SIZE: usize = 1024;
/// In-memory commit pointer when nothing is committed.
pub(crate) const NO_COMMIT: i64 = -1;

/// Buffering behavior of the meta index.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Batched mode: queue slot writes in memory and flush them together.
    /// Direct mode persists every mutation immediately.
    pub buffering_enabled: bool,
    /// Queue length that forces a flush in batched mode.
    pub max_buffer_size: usize,
    /// Period of the background flusher in batched mode.
    pub auto_sync_interval: Duration,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            buffering_enabled: true,
            max_buffer_size: 1024,
            auto_sync_interval: Duration::from_millis(1000),
        }
    }
}

/// The in-memory copy of the 20-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Smallest logical index still represented in the array.
    pub base: u32,
    /// One past the greatest logical index ever assigned.
    pub head: u32,
    /// Greatest committed logical index; [`NO_COMMIT`] when none.
    pub commit: i64,
    /// Segment of the most recent live record.
    pub current_segment: u32,
}

impl MetaHeader {
    fn empty() -> Self {
        Self {
            base: 0,
            head: 0,
            commit: NO_COMMIT,
            current_segment: 0,
        }
    }

    fn encode(&self) -> [u8; META_HEADER_SIZE as usize] {
        let mut out = [0u8; META_HEADER_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_slice(&META_MARKER);
        buf.put_u32(self.base);
        buf.put_u32(self.head);
        buf.put_i32(self.commit as i32);
        buf.put_u32(self.current_segment);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_HEADER_SIZE as usize || buf[..4] != META_MARKER {
            return Err(WalError::InvalidMetaMarker);
        }
        let mut buf = &buf[4..];
        Ok(Self {
            base: buf.get_u32(),
            head: buf.get_u32(),
            commit: i64::from(buf.get_i32()),
            current_segment: buf.get_u32(),
        })
    }

    /// The mutable part of the header: head, commit, current segment — one
    /// 12-byte write at offset 8. Base only changes when the whole file is
    /// rewritten.
    fn tail(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        let mut buf = &mut out[..];
        buf.put_u32(self.head);
        buf.put_i32(self.commit as i32);
        buf.put_u32(self.current_segment);
        out
    }
}

struct MetaInner {
    file: File,
    header: MetaHeader,
    /// Encoded queued slots, contiguous from `queue_start_slot`.
    queue: Vec<u8>,
    queue_start_slot: u32,
    /// In-memory header is ahead of the file.
    dirty: bool,
    config: MetaConfig,
    meter: Arc<dyn Meter>,
    path: PathBuf,
    tmp_path: PathBuf,
}

/// Owner of `index.META`. Internally synchronized: the coordinator's write
/// path, its read paths, and the background flusher all go through one lock,
/// so the file sees one task at a time.
pub(crate) struct MetaIndex {
    inner: Arc<Mutex<MetaInner>>,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MetaIndex {
    /// Opens or creates `dir/index.META`, cleaning up after an interrupted
    /// compaction or archival first.
    pub(crate) async fn open(
        dir: &Path,
        config: MetaConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        let path = dir.join(META_FILE);
        let tmp_path = dir.join(META_TMP_FILE);

        let tmp_exists = tokio::fs::try_exists(&tmp_path).await?;
        let live_exists = tokio::fs::try_exists(&path).await?;
        if tmp_exists {
            if live_exists {
                // Interrupted rewrite: the live file is still authoritative.
                warn!(path = %tmp_path.display(), "removing stale meta index rewrite");
                tokio::fs::remove_file(&tmp_path).await?;
            } else {
                // Crash between the two archive renames: the replacement is
                // complete and the old live file already moved away.
                warn!(path = %tmp_path.display(), "promoting interrupted meta index rewrite");
                tokio::fs::rename(&tmp_path, &path).await?;
            }
        }

        let exists = live_exists || tmp_exists;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .await?;

        let header = if exists {
            if file.metadata().await?.len() < META_HEADER_SIZE {
                return Err(WalError::InvalidMetaMarker);
            }
            read_header(&mut file).await?
        } else {
            let header = MetaHeader::empty();
            file.write_all(&header.encode()).await?;
            file.sync_data().await?;
            header
        };
        debug!(
            base = header.base,
            head = header.head,
            commit = header.commit,
            current_segment = header.current_segment,
            "meta index opened"
        );

        let inner = Arc::new(Mutex::new(MetaInner {
            file,
            header,
            queue: Vec::new(),
            queue_start_slot: 0,
            dirty: false,
            config: config.clone(),
            meter,
            path,
            tmp_path,
        }));

        let flusher = if config.buffering_enabled {
            Some(spawn_flusher(Arc::clone(&inner), config.auto_sync_interval))
        } else {
            None
        };

        Ok(Self {
            inner,
            flusher: std::sync::Mutex::new(flusher),
        })
    }

    /// Records the location of the next logical index and returns that
    /// index. `segment_id` must not move backwards.
    pub(crate) async fn append(&self, segment_id: u32, offset: u32) -> Result<u32> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if segment_id < inner.header.current_segment {
            return Err(WalError::OutOfOrderSegment {
                given: segment_id,
                current: inner.header.current_segment,
            });
        }

        let slot = inner.header.head - inner.header.base;
        let mut entry = [0u8; INDEX_ENTRY_SIZE as usize];
        {
            let mut buf = &mut entry[..];
            buf.put_u32(segment_id);
            buf.put_u32(offset);
        }

        let index = inner.header.head;
        inner.header.head += 1;
        inner.header.current_segment = segment_id;

        if inner.config.buffering_enabled {
            if inner.queue.is_empty() {
                inner.queue_start_slot = slot;
            }
            inner.queue.extend_from_slice(&entry);
            inner.dirty = true;
            if inner.queue.len() as u64 / INDEX_ENTRY_SIZE >= inner.config.max_buffer_size as u64 {
                flush_locked(inner).await?;
            }
        } else {
            write_slot(&mut inner.file, slot, &entry).await?;
            let tail = inner.header.tail();
            write_header_tail(&mut inner.file, &tail).await?;
            inner.file.sync_data().await?;
        }

        Ok(index)
    }

    /// Advances the commit pointer to `index`. Idempotent at or below the
    /// current pointer; anything past `commit + 1` is out of order.
    pub(crate) async fn commit(&self, index: u32) -> Result<u32> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if i64::from(index) <= inner.header.commit {
            return Ok(inner.header.commit as u32);
        }
        let expected = inner.header.commit + 1;
        if i64::from(index) != expected {
            return Err(WalError::OutOfOrderCommit {
                expected: expected as u32,
            });
        }

        inner.header.commit = i64::from(index);
        if inner.config.buffering_enabled {
            inner.dirty = true;
        } else {
            let tail = inner.header.tail();
            write_header_tail(&mut inner.file, &tail).await?;
            inner.file.sync_data().await?;
        }
        Ok(index)
    }

    /// Looks up the `(segment, byte offset)` of a logical index. Flushes
    /// first so the slot read comes from consistent on-disk state.
    pub(crate) async fn position(&self, index: u32) -> Result<(u32, u32)> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let (base, head) = (inner.header.base, inner.header.head);
        if index < base || index >= head {
            return Err(WalError::OutOfBounds { index, base, head });
        }

        flush_locked(inner).await?;
        read_slot(&mut inner.file, index - base).await
    }

    /// Rewinds the head to `from`, dropping `[from, head)` from the index.
    /// The array tail past the new head is left in place, unused.
    pub(crate) async fn truncate(&self, from: u32) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let (base, head) = (inner.header.base, inner.header.head);
        if from >= head {
            return Err(WalError::OutOfBounds {
                index: from,
                base,
                head,
            });
        }
        if i64::from(from) <= inner.header.commit {
            return Err(WalError::TruncateCommitted(from));
        }

        flush_locked(inner).await?;

        // The record being cut tells us which segment the log resumes in;
        // without this rewind, appends after a truncation spanning segments
        // would be rejected as out of order.
        let (segment, _) = read_slot(&mut inner.file, from - base).await?;
        inner.header.head = from;
        inner.header.current_segment = segment;

        let tail = inner.header.tail();
        write_header_tail(&mut inner.file, &tail).await?;
        inner.file.sync_data().await?;
        inner.meter.emit(WalEvent::Truncated { head: from });
        Ok(())
    }

    /// Drops the committed prefix: rewrites the file with `base = commit + 1`
    /// through a temp file and an atomic rename.
    pub(crate) async fn compact(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        flush_locked(inner).await?;

        let old = inner.header;
        let new_base = (old.commit + 1) as u32;
        write_rebased_copy(&mut inner.file, &inner.tmp_path, old).await?;

        tokio::fs::rename(&inner.tmp_path, &inner.path).await?;
        reopen(inner).await?;

        inner.meter.emit(WalEvent::Compacted { base: new_base });
        debug!(base = new_base, "meta index compacted");
        Ok(())
    }

    /// Like [`compact`](Self::compact), but the replaced index is preserved
    /// under `archive_dir/index.META`, trimmed to its committed prefix.
    ///
    /// Order matters for crash safety: the replacement is complete and
    /// fsynced under `.tmp` before the live file moves, so every crash
    /// boundary leaves either the old live file or a promotable `.tmp`.
    pub(crate) async fn archive(&self, archive_dir: &Path) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        flush_locked(inner).await?;

        let old = inner.header;
        let new_base = (old.commit + 1) as u32;
        write_rebased_copy(&mut inner.file, &inner.tmp_path, old).await?;

        tokio::fs::create_dir_all(archive_dir).await?;
        let archived = archive_dir.join(META_FILE);
        rename_or_copy(&inner.path, &archived).await?;
        tokio::fs::rename(&inner.tmp_path, &inner.path).await?;

        // Trim the archived copy to the entries it still describes:
        // [base, commit], with the head rewritten to match.
        let keep = (old.commit + 1 - i64::from(old.base)) as u64;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&archived)
            .await?;
        file.set_len(META_HEADER_SIZE + keep * INDEX_ENTRY_SIZE).await?;
        let archived_header = MetaHeader {
            head: new_base,
            ..old
        };
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&archived_header.encode()).await?;
        file.sync_all().await?;
        drop(file);

        reopen(inner).await?;

        inner.meter.emit(WalEvent::Archived { base: new_base });
        debug!(base = new_base, dir = %archive_dir.display(), "meta index archived");
        Ok(())
    }

    pub(crate) async fn snapshot(&self) -> MetaHeader {
        self.inner.lock().await.header
    }

    pub(crate) async fn head(&self) -> u32 {
        self.inner.lock().await.header.head
    }

    pub(crate) async fn commit_index(&self) -> i64 {
        self.inner.lock().await.header.commit
    }

    /// Stops the background flusher and writes out any queued state.
    pub(crate) async fn close(&self) -> Result<()> {
        if let Ok(mut guard) = self.flusher.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        let mut guard = self.inner.lock().await;
        flush_locked(&mut guard).await
    }
}

impl Drop for MetaIndex {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.flusher.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn spawn_flusher(inner: Arc<Mutex<MetaInner>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut guard = inner.lock().await;
            if let Err(e) = flush_locked(&mut guard).await {
                warn!(error = %e, "periodic meta index flush failed");
            }
        }
    })
}

/// Writes the header tail and any queued slots, then fsyncs. No-op when
/// nothing changed since the last flush.
async fn flush_locked(inner: &mut MetaInner) -> Result<()> {
    if inner.queue.is_empty() && !inner.dirty {
        return Ok(());
    }

    let tail = inner.header.tail();
    write_header_tail(&mut inner.file, &tail).await?;

    if !inner.queue.is_empty() {
        let pos = META_HEADER_SIZE + u64::from(inner.queue_start_slot) * INDEX_ENTRY_SIZE;
        inner.file.seek(SeekFrom::Start(pos)).await?;
        inner.file.write_all(&inner.queue).await?;
        inner.meter.emit(WalEvent::MetaFlush {
            entries: inner.queue.len() / INDEX_ENTRY_SIZE as usize,
        });
        inner.queue.clear();
    }

    inner.file.sync_data().await?;
    inner.dirty = false;
    Ok(())
}

/// Streams a copy of the index with `base = commit + 1` into `tmp_path` and
/// fsyncs it. Slots are moved in bounded batches so a huge index never sits
/// in memory at once.
async fn write_rebased_copy(src: &mut File, tmp_path: &Path, old: MetaHeader) -> Result<()> {
    let new_base = (old.commit + 1) as u32;
    let new_header = MetaHeader {
        base: new_base,
        ..old
    };

    let mut tmp = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(tmp_path)
        .await?;
    tmp.write_all(&new_header.encode()).await?;

    let total = (old.head - new_base) as usize;
    let mut copied = 0usize;
    let mut batch = vec![0u8; COMPACTION_BATCH_SIZE * INDEX_ENTRY_SIZE as usize];
    while copied < total {
        let count = (total - copied).min(COMPACTION_BATCH_SIZE);
        let bytes = count * INDEX_ENTRY_SIZE as usize;
        let src_slot = u64::from(new_base - old.base) + copied as u64;

        src.seek(SeekFrom::Start(META_HEADER_SIZE + src_slot * INDEX_ENTRY_SIZE))
            .await?;
        src.read_exact(&mut batch[..bytes]).await?;
        tmp.write_all(&batch[..bytes]).await?;
        copied += count;
    }

    tmp.sync_all().await?;
    Ok(())
}

/// Re-reads the header from the freshly swapped-in file.
async fn reopen(inner: &mut MetaInner) -> Result<()> {
    inner.file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&inner.path)
        .await?;
    inner.header = read_header(&mut inner.file).await?;
    inner.queue.clear();
    inner.dirty = false;
    Ok(())
}

async fn read_header(file: &mut File) -> Result<MetaHeader> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut buf = [0u8; META_HEADER_SIZE as usize];
    file.read_exact(&mut buf).await?;
    MetaHeader::decode(&buf)
}

async fn write_header_tail(file: &mut File, tail: &[u8; 12]) -> Result<()> {
    file.seek(SeekFrom::Start(8)).await?;
    file.write_all(tail).await?;
    Ok(())
}

async fn write_slot(file: &mut File, slot: u32, entry: &[u8; INDEX_ENTRY_SIZE as usize]) -> Result<()> {
    file.seek(SeekFrom::Start(
        META_HEADER_SIZE + u64::from(slot) * INDEX_ENTRY_SIZE,
    ))
    .await?;
    file.write_all(entry).await?;
    Ok(())
}

async fn read_slot(file: &mut File, slot: u32) -> Result<(u32, u32)> {
    file.seek(SeekFrom::Start(
        META_HEADER_SIZE + u64::from(slot) * INDEX_ENTRY_SIZE,
    ))
    .await?;
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    file.read_exact(&mut buf).await?;
    let mut buf = &buf[..];
    Ok((buf.get_u32(), buf.get_u32()))
}

/// Moves a file, falling back to copy-then-unlink across filesystems.
pub(crate) async fn rename_or_copy(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kelpie_observe::NoopMeter;
    use tempfile::TempDir;

    fn direct_config() -> MetaConfig {
        MetaConfig {
            buffering_enabled: false,
            ..Default::default()
        }
    }

    async fn open_meta(dir: &Path, config: MetaConfig) -> MetaIndex {
        MetaIndex::open(dir, config, Arc::new(NoopMeter)).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_empty_header() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;

        let header = meta.snapshot().await;
        assert_eq!(header, MetaHeader::empty());

        let bytes = tokio::fs::read(dir.path().join(META_FILE)).await.unwrap();
        assert_eq!(bytes.len(), META_HEADER_SIZE as usize);
        assert_eq!(&bytes[..4], b"META");
        // Commit -1 encodes as all ones.
        assert_eq!(&bytes[12..16], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_open_rejects_bad_marker() {
        let dir = TempDir::new().unwrap();
        let mut bytes = MetaHeader::empty().encode().to_vec();
        bytes[0] = b'X';
        tokio::fs::write(dir.path().join(META_FILE), &bytes).await.unwrap();

        let result = MetaIndex::open(dir.path(), direct_config(), Arc::new(NoopMeter)).await;
        assert!(matches!(result, Err(WalError::InvalidMetaMarker)));
    }

    #[tokio::test]
    async fn test_append_and_position_direct() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;

        assert_eq!(meta.append(0, 0).await.unwrap(), 0);
        assert_eq!(meta.append(0, 17).await.unwrap(), 1);
        assert_eq!(meta.append(1, 0).await.unwrap(), 2);

        assert_eq!(meta.position(0).await.unwrap(), (0, 0));
        assert_eq!(meta.position(1).await.unwrap(), (0, 17));
        assert_eq!(meta.position(2).await.unwrap(), (1, 0));

        let header = meta.snapshot().await;
        assert_eq!(header.head, 3);
        assert_eq!(header.current_segment, 1);
    }

    #[tokio::test]
    async fn test_append_rejects_backward_segment() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;

        meta.append(3, 0).await.unwrap();
        assert!(matches!(
            meta.append(2, 0).await,
            Err(WalError::OutOfOrderSegment { given: 2, current: 3 })
        ));
    }

    #[tokio::test]
    async fn test_position_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;
        meta.append(0, 0).await.unwrap();

        assert!(matches!(
            meta.position(1).await,
            Err(WalError::OutOfBounds { index: 1, base: 0, head: 1 })
        ));
    }

    #[tokio::test]
    async fn test_commit_sequence() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;
        for i in 0..5u32 {
            meta.append(0, i * 10).await.unwrap();
        }

        assert_eq!(meta.commit(0).await.unwrap(), 0);
        assert_eq!(meta.commit(1).await.unwrap(), 1);
        // Idempotent at or below the pointer.
        assert_eq!(meta.commit(0).await.unwrap(), 1);
        assert_eq!(meta.commit(1).await.unwrap(), 1);
        // Skipping ahead is out of order.
        assert!(matches!(
            meta.commit(3).await,
            Err(WalError::OutOfOrderCommit { expected: 2 })
        ));
    }

    #[tokio::test]
    async fn test_truncate_bounds_and_committed() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;
        for i in 0..5u32 {
            meta.append(0, i * 10).await.unwrap();
        }
        meta.commit(0).await.unwrap();
        meta.commit(1).await.unwrap();

        assert!(matches!(
            meta.truncate(5).await,
            Err(WalError::OutOfBounds { .. })
        ));
        assert!(matches!(
            meta.truncate(1).await,
            Err(WalError::TruncateCommitted(1))
        ));

        meta.truncate(3).await.unwrap();
        let header = meta.snapshot().await;
        assert_eq!(header.head, 3);
        assert_eq!(header.commit, 1);
        // Entries below the cut are untouched.
        assert_eq!(meta.position(2).await.unwrap(), (0, 20));
        assert!(meta.position(3).await.is_err());
    }

    #[tokio::test]
    async fn test_truncate_rewinds_current_segment() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;
        meta.append(0, 0).await.unwrap();
        meta.append(1, 0).await.unwrap();
        meta.append(2, 0).await.unwrap();

        meta.truncate(1).await.unwrap();
        assert_eq!(meta.snapshot().await.current_segment, 1);
        // Appends to the resumed segment are in order again.
        meta.append(1, 50).await.unwrap();
    }

    #[tokio::test]
    async fn test_batched_appends_queue_until_flush() {
        let dir = TempDir::new().unwrap();
        let config = MetaConfig {
            buffering_enabled: true,
            max_buffer_size: 1024,
            auto_sync_interval: Duration::from_secs(3600),
        };
        let meta = open_meta(dir.path(), config).await;

        for i in 0..10u32 {
            meta.append(0, i * 17).await.unwrap();
        }

        // Nothing on disk yet: file is still just the (stale) header.
        let len = tokio::fs::metadata(dir.path().join(META_FILE))
            .await
            .unwrap()
            .len();
        assert_eq!(len, META_HEADER_SIZE);

        // position() forces the flush.
        assert_eq!(meta.position(7).await.unwrap(), (0, 7 * 17));
        let len = tokio::fs::metadata(dir.path().join(META_FILE))
            .await
            .unwrap()
            .len();
        assert_eq!(len, META_HEADER_SIZE + 10 * INDEX_ENTRY_SIZE);
    }

    #[tokio::test]
    async fn test_batched_flush_on_queue_limit() {
        let dir = TempDir::new().unwrap();
        let config = MetaConfig {
            buffering_enabled: true,
            max_buffer_size: 4,
            auto_sync_interval: Duration::from_secs(3600),
        };
        let meta = open_meta(dir.path(), config).await;

        for i in 0..4u32 {
            meta.append(0, i).await.unwrap();
        }

        let len = tokio::fs::metadata(dir.path().join(META_FILE))
            .await
            .unwrap()
            .len();
        assert_eq!(len, META_HEADER_SIZE + 4 * INDEX_ENTRY_SIZE);
    }

    #[tokio::test]
    async fn test_periodic_flusher_writes_queue() {
        let dir = TempDir::new().unwrap();
        let config = MetaConfig {
            buffering_enabled: true,
            max_buffer_size: 1024,
            auto_sync_interval: Duration::from_millis(20),
        };
        let meta = open_meta(dir.path(), config).await;

        meta.append(0, 99).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let bytes = tokio::fs::read(dir.path().join(META_FILE)).await.unwrap();
        assert_eq!(bytes.len() as u64, META_HEADER_SIZE + INDEX_ENTRY_SIZE);
        // Head reached the file without an explicit flush call.
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        drop(meta);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let meta = open_meta(dir.path(), direct_config()).await;
            for i in 0..20u32 {
                meta.append(i / 10, i * 5).await.unwrap();
            }
            meta.commit(0).await.unwrap();
            meta.commit(1).await.unwrap();
            meta.close().await.unwrap();
        }

        let meta = open_meta(dir.path(), direct_config()).await;
        let header = meta.snapshot().await;
        assert_eq!(header.head, 20);
        assert_eq!(header.commit, 1);
        assert_eq!(header.current_segment, 1);
        assert_eq!(meta.position(15).await.unwrap(), (1, 75));
    }

    #[tokio::test]
    async fn test_compact_drops_committed_prefix() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(dir.path(), direct_config()).await;
        for i in 0..10u32 {
            meta.append(i / 4, i * 3).await.unwrap();
        }
        for i in 0..=5u32 {
            meta.commit(i).await.unwrap();
        }

        meta.compact().await.unwrap();

        let header = meta.snapshot().await;
        assert_eq!(header.base, 6);
        assert_eq!(header.head, 10);
        assert_eq!(header.commit, 5);
        assert_eq!(header.current_segment, 2);

        assert!(matches!(
            meta.position(5).await,
            Err(WalError::OutOfBounds { .. })
        ));
        assert_eq!(meta.position(6).await.unwrap(), (1, 18));
        assert_eq!(meta.position(9).await.unwrap(), (2, 27));

        // The file shrank to header + the four surviving slots.
        let len = tokio::fs::metadata(dir.path().join(META_FILE))
            .await
            .unwrap()
            .len();
        assert_eq!(len, META_HEADER_SIZE + 4 * INDEX_ENTRY_SIZE);
        assert!(!tokio::fs::try_exists(dir.path().join(META_TMP_FILE))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compact_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let meta = open_meta(dir.path(), direct_config()).await;
            for i in 0..8u32 {
                meta.append(0, i * 2).await.unwrap();
            }
            for i in 0..=3u32 {
                meta.commit(i).await.unwrap();
            }
            meta.compact().await.unwrap();
            meta.close().await.unwrap();
        }

        let meta = open_meta(dir.path(), direct_config()).await;
        let header = meta.snapshot().await;
        assert_eq!(header.base, 4);
        assert_eq!(header.head, 8);
        assert_eq!(meta.position(4).await.unwrap(), (0, 8));
    }

    #[tokio::test]
    async fn test_archive_preserves_committed_prefix_offside() {
        let dir = TempDir::new().unwrap();
        let archive_dir = dir.path().join("archive");

        let meta = open_meta(dir.path(), direct_config()).await;
        for i in 0..10u32 {
            meta.append(0, i * 7).await.unwrap();
        }
        for i in 0..=6u32 {
            meta.commit(i).await.unwrap();
        }

        meta.archive(&archive_dir).await.unwrap();

        // Live index rebased past the commit.
        let header = meta.snapshot().await;
        assert_eq!(header.base, 7);
        assert_eq!(header.head, 10);
        assert_eq!(meta.position(8).await.unwrap(), (0, 56));

        // Archived copy holds exactly the committed prefix.
        let bytes = tokio::fs::read(archive_dir.join(META_FILE)).await.unwrap();
        assert_eq!(bytes.len() as u64, META_HEADER_SIZE + 7 * INDEX_ENTRY_SIZE);
        let archived = MetaHeader::decode(&bytes).unwrap();
        assert_eq!(archived.base, 0);
        assert_eq!(archived.head, 7);
        assert_eq!(archived.commit, 6);
        // Slot 3 still locates index 3.
        let slot = &bytes[(META_HEADER_SIZE + 3 * INDEX_ENTRY_SIZE) as usize..][..8];
        assert_eq!(slot, &[0, 0, 0, 0, 0, 0, 0, 21]);
    }

    #[tokio::test]
    async fn test_open_removes_stale_tmp_next_to_live() {
        let dir = TempDir::new().unwrap();
        {
            let meta = open_meta(dir.path(), direct_config()).await;
            meta.append(0, 0).await.unwrap();
            meta.close().await.unwrap();
        }
        tokio::fs::write(dir.path().join(META_TMP_FILE), b"half-finished")
            .await
            .unwrap();

        let meta = open_meta(dir.path(), direct_config()).await;
        assert_eq!(meta.head().await, 1);
        assert!(!tokio::fs::try_exists(dir.path().join(META_TMP_FILE))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_open_promotes_orphan_tmp() {
        let dir = TempDir::new().unwrap();
        let mut header = MetaHeader::empty();
        header.head = 3;
        header.base = 3;
        header.commit = 2;
        tokio::fs::write(dir.path().join(META_TMP_FILE), header.encode())
            .await
            .unwrap();

        let meta = open_meta(dir.path(), direct_config()).await;
        let loaded = meta.snapshot().await;
        assert_eq!(loaded.base, 3);
        assert_eq!(loaded.head, 3);
        assert_eq!(loaded.commit, 2);
        assert!(tokio::fs::try_exists(dir.path().join(META_FILE))
            .await
            .unwrap());
        assert!(!tokio::fs::try_exists(dir.path().join(META_TMP_FILE))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_header_encoding_is_byte_exact() {
        let header = MetaHeader {
            base: 1,
            head: 0x0102_0304,
            commit: -1,
            current_segment: 2,
        };
        let bytes = header.encode();
        assert_eq!(
            bytes,
            [
                b'M', b'E', b'T', b'A', // marker
                0, 0, 0, 1, // base
                1, 2, 3, 4, // head
                0xFF, 0xFF, 0xFF, 0xFF, // commit = -1
                0, 0, 0, 2, // current segment
            ]
        );
        assert_eq!(MetaHeader::decode(&bytes).unwrap(), header);
    }
}
