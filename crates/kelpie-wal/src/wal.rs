//! The log coordinator: serialized appends, size-triggered segment
//! rollover, coalesced durability fences, recovery, compaction, archival.
//!
//! Concurrency model: one cooperative write lock owns the mutable state
//! (active segment writer, durability waiters, sync flag). `write`,
//! `close`, `compact`, `archive`, and the sync driver serialize on it;
//! `get_entry` reads already-persisted state through its own handle and
//! never takes it. A `write` returns only after an fsync covering its bytes
//! has completed: waiters are registered under the lock right after the
//! append, and the sync driver drains them under the same lock after
//! `fsync` returns, so a waiter can never be resolved by a sync that
//! missed it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kelpie_observe::{Meter, NoopMeter, WalEvent};
use tokio::fs::OpenOptions;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::entry::{Entry, EntryCodec, EntryRegistry};
use crate::error::{Result, WalError};
use crate::frame::{payload_crc, FrameHeader};
use crate::meta::{self, MetaConfig, MetaIndex, NO_COMMIT};
use crate::segment::{self, SegmentReader, SegmentWriter};

const DEFAULT_MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Configuration for the log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segments and the meta index.
    pub dir: PathBuf,
    /// Segment size at which the next write starts a new segment
    /// (default: 10 MiB). A segment may exceed this by at most one record.
    pub max_segment_size: u64,
    /// Minimum committed-and-compactable entries before `compact`/`archive`
    /// do any work (default: 1000).
    pub min_entries_for_compaction: u32,
    /// Delay before a scheduled fsync runs, letting concurrent writers pile
    /// onto the same fence (default: zero).
    pub sync_delay: Duration,
    /// Meta index buffering behavior.
    pub meta: MetaConfig,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            min_entries_for_compaction: 1000,
            sync_delay: Duration::ZERO,
            meta: MetaConfig::default(),
        }
    }
}

impl WalConfig {
    fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(WalError::InvalidConfig(
                "max_segment_size must be greater than 0".to_string(),
            ));
        }
        // Index slots store byte offsets as u32.
        if self.max_segment_size > u64::from(u32::MAX) / 2 {
            return Err(WalError::InvalidConfig(
                "max_segment_size must stay below 2 GiB so offsets fit an index slot".to_string(),
            ));
        }
        if self.meta.buffering_enabled {
            if self.meta.max_buffer_size == 0 {
                return Err(WalError::InvalidConfig(
                    "meta.max_buffer_size must be greater than 0".to_string(),
                ));
            }
            if self.meta.auto_sync_interval.is_zero() {
                return Err(WalError::InvalidConfig(
                    "meta.auto_sync_interval cannot be zero - disable buffering instead"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

struct WalState {
    writer: Option<SegmentWriter>,
    current_segment_id: u32,
    /// One sync driver at a time; later writers piggy-back on its fence.
    sync_ongoing: bool,
    /// Durability waiters resolved by the next completed fsync.
    waiters: Vec<oneshot::Sender<std::result::Result<(), String>>>,
}

/// A durable, typed, segmented write-ahead log.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use kelpie_wal::{BytesEntry, EntryRegistry, Wal, WalConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut registry = EntryRegistry::new();
///     registry.register(1, || Box::new(BytesEntry::empty(1)));
///
///     let wal = Wal::open(WalConfig::default(), Arc::new(registry)).await?;
///
///     // Durable once the call returns.
///     let index = wal.write(&BytesEntry::new(1, b"payload".as_slice())).await?;
///
///     // Mark it applied downstream.
///     wal.commit(index).await?;
///     wal.close().await?;
///     Ok(())
/// }
/// ```
pub struct Wal {
    config: WalConfig,
    registry: Arc<EntryRegistry>,
    meter: Arc<dyn Meter>,
    meta: MetaIndex,
    state: Arc<Mutex<WalState>>,
    closed: AtomicBool,
}

impl Wal {
    /// Opens a log directory, creating `index.META` on first use.
    ///
    /// Opening an already-initialized directory is not an error: the
    /// persisted head, commit, base and segment pointers are loaded as-is.
    pub async fn open(config: WalConfig, registry: Arc<EntryRegistry>) -> Result<Self> {
        Self::open_with_meter(config, registry, Arc::new(NoopMeter)).await
    }

    /// Opens a log with a custom observability meter.
    pub async fn open_with_meter(
        config: WalConfig,
        registry: Arc<EntryRegistry>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;

        let meta = MetaIndex::open(&config.dir, config.meta.clone(), meter.clone()).await?;
        let ids = segment::list_segment_ids(&config.dir).await?;

        let (writer, current_segment_id) = if ids.last().is_some() {
            let current =
                reconcile_tail(&config.dir, &meta, &registry, &ids, meter.as_ref()).await?;
            (Some(SegmentWriter::open(&config.dir, current).await?), current)
        } else {
            (None, meta.snapshot().await.current_segment)
        };

        let header = meta.snapshot().await;
        info!(
            dir = %config.dir.display(),
            head = header.head,
            commit = header.commit,
            base = header.base,
            segment = current_segment_id,
            "write-ahead log opened"
        );

        Ok(Self {
            config,
            registry,
            meter,
            meta,
            state: Arc::new(Mutex::new(WalState {
                writer,
                current_segment_id,
                sync_ongoing: false,
                waiters: Vec::new(),
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends one record and waits for it to become durable.
    ///
    /// Returns the assigned logical index. Indices are assigned in lock
    /// order and appear on disk in that order; the call resolves only after
    /// an fsync covering the record's bytes has completed.
    pub async fn write(&self, entry: &dyn EntryCodec) -> Result<u32> {
        let payload = entry.encode();
        let crc = payload_crc(&payload);
        let type_tag = entry.type_tag();

        let (index, rx) = {
            let mut state = self.state.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(WalError::Closed);
            }

            let index = self
                .append_locked(&mut state, type_tag, crc, &payload)
                .await?;

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            self.schedule_sync(&mut state);
            (index, rx)
        };

        await_durability(rx, index).await
    }

    /// Appends several records under one lock acquisition and one
    /// durability fence. Returns the assigned indices, in order.
    pub async fn write_batch(&self, entries: &[&dyn EntryCodec]) -> Result<Vec<u32>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let frames: Vec<(u8, Bytes, u32)> = entries
            .iter()
            .map(|entry| {
                let payload = entry.encode();
                let crc = payload_crc(&payload);
                (entry.type_tag(), payload, crc)
            })
            .collect();

        let (indices, rx) = {
            let mut state = self.state.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(WalError::Closed);
            }

            let mut indices = Vec::with_capacity(frames.len());
            for (type_tag, payload, crc) in &frames {
                let index = self
                    .append_locked(&mut state, *type_tag, *crc, payload)
                    .await?;
                indices.push(index);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            self.schedule_sync(&mut state);
            (indices, rx)
        };

        match rx.await {
            Ok(Ok(())) => Ok(indices),
            Ok(Err(msg)) => Err(WalError::SyncFailed(msg)),
            Err(_) => Err(WalError::Closed),
        }
    }

    /// Marks `index` as committed. Idempotent at or below the current
    /// commit pointer; skipping ahead is out of order.
    pub async fn commit(&self, index: u32) -> Result<u32> {
        self.ensure_open()?;
        self.meta.commit(index).await
    }

    /// Commits every index from the current pointer up to and including
    /// `index`.
    pub async fn commit_up_to(&self, index: u32) -> Result<u32> {
        self.ensure_open()?;
        let commit = self.meta.commit_index().await;
        if i64::from(index) <= commit {
            return Err(WalError::AlreadyCommitted(index));
        }
        let mut last = 0;
        for i in ((commit + 1) as u32)..=index {
            last = self.meta.commit(i).await?;
        }
        Ok(last)
    }

    /// Replays the uncommitted tail, dropping all of it. Equivalent to
    /// [`recover_with`](Self::recover_with) with a handler that rejects
    /// every entry.
    pub async fn recover(&self) -> Result<()> {
        self.recover_with(|_, _| false).await
    }

    /// Replays the uncommitted tail `[commit + 1, head)` through `handler`.
    ///
    /// Each accepted entry is committed; the first rejected entry truncates
    /// the log at its index and ends recovery. Must not run concurrently
    /// with `write`.
    pub async fn recover_with<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(u32, &Entry) -> bool,
    {
        self.ensure_open()?;
        let header = self.meta.snapshot().await;
        if header.commit + 1 >= i64::from(header.head) {
            return Ok(());
        }

        let start = (header.commit + 1) as u32;
        debug!(from = start, head = header.head, "recovering uncommitted tail");
        for index in start..header.head {
            let entry = self.get_entry(index).await?;
            if handler(index, &entry) {
                self.meta.commit(index).await?;
            } else {
                self.truncate(index).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Random read of one record: CRC-validated and decoded.
    ///
    /// Opens its own read handle and touches only persisted state, so it
    /// runs without the write lock.
    pub async fn get_entry(&self, index: u32) -> Result<Entry> {
        self.ensure_open()?;
        let (segment, offset) = self.meta.position(index).await?;
        let mut reader =
            SegmentReader::open(&self.config.dir, segment, Arc::clone(&self.registry)).await?;
        reader.read_offset(u64::from(offset)).await
    }

    /// Drops `[from, head)` from the log: rewinds the meta index, cuts the
    /// owning segment at the record's offset, and deletes newer segments.
    pub async fn truncate(&self, from: u32) -> Result<()> {
        self.ensure_open()?;
        let (segment, offset) = self.meta.position(from).await?;
        self.meta.truncate(from).await?;

        let mut state = self.state.lock().await;
        if segment == state.current_segment_id {
            match state.writer.as_mut() {
                Some(writer) => writer.truncate(u64::from(offset)).await?,
                None => {
                    let file = OpenOptions::new()
                        .write(true)
                        .open(segment::segment_path(&self.config.dir, segment))
                        .await?;
                    file.set_len(u64::from(offset)).await?;
                    file.sync_all().await?;
                }
            }
        } else {
            if let Some(old) = state.writer.take() {
                old.close().await?;
            }
            for id in (segment + 1)..=state.current_segment_id {
                tokio::fs::remove_file(segment::segment_path(&self.config.dir, id)).await?;
                self.meter.emit(WalEvent::SegmentDeleted { segment: id });
            }
            state.current_segment_id = segment;

            let mut writer = SegmentWriter::open(&self.config.dir, segment).await?;
            writer.truncate(u64::from(offset)).await?;
            state.writer = Some(writer);
        }

        info!(head = from, "log truncated");
        Ok(())
    }

    /// Drops the fully-committed prefix: rebases the meta index and deletes
    /// dead segments. Returns `false` (leaving the directory untouched)
    /// when there is nothing worth compacting.
    pub async fn compact(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed);
        }

        let range = match self.compaction_range().await? {
            Some(range) => range,
            None => return Ok(false),
        };
        let (base_segment, commit_segment) = range;

        if let Some(writer) = state.writer.as_mut() {
            writer.sync().await?;
        }
        self.meta.compact().await?;

        for id in base_segment..commit_segment {
            tokio::fs::remove_file(segment::segment_path(&self.config.dir, id)).await?;
            self.meter.emit(WalEvent::SegmentDeleted { segment: id });
        }

        info!(
            first_live_segment = commit_segment,
            "compacted committed prefix"
        );
        Ok(true)
    }

    /// Like [`compact`](Self::compact), but the dead segments and a
    /// self-consistent copy of their index move into `archive_dir` instead
    /// of being deleted. Falls back to copy-then-unlink when the archive
    /// lives on another filesystem.
    pub async fn archive(&self, archive_dir: &Path) -> Result<bool> {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed);
        }

        let range = match self.compaction_range().await? {
            Some(range) => range,
            None => return Ok(false),
        };
        let (base_segment, commit_segment) = range;

        if let Some(writer) = state.writer.as_mut() {
            writer.sync().await?;
        }
        self.meta.archive(archive_dir).await?;

        for id in base_segment..commit_segment {
            let from = segment::segment_path(&self.config.dir, id);
            let to = segment::segment_path(archive_dir, id);
            meta::rename_or_copy(&from, &to).await?;
            self.meter.emit(WalEvent::SegmentArchived { segment: id });
        }

        info!(dir = %archive_dir.display(), "archived committed prefix");
        Ok(true)
    }

    /// Syncs and releases both files. Idempotent; all later writes fail
    /// with [`WalError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let writer = state.writer.take();
        let waiters = std::mem::take(&mut state.waiters);
        drop(state);

        let result = match writer {
            Some(writer) => writer.close().await,
            None => Ok(()),
        };
        match &result {
            Ok(()) => {
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for tx in waiters {
                    let _ = tx.send(Err(msg.clone()));
                }
            }
        }
        result?;

        self.meta.close().await?;
        info!("write-ahead log closed");
        Ok(())
    }

    /// ID of the segment currently receiving appends.
    pub async fn current_segment_id(&self) -> u32 {
        self.state.lock().await.current_segment_id
    }

    /// The last assigned logical index, if any record was ever written.
    pub async fn last_index(&self) -> Option<u32> {
        self.meta.head().await.checked_sub(1)
    }

    /// The index the next write will be assigned.
    pub async fn next_index(&self) -> u32 {
        self.meta.head().await
    }

    /// The greatest committed index, if any.
    pub async fn commit_index(&self) -> Option<u32> {
        let commit = self.meta.commit_index().await;
        u32::try_from(commit).ok()
    }

    pub async fn is_committed(&self, index: u32) -> bool {
        i64::from(index) <= self.meta.commit_index().await
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    /// Appends one frame under the write lock: roll if due, write the
    /// frame, record its location in the meta index.
    async fn append_locked(
        &self,
        state: &mut WalState,
        type_tag: u8,
        crc: u32,
        payload: &[u8],
    ) -> Result<u32> {
        let mut writer = self.take_writer(state).await?;
        let index = self.meta.head().await;
        let header = FrameHeader {
            index,
            type_tag,
            crc,
        };
        let appended = writer.append(header, payload).await;
        state.writer = Some(writer);
        let offset = appended?;

        self.meta
            .append(state.current_segment_id, offset as u32)
            .await?;
        Ok(index)
    }

    /// Hands out the active segment writer, rolling to a new segment first
    /// when the current one reached its size limit.
    async fn take_writer(&self, state: &mut WalState) -> Result<SegmentWriter> {
        match state.writer.take() {
            Some(writer) if writer.size() < self.config.max_segment_size => Ok(writer),
            Some(full) => {
                let (old_id, bytes) = (full.id(), full.size());
                full.close().await?;
                state.current_segment_id += 1;
                self.meter.emit(WalEvent::SegmentRoll {
                    segment: old_id,
                    bytes,
                });
                debug!(segment = state.current_segment_id, "rolled to a new segment");
                SegmentWriter::open(&self.config.dir, state.current_segment_id).await
            }
            None => SegmentWriter::open(&self.config.dir, state.current_segment_id).await,
        }
    }

    /// Triggers the sync driver unless one is already pending. The driver
    /// reacquires the write lock, fsyncs the active segment, and resolves
    /// every waiter registered before it got the lock — all of whose bytes
    /// the fsync covered. Waiters arriving after the drain observe
    /// `sync_ongoing == false` and schedule a fresh driver.
    fn schedule_sync(&self, state: &mut WalState) {
        if state.sync_ongoing {
            return;
        }
        state.sync_ongoing = true;

        let shared = Arc::clone(&self.state);
        let meter = Arc::clone(&self.meter);
        let delay = self.config.sync_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = shared.lock().await;
            let started = std::time::Instant::now();
            let result = match state.writer.as_mut() {
                Some(writer) => writer.sync().await,
                None => Ok(()),
            };
            if result.is_ok() {
                if let Some(writer) = state.writer.as_ref() {
                    meter.emit(WalEvent::Fsync {
                        segment: writer.id(),
                        micros: started.elapsed().as_micros() as u64,
                    });
                }
            }
            let waiters = std::mem::take(&mut state.waiters);
            state.sync_ongoing = false;
            drop(state);

            match result {
                Ok(()) => {
                    for tx in waiters {
                        let _ = tx.send(Ok(()));
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!(error = %msg, "segment fsync failed");
                    for tx in waiters {
                        let _ = tx.send(Err(msg.clone()));
                    }
                }
            }
        });
    }

    /// Preconditions shared by `compact` and `archive`: something is
    /// committed, something stays live, the dead prefix is big enough, and
    /// it spans at least one whole segment that isn't segment 0.
    async fn compaction_range(&self) -> Result<Option<(u32, u32)>> {
        let header = self.meta.snapshot().await;
        if header.commit == NO_COMMIT || header.commit + 1 == i64::from(header.head) {
            return Ok(None);
        }
        if header.commit - i64::from(header.base)
            < i64::from(self.config.min_entries_for_compaction)
        {
            return Ok(None);
        }

        let (commit_segment, _) = self.meta.position(header.commit as u32).await?;
        let (base_segment, _) = self.meta.position(header.base).await?;
        if commit_segment == base_segment || commit_segment == 0 {
            return Ok(None);
        }
        Ok(Some((base_segment, commit_segment)))
    }
}

async fn await_durability(
    rx: oneshot::Receiver<std::result::Result<(), String>>,
    index: u32,
) -> Result<u32> {
    match rx.await {
        Ok(Ok(())) => Ok(index),
        Ok(Err(msg)) => Err(WalError::SyncFailed(msg)),
        Err(_) => Err(WalError::Closed),
    }
}

/// Reconciles the newest segment with the meta index after an unclean
/// shutdown.
///
/// Orphan bytes past the last indexed frame (a torn append, or a buffered
/// tail that never hit the disk) are cut off; index entries whose frames
/// never became durable are rewound; segments rolled after the last indexed
/// record are removed. Returns the segment the writer should resume in.
async fn reconcile_tail(
    dir: &Path,
    meta: &MetaIndex,
    registry: &Arc<EntryRegistry>,
    ids: &[u32],
    meter: &dyn Meter,
) -> Result<u32> {
    let header = meta.snapshot().await;
    let highest_on_disk = ids.last().copied().unwrap_or(0);
    if header.head == header.base {
        // Nothing indexed: any stray bytes are unaddressable and harmless.
        return Ok(highest_on_disk.min(header.current_segment));
    }

    let (last_segment, _) = meta.position(header.head - 1).await?;

    // Segments newer than the one holding the last indexed record were
    // created by a roll whose first record never reached the index.
    for &id in ids.iter().filter(|&&id| id > last_segment) {
        warn!(segment = id, "removing unindexed segment left by a torn write");
        tokio::fs::remove_file(segment::segment_path(dir, id)).await?;
        meter.emit(WalEvent::SegmentDeleted { segment: id });
    }

    // Walk back from the newest indexed record to the last one whose frame
    // is intact. Older segments were fsynced when they rolled, so only this
    // segment can be torn.
    let mut reader = SegmentReader::open(dir, last_segment, Arc::clone(registry)).await?;
    let mut survivor: Option<(u32, u64)> = None;
    let mut index = header.head - 1;
    let first_in_segment = loop {
        let (seg, offset) = meta.position(index).await?;
        if seg != last_segment {
            break index + 1;
        }
        let intact = match reader.read_offset(u64::from(offset)).await {
            Ok(entry) => entry.index == index,
            Err(WalError::UnexpectedEof)
            | Err(WalError::CorruptEntry { .. })
            | Err(WalError::Incomplete) => false,
            Err(e) => return Err(e),
        };
        if intact {
            survivor = Some((index, reader.offset()));
            break index;
        }
        if index == header.base {
            break index;
        }
        index -= 1;
    };
    drop(reader);

    let path = segment::segment_path(dir, last_segment);
    let file_len = tokio::fs::metadata(&path).await?.len();
    let (rewind_to, keep_bytes) = match survivor {
        Some((index, end)) => (index + 1, end),
        None => (first_in_segment, 0),
    };

    if rewind_to < header.head {
        warn!(
            from = rewind_to,
            head = header.head,
            "rewinding index entries with no durable segment bytes"
        );
        meta.truncate(rewind_to).await?;
    }
    if file_len > keep_bytes {
        let file = OpenOptions::new().write(true).open(&path).await?;
        file.set_len(keep_bytes).await?;
        file.sync_all().await?;
        meter.emit(WalEvent::TailTrimmed {
            segment: last_segment,
            bytes: file_len - keep_bytes,
        });
        warn!(
            segment = last_segment,
            bytes = file_len - keep_bytes,
            "trimmed orphan bytes past the last durable record"
        );
    }

    Ok(last_segment)
}
