//! Durable, typed, segmented write-ahead log.
//!
//! Implements an embeddable WAL with:
//! - Opaque typed payloads framed with per-record CRC-32 checksums
//! - A separate crash-safe meta index mapping logical indices to
//!   `(segment, offset)`, with head/commit/base pointers
//! - Coalesced fsync fences: every acknowledged append is durable
//! - Size-triggered segment rotation
//! - Recovery of the uncommitted tail, compaction and off-side archival of
//!   the committed prefix
//! - Observability via kelpie-observe
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kelpie_wal::{BytesEntry, EntryRegistry, Wal, WalConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = EntryRegistry::new();
//!     registry.register(1, || Box::new(BytesEntry::empty(1)));
//!
//!     let wal = Wal::open(WalConfig::default(), Arc::new(registry)).await?;
//!
//!     // Durable once the call returns.
//!     let index = wal.write(&BytesEntry::new(1, b"applied".as_slice())).await?;
//!
//!     // Acknowledge downstream application, then drop the dead prefix.
//!     wal.commit(index).await?;
//!     wal.compact().await?;
//!
//!     wal.close().await?;
//!     Ok(())
//! }
//! ```

mod buffer;
pub mod entry;
pub mod error;
pub mod frame;
mod meta;
pub mod segment;
pub mod wal;

pub use entry::{BytesEntry, Entry, EntryCodec, EntryRegistry};
pub use kelpie_observe::{Meter, NoopMeter, WalEvent};
pub use error::{Result, WalError};
pub use frame::{payload_crc, FrameHeader, FRAME_HEADER_SIZE};
pub use meta::MetaConfig;
pub use segment::{SegmentReader, SegmentWriter};
pub use wal::{Wal, WalConfig};
