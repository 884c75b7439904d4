//! Entry codecs and the tag registry.
//!
//! Payloads are opaque to the log: the framing layer stores a type tag and
//! raw bytes, and a client-registered codec gives those bytes meaning. A
//! codec must be self-delimiting — given bytes starting at its payload it
//! can tell where the payload ends without help from the frame.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WalError};

/// A typed payload codec.
///
/// One instance is allocated per encode or decode; implementations start
/// empty and are filled by [`EntryCodec::decode`]. The `read` helper is the
/// scanning fast path: it reports the payload length without decoding.
pub trait EntryCodec: fmt::Debug + Send + Sync {
    /// The 8-bit tag this codec is registered under.
    fn type_tag(&self) -> u8;

    /// Serializes the payload. The result must be parseable by `read` and
    /// `decode`.
    fn encode(&self) -> Bytes;

    /// Given bytes starting at the payload, returns the exact number of
    /// bytes the payload occupies. Returns [`WalError::Incomplete`] when
    /// `buf` is too short to determine the length; the caller refills its
    /// buffer and retries.
    fn read(&self, buf: &[u8]) -> Result<usize>;

    /// Deserializes `payload` into this instance.
    fn decode(&mut self, payload: &[u8]) -> Result<()>;

    /// Downcast support so hosts can recover their concrete payload type.
    fn as_any(&self) -> &dyn Any;
}

type CodecFactory = dyn Fn() -> Box<dyn EntryCodec> + Send + Sync;

/// Maps type tags to codec factories.
///
/// Hosts register every payload type before opening a log and hand the
/// registry to [`Wal::open`](crate::Wal::open) by `Arc` — registries are
/// plain values, not process-wide state, so independent logs can carry
/// independent codec tables.
#[derive(Default)]
pub struct EntryRegistry {
    factories: HashMap<u8, Box<CodecFactory>>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory producing empty codec instances for `tag`.
    /// Re-registering a tag replaces the previous factory.
    pub fn register<F>(&mut self, tag: u8, factory: F)
    where
        F: Fn() -> Box<dyn EntryCodec> + Send + Sync + 'static,
    {
        self.factories.insert(tag, Box::new(factory));
    }

    /// Allocates a fresh codec for `tag`.
    pub fn create(&self, tag: u8) -> Result<Box<dyn EntryCodec>> {
        match self.factories.get(&tag) {
            Some(factory) => Ok(factory()),
            None => Err(WalError::UnknownType(tag)),
        }
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.factories.contains_key(&tag)
    }
}

impl fmt::Debug for EntryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<u8> = self.factories.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("EntryRegistry").field("tags", &tags).finish()
    }
}

/// A shared registry handle, as the coordinator consumes it.
pub type SharedRegistry = Arc<EntryRegistry>;

/// A decoded record read back from the log.
#[derive(Debug)]
pub struct Entry {
    /// The logical index the log assigned at append time.
    pub index: u32,
    /// The frame's type tag.
    pub type_tag: u8,
    /// The decoded payload.
    pub payload: Box<dyn EntryCodec>,
}

impl Entry {
    /// Convenience downcast to a concrete codec type.
    pub fn payload_as<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }
}

/// The built-in raw-bytes codec: a 4-byte big-endian length prefix followed
/// by the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesEntry {
    tag: u8,
    data: Bytes,
}

impl BytesEntry {
    pub fn new(tag: u8, data: impl Into<Bytes>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }

    /// An empty instance for registry factories.
    pub fn empty(tag: u8) -> Self {
        Self {
            tag,
            data: Bytes::new(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl EntryCodec for BytesEntry {
    fn type_tag(&self) -> u8 {
        self.tag
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    fn read(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() < 4 {
            return Err(WalError::Incomplete);
        }
        let mut prefix = &buf[..4];
        let len = prefix.get_u32() as usize;
        Ok(4 + len)
    }

    fn decode(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 4 {
            return Err(WalError::Incomplete);
        }
        let mut prefix = &payload[..4];
        let len = prefix.get_u32() as usize;
        if payload.len() < 4 + len {
            return Err(WalError::Incomplete);
        }
        self.data = Bytes::copy_from_slice(&payload[4..4 + len]);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_entry_roundtrip() {
        let entry = BytesEntry::new(1, b"test".as_slice());
        let encoded = entry.encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 4, b't', b'e', b's', b't']);

        let mut decoded = BytesEntry::empty(1);
        decoded.decode(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_bytes_entry_read_reports_length() {
        let entry = BytesEntry::new(7, b"hello world".as_slice());
        let encoded = entry.encode();
        assert_eq!(entry.read(&encoded).unwrap(), encoded.len());

        // A trailing frame must not be consumed.
        let mut with_tail = encoded.to_vec();
        with_tail.extend_from_slice(b"next frame bytes");
        assert_eq!(entry.read(&with_tail).unwrap(), encoded.len());
    }

    #[test]
    fn test_bytes_entry_read_incomplete() {
        let probe = BytesEntry::empty(1);
        assert!(matches!(probe.read(&[0, 0]), Err(WalError::Incomplete)));
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = EntryRegistry::new();
        assert!(matches!(
            registry.create(9),
            Err(WalError::UnknownType(9))
        ));
    }

    #[test]
    fn test_registry_creates_fresh_instances() {
        let mut registry = EntryRegistry::new();
        registry.register(1, || Box::new(BytesEntry::empty(1)));
        assert!(registry.contains(1));

        let codec = registry.create(1).unwrap();
        assert_eq!(codec.type_tag(), 1);
        let raw = codec.as_any().downcast_ref::<BytesEntry>().unwrap();
        assert!(raw.data().is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let entry = BytesEntry::new(3, Bytes::new());
        let encoded = entry.encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 0]);

        let mut decoded = BytesEntry::empty(3);
        decoded.decode(&encoded).unwrap();
        assert!(decoded.data().is_empty());
    }
}
