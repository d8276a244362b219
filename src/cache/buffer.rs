//! Stream identities and cached buffer contents.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 16-byte identity of a cached stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId([u8; 16]);

impl StreamId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// A fresh random identity.
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<u128> for StreamId {
    fn from(value: u128) -> Self {
        Self(value.to_be_bytes())
    }
}

impl From<Uuid> for StreamId {
    fn from(value: Uuid) -> Self {
        Self(*value.as_bytes())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).simple())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({self})")
    }
}

/// Immutable, shareable contents of one cached byte range.
///
/// Cloning shares the underlying memory; the cache never mutates it.
pub trait BufferElement: Clone + Send + Sync + 'static {
    /// Number of bytes covered by this buffer.
    fn byte_len(&self) -> u64;
}

impl BufferElement for Bytes {
    fn byte_len(&self) -> u64 {
        self.len() as u64
    }
}

impl BufferElement for Arc<[u8]> {
    fn byte_len(&self) -> u64 {
        self.len() as u64
    }
}

impl BufferElement for Arc<Vec<u8>> {
    fn byte_len(&self) -> u64 {
        self.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_ordering_follows_integer_value() {
        let a = StreamId::from(1u128);
        let b = StreamId::from(256u128);
        assert!(a < b);
        assert_eq!(a.to_string(), "00000000000000000000000000000001");
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(StreamId::random(), StreamId::random());
    }

    #[test]
    fn test_buffer_lengths() {
        assert_eq!(Bytes::from_static(b"abc").byte_len(), 3);
        let shared: Arc<[u8]> = Arc::from(vec![0u8; 7]);
        assert_eq!(shared.byte_len(), 7);
        assert_eq!(Arc::new(vec![1u8; 2]).byte_len(), 2);
    }
}
