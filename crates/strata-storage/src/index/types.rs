//! Key/value codec traits and common types for the B+tree index.

use std::cmp::Ordering;
use std::sync::Arc;
use strata_common::page::PageId;

/// A fixed-width index key.
///
/// Keys are stored inline in index pages, so the encoding must occupy
/// exactly `ENCODED_LEN` bytes. Ordering is supplied externally by a
/// [`KeyComparator`], not by the encoding.
pub trait IndexKey: Copy + Send + Sync + std::fmt::Debug + 'static {
    /// Encoded size in bytes.
    const ENCODED_LEN: usize;

    /// Writes the key into `buf` (exactly `ENCODED_LEN` bytes).
    fn encode_into(&self, buf: &mut [u8]);

    /// Reads a key back from `buf`.
    fn decode_from(buf: &[u8]) -> Self;
}

/// A fixed-width index value (typically a record identifier).
pub trait IndexValue: Copy + Send + Sync + std::fmt::Debug + 'static {
    /// Encoded size in bytes.
    const ENCODED_LEN: usize;

    /// Writes the value into `buf` (exactly `ENCODED_LEN` bytes).
    fn encode_into(&self, buf: &mut [u8]);

    /// Reads a value back from `buf`.
    fn decode_from(buf: &[u8]) -> Self;
}

/// Externally supplied strict total order on keys.
pub type KeyComparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// Comparator using the key type's own `Ord`.
pub fn natural_order<K: IndexKey + Ord>() -> KeyComparator<K> {
    Arc::new(|a: &K, b: &K| a.cmp(b))
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        i64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

impl IndexKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

impl IndexValue for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

/// Identifier of a record in heap storage: page id plus slot number.
///
/// This is the typical payload an index maps keys to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Page holding the record.
    pub page_id: PageId,
    /// Slot within the page.
    pub slot: u16,
}

impl RecordId {
    /// Creates a new record identifier.
    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.page_id, self.slot)
    }
}

impl IndexValue for RecordId {
    const ENCODED_LEN: usize = 10;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.page_id.as_u64().to_le_bytes());
        buf[8..10].copy_from_slice(&self.slot.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let page_id = PageId::from_u64(u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]));
        let slot = u16::from_le_bytes([buf[8], buf[9]]);
        Self { page_id, slot }
    }
}
