//! String interning.
//!
//! Every string in the system (literals, global names, host strings,
//! results of the `str` native) passes through the interner, so equal
//! strings always share one heap slot and equality reduces to handle
//! identity. The table is keyed by (hash, length, bytes): buckets hang off
//! the 32-bit FNV-1a hash and collisions resolve by byte comparison.
//!
//! The table owns one retained reference per distinct string, released
//! only when the interpreter is torn down.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::heap::{Heap, HeapData, HeapId, StrObj};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over a byte slice.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Default)]
pub(crate) struct Interner {
    buckets: AHashMap<u32, SmallVec<[HeapId; 1]>>,
    count: usize,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical handle for `text`, retained for the caller.
    ///
    /// A hit shares the existing slot; a miss allocates one. Either way
    /// the caller owns one reference on top of the table's own.
    pub fn intern(&mut self, heap: &mut Heap, text: &str) -> HeapId {
        let hash = fnv1a(text.as_bytes());
        if let Some(ids) = self.buckets.get(&hash) {
            for &id in ids {
                if heap.str_text(id) == text {
                    heap.inc_ref(id);
                    return id;
                }
            }
        }
        let id = heap.allocate(HeapData::Str(StrObj {
            text: text.into(),
            hash,
        }));
        // One reference for the table, one for the caller.
        heap.inc_ref(id);
        self.buckets.entry(hash).or_default().push(id);
        self.count += 1;
        id
    }

    /// Number of distinct interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }
}
