//! Immutable, shareable checkpoint content.
//!
//! A blob is a snapshot of serialized constant-pool sections cut out of a
//! checkpoint writer. Blobs link into chains so composite metadata (say, a
//! type set plus the symbols it references) can be cached once per epoch and
//! referenced from many checkpoint events without recopying.
//!
//! Whether a blob has been emitted is tracked *outside* the blob, in a
//! per-pass [`WrittenSet`]: the chain itself stays immutable, and
//! "exclusive" emission is a property of the pass, not the data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashSet;

static NEXT_BLOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct CheckpointBlob {
    id: u64,
    bytes: Box<[u8]>,
    pool_count: u32,
    next: Option<Arc<CheckpointBlob>>,
}

pub type BlobChain = Arc<CheckpointBlob>;

impl CheckpointBlob {
    /// Wrap serialized pool sections. `pool_count` is the number of complete
    /// sections in `bytes`.
    pub fn new(bytes: Vec<u8>, pool_count: u32) -> BlobChain {
        Arc::new(Self {
            id: NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed),
            bytes: bytes.into_boxed_slice(),
            pool_count,
            next: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pool_count(&self) -> u32 {
        self.pool_count
    }

    pub fn next(&self) -> Option<&BlobChain> {
        self.next.as_ref()
    }

    /// New blob sharing this one's content, linked in front of `next`.
    pub fn linked(self: &BlobChain, next: BlobChain) -> BlobChain {
        Arc::new(Self {
            id: self.id,
            bytes: self.bytes.clone(),
            pool_count: self.pool_count,
            next: Some(next),
        })
    }

    /// Visit every blob in the chain, front to back.
    pub fn for_each(self: &BlobChain, mut f: impl FnMut(&CheckpointBlob)) {
        let mut cursor = Some(self);
        while let Some(blob) = cursor {
            f(blob);
            cursor = blob.next();
        }
    }
}

/// Blob ids already emitted during one write pass.
#[derive(Debug, Default)]
pub struct WrittenSet {
    emitted: FxHashSet<u64>,
}

impl WrittenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as emitted; returns true the first time.
    pub fn first_emission(&mut self, id: u64) -> bool {
        self.emitted.insert(id)
    }
}
