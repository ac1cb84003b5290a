//! Content-addressed, refcounted message blob storage (C1).
//!
//! A single `BlobPool` is shared process-wide: every mailbox's
//! [`crate::mailbox::MessageRef`] points into it by [`ContentHash`] instead
//! of owning a copy of the body, so a message fanned out to many recipients
//! is stored exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use mail_types::error::Result;
use tracing::{debug, trace};

/// Hex-encoded SHA-256 digest over the canonical header subset and body, per
/// the algorithm in the module-level docs of [`compute_content_hash`].
pub type ContentHash = String;

/// An ordered, duplicate-preserving list of header fields, exactly as parsed
/// off the wire by the (out-of-scope) protocol front-end.
pub type HeaderList = Vec<(String, String)>;

/// The fixed header subset folded into a message's content hash, in this
/// order, first-occurrence-only if duplicated.
const HASHED_HEADERS: [&str; 5] = ["Message-ID", "Date", "From", "To", "Subject"];

/// A stored message body, deduplicated by content hash.
#[derive(Debug)]
pub struct Blob {
    pub content_hash: ContentHash,
    pub parsed_headers: HeaderList,
    pub raw_body: Vec<u8>,
    pub size_bytes: u64,
    pub internal_date: u64,
    ref_count: AtomicU64,
}

impl Blob {
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::SeqCst)
    }
}

/// The process-wide, content-addressed blob store.
pub struct BlobPool {
    blobs: DashMap<ContentHash, Arc<Blob>>,
    total_blob_bytes: AtomicU64,
}

impl Default for BlobPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobPool {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            total_blob_bytes: AtomicU64::new(0),
        }
    }

    pub fn total_blob_bytes(&self) -> u64 {
        self.total_blob_bytes.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Computes the canonical content hash, inserting the blob if its hash
    /// is new, otherwise bumping the existing blob's `ref_count` by
    /// `initial_refcount`. Only the thread that wins the insert race
    /// increments `total_blob_bytes`.
    ///
    /// `internal_date` is stamped on the `Blob` only the first time it is
    /// created — per spec.md §3, `internal_date` is "timestamp at first
    /// store", so a racing or later intern of the same content never
    /// overwrites it.
    pub fn intern(
        &self,
        parsed_headers: &HeaderList,
        raw_body: &[u8],
        initial_refcount: u64,
        internal_date: u64,
    ) -> Result<ContentHash> {
        let hash = compute_content_hash(parsed_headers, raw_body)?;

        match self.blobs.entry(hash.clone()) {
            Entry::Occupied(existing) => {
                existing.get().ref_count.fetch_add(initial_refcount, Ordering::SeqCst);
                trace!(%hash, add = initial_refcount, "blob interned (existing)");
            }
            Entry::Vacant(slot) => {
                let size_bytes = raw_body.len() as u64;
                let blob = Arc::new(Blob {
                    content_hash: hash.clone(),
                    parsed_headers: parsed_headers.clone(),
                    raw_body: raw_body.to_vec(),
                    size_bytes,
                    internal_date,
                    ref_count: AtomicU64::new(initial_refcount),
                });
                slot.insert(blob);
                self.total_blob_bytes.fetch_add(size_bytes, Ordering::SeqCst);
                debug!(%hash, size_bytes, "blob interned (new)");
            }
        }

        Ok(hash)
    }

    /// Adds `n` to the blob's `ref_count`. Undefined (no-op) if `hash` is
    /// unknown to the pool.
    pub fn acquire(&self, hash: &ContentHash, n: u64) {
        if let Some(blob) = self.blobs.get(hash) {
            blob.ref_count.fetch_add(n, Ordering::SeqCst);
        }
    }

    /// Decrements the blob's `ref_count`; removes it and reclaims
    /// `total_blob_bytes` once the count reaches zero. Returns `true` if the
    /// blob was removed by this call.
    pub fn release(&self, hash: &ContentHash) -> bool {
        let should_remove = match self.blobs.get(hash) {
            Some(blob) => blob.ref_count.fetch_sub(1, Ordering::SeqCst) <= 1,
            None => return false,
        };

        if should_remove {
            if let Some((_, blob)) = self.blobs.remove(hash) {
                self.total_blob_bytes.fetch_sub(blob.size_bytes, Ordering::SeqCst);
                debug!(%hash, "blob removed, refcount reached zero");
                return true;
            }
        }
        false
    }

    pub fn load(&self, hash: &ContentHash) -> Option<Arc<Blob>> {
        self.blobs.get(hash).map(|entry| entry.value().clone())
    }
}

/// Feeds a SHA-256 digest `key:value\n` for each of [`HASHED_HEADERS`] found
/// (first occurrence only, skipped if absent), then the raw body bytes, and
/// returns the hex digest.
pub fn compute_content_hash(parsed_headers: &HeaderList, raw_body: &[u8]) -> Result<ContentHash> {
    let mut canonical = Vec::new();

    for &name in HASHED_HEADERS.iter() {
        if let Some((_, value)) = parsed_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            canonical.extend_from_slice(name.as_bytes());
            canonical.push(b':');
            canonical.extend_from_slice(value.as_bytes());
            canonical.push(b'\n');
        }
    }
    canonical.extend_from_slice(raw_body);

    let digest = sodiumoxide::crypto::hash::sha256::hash(&canonical);
    Ok(hex::encode(digest.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn same_headers_and_body_hash_identically() {
        let h1 = headers(&[("From", "a@t"), ("Subject", "x")]);
        let h2 = headers(&[("From", "a@t"), ("Subject", "x"), ("X-Extra", "ignored")]);
        assert_eq!(
            compute_content_hash(&h1, b"hi").unwrap(),
            compute_content_hash(&h2, b"hi").unwrap()
        );
    }

    #[test]
    fn different_body_hashes_differently() {
        let h = headers(&[("From", "a@t")]);
        assert_ne!(
            compute_content_hash(&h, b"hi").unwrap(),
            compute_content_hash(&h, b"bye").unwrap()
        );
    }

    #[test]
    fn intern_dedups_and_sums_refcount() {
        let pool = BlobPool::new();
        let h = headers(&[("From", "a@t"), ("Subject", "x")]);
        let hash1 = pool.intern(&h, b"hi", 1, 0).unwrap();
        let hash2 = pool.intern(&h, b"hi", 2, 0).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(pool.load(&hash1).unwrap().ref_count(), 3);
        assert_eq!(pool.total_blob_bytes(), 2);
        assert_eq!(pool.blob_count(), 1);
    }

    #[test]
    fn intern_stamps_internal_date_only_on_first_store() {
        let pool = BlobPool::new();
        let h = headers(&[("From", "a@t")]);
        let hash1 = pool.intern(&h, b"hi", 1, 1000).unwrap();
        let hash2 = pool.intern(&h, b"hi", 1, 2000).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(pool.load(&hash1).unwrap().internal_date, 1000);
    }

    #[test]
    fn release_to_zero_removes_blob() {
        let pool = BlobPool::new();
        let h = headers(&[("From", "a@t")]);
        let hash = pool.intern(&h, b"hi", 2, 0).unwrap();
        assert!(!pool.release(&hash));
        assert!(pool.release(&hash));
        assert!(pool.load(&hash).is_none());
        assert_eq!(pool.total_blob_bytes(), 0);
    }
}
