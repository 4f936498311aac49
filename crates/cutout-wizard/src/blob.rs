//! In-memory object URLs for uploaded and processed images.

use std::collections::HashMap;
use std::sync::Arc;

const URL_PREFIX: &str = "blob:cutout/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
}

/// Mints `blob:cutout/<n>` handles. Handles are never reused, so a revoked URL
/// stays dead.
#[derive(Debug, Default)]
pub struct BlobStore {
    next_id: u64,
    blobs: HashMap<String, Blob>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, content_type: impl Into<String>, bytes: Arc<Vec<u8>>) -> String {
        self.next_id += 1;
        let url = format!("{URL_PREFIX}{}", self.next_id);
        self.blobs.insert(
            url.clone(),
            Blob {
                content_type: content_type.into(),
                bytes,
            },
        );
        url
    }

    pub fn resolve(&self, url: &str) -> Option<&Blob> {
        self.blobs.get(url)
    }

    pub fn revoke(&mut self, url: &str) -> bool {
        self.blobs.remove(url).is_some()
    }

    pub fn revoke_all(&mut self) {
        self.blobs.clear();
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoked_urls_stay_dead() {
        let mut store = BlobStore::new();
        let first = store.register("image/png", Arc::new(vec![1, 2, 3]));
        assert_eq!(first, "blob:cutout/1");
        assert_eq!(store.resolve(&first).map(|b| b.bytes.len()), Some(3));

        assert!(store.revoke(&first));
        assert!(!store.revoke(&first));
        assert!(store.resolve(&first).is_none());

        let second = store.register("image/jpeg", Arc::new(Vec::new()));
        assert_ne!(first, second);
        assert_eq!(store.len(), 1);
        store.revoke_all();
        assert!(store.is_empty());
    }
}
