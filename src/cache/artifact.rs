use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::CacheKey;

/// Resized images kept in memory, least recently used evicted first.
///
/// Entries are shared as `Arc<[u8]>` so serving a hit never copies the image.
#[derive(Clone)]
pub struct ArtifactCache {
    images: Arc<Mutex<LruCache<CacheKey, Arc<[u8]>>>>,
}

impl ArtifactCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            images: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        self.images.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.images.lock().contains(key)
    }

    pub fn put(&self, key: CacheKey, data: Arc<[u8]>) {
        if let Some((evicted, _)) = self.images.lock().push(key.clone(), data) {
            if evicted != key {
                log::debug!("Evicted {} from artifact cache", evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.images.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
