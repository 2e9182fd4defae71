//! Per-institution gallery cache.
//!
//! Frame matching happens on every submitted frame; hitting SQLite for
//! the full embedding set each time would dominate the hot path. The
//! cache keeps one immutable snapshot per institution and rebuilds it
//! lazily after enrollment changes invalidate it. Reads between an
//! enrollment change and its invalidation may be stale; per-request
//! freshness after invalidation is the only guarantee.

use crate::{Store, StoreError};
use rollcall_core::GalleryEntry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct GalleryCache {
    store: Store,
    inner: RwLock<HashMap<Uuid, Arc<Vec<GalleryEntry>>>>,
}

impl GalleryCache {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Gallery snapshot for one institution, rebuilt from the store on a
    /// cache miss. Never mixes institutions.
    pub async fn load(&self, institution_id: Uuid) -> Result<Arc<Vec<GalleryEntry>>, StoreError> {
        if let Some(gallery) = self.inner.read().await.get(&institution_id) {
            return Ok(gallery.clone());
        }

        let entries = self.store.gallery_entries(institution_id).await?;
        tracing::debug!(
            institution = %institution_id,
            entries = entries.len(),
            "gallery rebuilt"
        );
        let gallery = Arc::new(entries);

        let mut inner = self.inner.write().await;
        // A concurrent load may have rebuilt first; either snapshot is fine.
        Ok(inner.entry(institution_id).or_insert(gallery).clone())
    }

    /// Drop the cached snapshot after an enrollment change.
    pub async fn invalidate(&self, institution_id: Uuid) {
        self.inner.write().await.remove(&institution_id);
        tracing::debug!(institution = %institution_id, "gallery invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Embedding;

    #[tokio::test]
    async fn test_load_caches_and_invalidate_refreshes() {
        let store = Store::open_in_memory().await.unwrap();
        let institution = store.create_institution("Test High").await.unwrap();
        let student = store.create_student(institution, "Ada Lovelace").await.unwrap();
        store
            .add_reference_embedding(student, &Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap();

        let cache = GalleryCache::new(store.clone());
        let first = cache.load(institution).await.unwrap();
        assert_eq!(first.len(), 1);

        // New enrollment is invisible until invalidated.
        let other = store.create_student(institution, "Grace Hopper").await.unwrap();
        store
            .add_reference_embedding(other, &Embedding::new(vec![0.0, 1.0]))
            .await
            .unwrap();
        assert_eq!(cache.load(institution).await.unwrap().len(), 1);

        cache.invalidate(institution).await;
        assert_eq!(cache.load(institution).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_institution_loads_empty() {
        let store = Store::open_in_memory().await.unwrap();
        let cache = GalleryCache::new(store);
        let gallery = cache.load(Uuid::new_v4()).await.unwrap();
        assert!(gallery.is_empty());
    }
}
