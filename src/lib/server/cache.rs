use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::lib::backend::types::ImageCatalog;

/// The image catalog changes rarely and fetching it is slow, so GET
/// /images serves a cached copy for a TTL (one hour by default).
pub struct ImageCache {
    ttl: Duration,
    slot: Mutex<Option<CachedCatalog>>,
}

struct CachedCatalog {
    at: Instant,
    catalog: ImageCatalog,
}

impl ImageCache {
    pub fn new(ttl: Duration) -> Self {
        ImageCache {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn fresh(&self) -> Option<ImageCatalog> {
        let slot = self.slot.lock();
        let cached = slot.as_ref()?;
        if cached.at.elapsed() < self.ttl {
            Some(cached.catalog.clone())
        } else {
            None
        }
    }

    pub fn store(&self, catalog: ImageCatalog) {
        *self.slot.lock() = Some(CachedCatalog {
            at: Instant::now(),
            catalog,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ImageCatalog {
        let mut catalog = ImageCatalog::new();
        catalog.insert("debian".to_string(), vec!["13".to_string(), "12".to_string()]);
        catalog
    }

    #[test]
    fn serves_stored_catalog_within_ttl() {
        let cache = ImageCache::new(Duration::from_secs(3600));
        assert!(cache.fresh().is_none());

        cache.store(catalog());
        let cached = cache.fresh().unwrap();
        assert_eq!(cached["debian"], vec!["13", "12"]);
    }

    #[test]
    fn zero_ttl_is_always_stale() {
        let cache = ImageCache::new(Duration::ZERO);
        cache.store(catalog());
        assert!(cache.fresh().is_none());
    }
}
