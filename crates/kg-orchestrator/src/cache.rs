//! Stage 6: cache warming. The distributed cache product is out of
//! scope, so this is a trait with a no-op default — real but pluggable.

use async_trait::async_trait;

/// A query worth pre-warming once a file has been freshly indexed, e.g.
/// "files in this project" or "entities related to this file".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmQuery {
    /// Opaque cache key, product-specific.
    pub key: String,
}

/// Cache-warming hook run as the final stage of `enrich_file`.
#[async_trait]
pub trait CacheWarmer: Send + Sync {
    /// Warm the cache entries implied by `entity_id` having just been
    /// indexed. Failures here are logged and otherwise ignored — stage 6
    /// never fails the enrichment outcome.
    async fn warm(&self, entity_id: &str, queries: &[WarmQuery]);
}

/// Default [`CacheWarmer`] that does nothing, used when no cache product
/// is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheWarmer;

#[async_trait]
impl CacheWarmer for NoopCacheWarmer {
    async fn warm(&self, _entity_id: &str, _queries: &[WarmQuery]) {}
}

/// Pre-registered queries to warm for a freshly indexed file entity: the
/// file's own lookup plus its owning project's listing.
pub fn default_queries(project_name: &str, entity_id: &str) -> Vec<WarmQuery> {
    vec![
        WarmQuery {
            key: format!("project:{project_name}:files"),
        },
        WarmQuery {
            key: format!("entity:{entity_id}:relationships"),
        },
    ]
}
