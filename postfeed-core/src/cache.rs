use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::FeedError;
use crate::post::{CachePage, PostSummary};
use crate::stream::{boxed, BatchStream};

/// Durable page store for the cache-then-fresh stream.
///
/// Keys are `(scope, page)`. The id index is maintained separately from page
/// contents so that ids which vanished server-side can be detected after a
/// complete refresh.
#[async_trait]
pub trait PageCache: Send + Sync {
    /// Returns `Ok(None)` for a missing page; errors are storage faults only.
    async fn get_page(&self, scope: &str, page: u32) -> Result<Option<CachePage>, FeedError>;

    /// Replaces `(scope, page.page)`. Last writer wins.
    async fn upsert_page(&self, scope: &str, page: CachePage) -> Result<(), FeedError>;

    /// Replays cached pages in ascending page order. Every call starts a new
    /// independent pass from the first cached page.
    fn read_all_pages<'a>(&'a self, scope: &'a str) -> BatchStream<'a>;

    async fn all_known_ids(&self, scope: &str) -> Result<HashSet<i64>, FeedError>;

    async fn upsert_index(&self, scope: &str, items: &[PostSummary]) -> Result<(), FeedError>;

    async fn remove_from_index(&self, scope: &str, ids: &[i64]) -> Result<(), FeedError>;

    /// Drops every cached page numbered above `last_page`.
    async fn prune_pages_after(&self, scope: &str, last_page: u32) -> Result<(), FeedError>;
}

#[derive(Debug, Default)]
struct ScopeEntry {
    pages: BTreeMap<u32, CachePage>,
    ids: HashSet<i64>,
}

/// Process-local [`PageCache`]; contents are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryPageCache {
    inner: Arc<RwLock<HashMap<String, ScopeEntry>>>,
}

impl MemoryPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn page_numbers(&self, scope: &str) -> Vec<u32> {
        let inner = self.inner.read().await;
        inner
            .get(scope)
            .map(|entry| entry.pages.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PageCache for MemoryPageCache {
    async fn get_page(&self, scope: &str, page: u32) -> Result<Option<CachePage>, FeedError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(scope)
            .and_then(|entry| entry.pages.get(&page))
            .cloned())
    }

    async fn upsert_page(&self, scope: &str, page: CachePage) -> Result<(), FeedError> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(scope.to_owned()).or_default();
        entry.pages.insert(page.page, page);
        Ok(())
    }

    fn read_all_pages<'a>(&'a self, scope: &'a str) -> BatchStream<'a> {
        boxed(try_stream! {
            let pages: Vec<Vec<PostSummary>> = {
                let inner = self.inner.read().await;
                inner
                    .get(scope)
                    .map(|entry| entry.pages.values().map(|p| p.items.clone()).collect())
                    .unwrap_or_default()
            };
            debug!(scope = %scope, pages = pages.len(), "replaying cached pages");
            for items in pages {
                yield items;
            }
        })
    }

    async fn all_known_ids(&self, scope: &str) -> Result<HashSet<i64>, FeedError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(scope)
            .map(|entry| entry.ids.clone())
            .unwrap_or_default())
    }

    async fn upsert_index(&self, scope: &str, items: &[PostSummary]) -> Result<(), FeedError> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(scope.to_owned()).or_default();
        entry.ids.extend(items.iter().map(|p| p.id));
        Ok(())
    }

    async fn remove_from_index(&self, scope: &str, ids: &[i64]) -> Result<(), FeedError> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(scope) {
            for id in ids {
                entry.ids.remove(id);
            }
        }
        Ok(())
    }

    async fn prune_pages_after(&self, scope: &str, last_page: u32) -> Result<(), FeedError> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(scope) {
            entry.pages.retain(|page, _| *page <= last_page);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::FetchedPage;
    use futures_util::TryStreamExt;

    fn post(id: i64) -> PostSummary {
        PostSummary {
            id,
            title: format!("post {id}"),
            status: "publish".into(),
            link: format!("https://example.test/?p={id}"),
            modified_gmt: "2024-10-21T07:28:00".into(),
        }
    }

    #[tokio::test]
    async fn replays_pages_in_ascending_order() {
        let cache = MemoryPageCache::new();
        for (page, id) in [(2u32, 20i64), (1, 10), (3, 30)] {
            let fetched = FetchedPage {
                items: vec![post(id)],
                ..Default::default()
            };
            cache
                .upsert_page("posts", fetched.into_cache_page(page))
                .await
                .unwrap();
        }

        let batches: Vec<Vec<PostSummary>> =
            cache.read_all_pages("posts").try_collect().await.unwrap();
        let ids: Vec<i64> = batches.iter().map(|b| b[0].id).collect();
        assert_eq!(ids, vec![10, 20, 30]);

        cache.prune_pages_after("posts", 1).await.unwrap();
        assert_eq!(cache.page_numbers("posts").await, vec![1]);
        assert!(cache.get_page("other", 1).await.unwrap().is_none());
    }
}
