//! Cache-then-fresh batch streaming for a single scope.
//!
//! A pass first replays whatever the [`PageCache`] holds, so subscribers get
//! something to show immediately, then walks the remote collection page by
//! page, writing each fresh page back into the cache before emitting it.
//! Only a pass that reaches the end of the collection reconciles the id
//! index; an interrupted or failed pass leaves it untouched.

use std::collections::HashSet;

use async_stream::try_stream;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::PageCache;
use crate::error::FeedError;
use crate::post::{CachePage, FetchedPage, PostSummary, StreamOptions, StreamProgress};
use crate::source::{FetchOutcome, PageSource};

/// Ordered batches of posts; an `Err` item ends the stream.
pub type BatchStream<'a> = BoxStream<'a, Result<Vec<PostSummary>, FeedError>>;

/// Best-effort progress sink. Reports are dropped when the channel is full.
pub type ProgressSender = mpsc::Sender<StreamProgress>;

pub(crate) fn boxed<'a, S>(stream: S) -> BatchStream<'a>
where
    S: Stream<Item = Result<Vec<PostSummary>, FeedError>> + Send + 'a,
{
    Box::pin(stream)
}

pub trait ContentStream: Send + Sync {
    /// Dropping the returned stream cancels the pass.
    fn stream_cached_then_fresh<'a>(
        &'a self,
        scope: &'a str,
        options: StreamOptions,
        progress: Option<ProgressSender>,
    ) -> BatchStream<'a>;
}

fn report(progress: &Option<ProgressSender>, pages_completed: u32, total_pages_hint: Option<u32>) {
    if let Some(tx) = progress {
        // never wait on a slow progress consumer
        let _ = tx.try_send(StreamProgress {
            pages_completed,
            total_pages_hint,
        });
    }
}

/// [`ContentStream`] over a remote [`PageSource`] and a [`PageCache`].
#[derive(Debug, Clone)]
pub struct CacheThenFresh<S, C> {
    source: S,
    cache: C,
}

impl<S, C> CacheThenFresh<S, C>
where
    S: PageSource,
    C: PageCache,
{
    pub fn new(source: S, cache: C) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    async fn fetch(
        &self,
        scope: &str,
        page: u32,
        per_page: u32,
    ) -> Result<(FetchedPage, bool), FeedError> {
        let cached = match self.cache.get_page(scope, page).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(scope = %scope, page, error = %e, "cached page unreadable, fetching unconditionally");
                None
            }
        };
        let etag = cached.as_ref().and_then(|c| c.etag.clone());
        let outcome = self
            .source
            .fetch_page(scope, page, per_page, etag.as_deref())
            .await?;
        match (outcome, cached) {
            (FetchOutcome::Page(fetched), _) => Ok((fetched, false)),
            (FetchOutcome::NotModified, Some(cached)) => {
                debug!(scope = %scope, page, "page not modified, reusing cached copy");
                Ok((from_cached(cached), true))
            }
            (FetchOutcome::NotModified, None) => Err(FeedError::Parse(format!(
                "source reported page {page} of {scope} as not modified without a cached copy"
            ))),
        }
    }

    async fn store(&self, scope: &str, page: CachePage) {
        let items = page.items.clone();
        let number = page.page;
        if let Err(e) = self.cache.upsert_page(scope, page).await {
            warn!(scope = %scope, page = number, error = %e, "failed to cache page");
        }
        self.index(scope, number, &items).await;
    }

    async fn index(&self, scope: &str, page: u32, items: &[PostSummary]) {
        if let Err(e) = self.cache.upsert_index(scope, items).await {
            warn!(scope = %scope, page, error = %e, "failed to index page");
        }
    }

    async fn reconcile(&self, scope: &str, seen: &HashSet<i64>, last_page: u32) -> Result<(), FeedError> {
        let known = self.cache.all_known_ids(scope).await?;
        let gone: Vec<i64> = known.difference(seen).copied().collect();
        if !gone.is_empty() {
            info!(scope = %scope, removed = gone.len(), "dropping ids no longer present remotely");
            self.cache.remove_from_index(scope, &gone).await?;
        }
        self.cache.prune_pages_after(scope, last_page).await
    }
}

fn from_cached(cached: CachePage) -> FetchedPage {
    FetchedPage {
        items: cached.items,
        total_pages: cached.total_pages_hint,
        etag: cached.etag,
    }
}

impl<S, C> ContentStream for CacheThenFresh<S, C>
where
    S: PageSource,
    C: PageCache,
{
    fn stream_cached_then_fresh<'a>(
        &'a self,
        scope: &'a str,
        options: StreamOptions,
        progress: Option<ProgressSender>,
    ) -> BatchStream<'a> {
        boxed(try_stream! {
            let mut completed: u32 = 0;

            let mut warm = self.cache.read_all_pages(scope).take(options.warm_first_count());
            while let Some(items) = warm.next().await {
                let items = items?;
                completed += 1;
                report(&progress, completed, None);
                yield items;
            }
            drop(warm);
            debug!(scope = %scope, pages = completed, "warm pass complete");

            let per_page = u32::try_from(options.max_batch_size()).unwrap_or(u32::MAX);
            let mut seen = HashSet::new();
            let mut total_hint = None;
            let mut last_page = 0;
            let mut page = 1;
            loop {
                let (fetched, not_modified) = self.fetch(scope, page, per_page).await?;
                if fetched.items.is_empty() {
                    break;
                }
                total_hint = fetched.total_pages.or(total_hint);
                seen.extend(fetched.items.iter().map(|p| p.id));

                let items = fetched.items.clone();
                if not_modified {
                    self.index(scope, page, &items).await;
                } else {
                    self.store(scope, fetched.into_cache_page(page)).await;
                }
                last_page = page;
                completed += 1;
                report(&progress, completed, total_hint);
                yield items;

                if matches!(total_hint, Some(total) if page >= total) {
                    break;
                }
                page += 1;
            }

            self.reconcile(scope, &seen, last_page).await?;
            info!(scope = %scope, pages = last_page, posts = seen.len(), "fresh pass complete");
        })
    }
}
