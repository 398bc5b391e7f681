#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use postfeed_core::{FeedError, FetchOutcome, FetchedPage, PageSource, PostSummary};

pub fn post(id: i64) -> PostSummary {
    post_modified(id, "2024-10-21T07:28:00")
}

pub fn post_modified(id: i64, modified_gmt: &str) -> PostSummary {
    PostSummary {
        id,
        title: format!("post {id}"),
        status: "publish".into(),
        link: format!("https://example.test/?p={id}"),
        modified_gmt: modified_gmt.into(),
    }
}

pub fn posts(ids: &[i64]) -> Vec<PostSummary> {
    ids.iter().copied().map(post).collect()
}

pub fn ids_of<'a>(items: impl IntoIterator<Item = &'a PostSummary>) -> Vec<i64> {
    let mut ids: Vec<i64> = items.into_iter().map(|p| p.id).collect();
    ids.sort_unstable();
    ids
}

#[derive(Debug, Default)]
struct FakeState {
    // scope -> pages (index 0 is page 1)
    pages: HashMap<String, Vec<Vec<PostSummary>>>,
    fail_at_page: Option<u32>,
    requests: Vec<(String, u32, u32)>,
}

/// In-memory remote collection. Pages past the end come back empty and every
/// page carries the total page count as its hint.
#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pages(&self, scope: &str, pages: Vec<Vec<PostSummary>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pages.insert(scope.to_owned(), pages);
    }

    pub fn fail_at_page(&self, page: Option<u32>) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_at_page = page;
    }

    pub fn requests(&self) -> Vec<(String, u32, u32)> {
        let inner = self.inner.lock().unwrap();
        inner.requests.clone()
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn fetch_page(
        &self,
        scope: &str,
        page: u32,
        per_page: u32,
        _etag: Option<&str>,
    ) -> Result<FetchOutcome, FeedError> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push((scope.to_owned(), page, per_page));
        if inner.fail_at_page == Some(page) {
            return Err(FeedError::Timeout);
        }
        let pages = inner.pages.get(scope).cloned().unwrap_or_default();
        let total = pages.len() as u32;
        let items = pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default();
        Ok(FetchOutcome::Page(FetchedPage {
            items,
            total_pages: Some(total),
            etag: None,
        }))
    }
}
