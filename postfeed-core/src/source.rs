use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::post::{FetchedPage, PostSummary};
use crate::site::{error_from_response, SiteClient};

const TOTAL_PAGES_HEADER: &str = "X-WP-TotalPages";
const SUMMARY_FIELDS: &str = "id,title,status,link,modified_gmt";
const EXPLICIT_STATUSES: &str = "publish,draft,pending,private,future";
const MAX_JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Page(FetchedPage),
    /// The page still matches the etag the caller presented.
    NotModified,
}

/// Remote side of the cache-then-fresh stream: one page of a scope per call.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// An empty page means the collection has no more pages.
    async fn fetch_page(
        &self,
        scope: &str,
        page: u32,
        per_page: u32,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FeedError>;
}

/// Exponential backoff with up to 20% random jitter for transient fetch
/// failures; `Retry-After` wins when the server sends one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`, or `None` to give up.
    pub fn delay_for(&self, error: &FeedError, attempt: u32) -> Option<Duration> {
        if !error.is_transient() || attempt >= self.max_attempts {
            return None;
        }
        if let FeedError::RateLimited {
            retry_after: Some(wait),
        } = error
        {
            return Some(*wait);
        }
        let base = self.backoff(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        Some(base.saturating_add(base.mul_f64(jitter)))
    }

    /// Un-jittered delay: `base_delay * 2^(attempt - 1)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WpText {
    Rendered {
        #[serde(default)]
        raw: Option<String>,
        #[serde(default)]
        rendered: String,
    },
    Plain(String),
}

impl Default for WpText {
    fn default() -> Self {
        WpText::Plain(String::new())
    }
}

impl WpText {
    fn into_string(self) -> String {
        match self {
            WpText::Rendered { raw: Some(raw), .. } => raw,
            WpText::Rendered { rendered, .. } => rendered,
            WpText::Plain(text) => text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WpListItem {
    id: i64,
    #[serde(default)]
    title: WpText,
    #[serde(default)]
    status: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    modified_gmt: String,
}

impl From<WpListItem> for PostSummary {
    fn from(item: WpListItem) -> Self {
        Self {
            id: item.id,
            title: item.title.into_string(),
            status: item.status,
            link: item.link,
            modified_gmt: item.modified_gmt,
        }
    }
}

/// [`PageSource`] over the WordPress REST collection `wp-json/wp/v2/<scope>`.
///
/// Authenticated clients list every status with `context=edit`. A 400 on
/// `status=any` retries that request once with the explicit status list; only
/// a rejection that names the `status` parameter makes the fallback stick.
#[derive(Debug)]
pub struct WpRestSource {
    site: SiteClient,
    retry: RetryPolicy,
    any_status_rejected: AtomicBool,
}

impl WpRestSource {
    pub fn new(site: SiteClient, retry: RetryPolicy) -> Self {
        Self {
            site,
            retry,
            any_status_rejected: AtomicBool::new(false),
        }
    }

    async fn fetch_once(
        &self,
        scope: &str,
        page: u32,
        per_page: u32,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FeedError> {
        let mut statuses = if self.any_status_rejected.load(Ordering::Relaxed) {
            EXPLICIT_STATUSES
        } else {
            "any"
        };
        loop {
            let mut url = self.site.endpoint(&format!("wp-json/wp/v2/{scope}"))?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("page", &page.to_string())
                    .append_pair("per_page", &per_page.to_string())
                    .append_pair("_fields", SUMMARY_FIELDS)
                    .append_pair("orderby", "id")
                    .append_pair("order", "asc");
                if self.site.is_authenticated() {
                    query
                        .append_pair("context", "edit")
                        .append_pair("status", statuses);
                }
            }

            let mut request = self
                .site
                .request(Method::GET, url)
                .header(CACHE_CONTROL, "no-cache");
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            let response = request.send().await.map_err(FeedError::transport)?;

            match response.status() {
                StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
                StatusCode::BAD_REQUEST => {
                    let body = response.text().await.map_err(FeedError::transport)?;
                    if body.contains("rest_post_invalid_page_number")
                        || body.contains("rest_invalid_page_number")
                    {
                        debug!(scope = %scope, page, "page past the end of the collection");
                        return Ok(FetchOutcome::Page(FetchedPage::default()));
                    }
                    if self.site.is_authenticated() && statuses != EXPLICIT_STATUSES {
                        statuses = EXPLICIT_STATUSES;
                        if rejects_status_param(&body) {
                            warn!(scope = %scope, "site rejected status=any, using explicit statuses");
                            self.any_status_rejected.store(true, Ordering::Relaxed);
                        } else {
                            debug!(scope = %scope, page, "400 on status=any, retrying with explicit statuses");
                        }
                        continue;
                    }
                    return Err(FeedError::Http {
                        status: StatusCode::BAD_REQUEST,
                        body,
                    });
                }
                s if !s.is_success() => return Err(error_from_response(response).await),
                _ => {}
            }

            let total_pages = response
                .headers()
                .get(TOTAL_PAGES_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok());
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);
            let bytes = response.bytes().await.map_err(FeedError::transport)?;
            let items: Vec<WpListItem> = serde_json::from_slice(&bytes)
                .map_err(|e| FeedError::Parse(format!("{scope} page {page}: {e}")))?;

            return Ok(FetchOutcome::Page(FetchedPage {
                items: items.into_iter().map(PostSummary::from).collect(),
                total_pages,
                etag,
            }));
        }
    }
}

/// True when a WordPress `rest_invalid_param` error lists `status` among the
/// rejected parameters.
fn rejects_status_param(body: &str) -> bool {
    let Ok(error) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    error
        .pointer("/data/params")
        .and_then(|params| params.as_object())
        .is_some_and(|params| params.contains_key("status"))
}

#[async_trait]
impl PageSource for WpRestSource {
    async fn fetch_page(
        &self,
        scope: &str,
        page: u32,
        per_page: u32,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FeedError> {
        let mut attempt = 1;
        loop {
            match self.fetch_once(scope, page, per_page, etag).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => match self.retry.delay_for(&err, attempt) {
                    Some(delay) => {
                        warn!(scope = %scope, page, attempt, error = %err, "page fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}
