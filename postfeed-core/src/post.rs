use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PostSummary {
    pub id: i64,
    pub title: String,
    pub status: String,
    pub link: String,
    pub modified_gmt: String,
}

/// One page of a scope as it was fetched and stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachePage {
    pub page: u32,
    pub items: Vec<PostSummary>,
    pub etag: Option<String>,
    pub total_pages_hint: Option<u32>,
    pub fetched_at: DateTime<Utc>,
}

/// A page as returned by the remote source, before it is cached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub items: Vec<PostSummary>,
    pub total_pages: Option<u32>,
    pub etag: Option<String>,
}

impl FetchedPage {
    pub fn into_cache_page(self, page: u32) -> CachePage {
        CachePage {
            page,
            items: self.items,
            etag: self.etag,
            total_pages_hint: self.total_pages,
            fetched_at: Utc::now(),
        }
    }
}

const DEFAULT_WARM_FIRST_COUNT: usize = 10;
const DEFAULT_MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawStreamOptions {
    #[serde(default)]
    warm_first_count: i64,
    #[serde(default)]
    max_batch_size: i64,
}

/// Paging knobs for the cache-then-fresh stream.
///
/// Non-positive values are replaced with the defaults (10 warm pages, 100
/// items per request) instead of being rejected, both through
/// [`StreamOptions::new`] and when deserialized from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawStreamOptions")]
pub struct StreamOptions {
    warm_first_count: usize,
    max_batch_size: usize,
}

impl StreamOptions {
    pub fn new(warm_first_count: i64, max_batch_size: i64) -> Self {
        Self {
            warm_first_count: positive_or(warm_first_count, DEFAULT_WARM_FIRST_COUNT),
            max_batch_size: positive_or(max_batch_size, DEFAULT_MAX_BATCH_SIZE),
        }
    }

    pub fn warm_first_count(&self) -> usize {
        self.warm_first_count
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

fn positive_or(value: i64, default: usize) -> usize {
    if value <= 0 {
        default
    } else {
        usize::try_from(value).unwrap_or(default)
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            warm_first_count: DEFAULT_WARM_FIRST_COUNT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl From<RawStreamOptions> for StreamOptions {
    fn from(raw: RawStreamOptions) -> Self {
        Self::new(raw.warm_first_count, raw.max_batch_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProgress {
    pub pages_completed: u32,
    pub total_pages_hint: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditResult {
    pub id: i64,
    pub link: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_options_fall_back_to_defaults() {
        let opts = StreamOptions::new(0, -5);
        assert_eq!(opts, StreamOptions::default());

        let opts = StreamOptions::new(3, 0);
        assert_eq!(opts.warm_first_count(), 3);
        assert_eq!(opts.max_batch_size(), 100);
    }

    #[test]
    fn deserialized_options_are_clamped() {
        let opts: StreamOptions =
            serde_json::from_str(r#"{"warm_first_count": -1, "max_batch_size": 25}"#).unwrap();
        assert_eq!(opts.warm_first_count(), 10);
        assert_eq!(opts.max_batch_size(), 25);

        let empty: StreamOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, StreamOptions::default());
    }
}
