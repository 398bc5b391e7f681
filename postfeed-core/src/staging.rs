use std::collections::BTreeMap;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::FeedError;
use crate::site::{error_from_response, SiteClient};

const FORK_PATH: &str = "wp-json/rex/v1/fork";
const SAVE_PATH: &str = "wp-json/rex/v1/save";
const PUBLISH_PATH: &str = "wp-json/rex/v1/publish";

/// Server-managed marker linking a staging copy to the post it was forked from.
pub const ORIGINAL_POST_META: &str = "_rex_original_post_id";

/// Fields written by a staging save. `None` fields are left out of the
/// payload so the server keeps their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveData {
    #[serde(rename = "post_title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "post_content", skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "post_excerpt", skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(rename = "post_status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "post_name", skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_input: Option<BTreeMap<String, Vec<i64>>>,
    /// Optimistic concurrency token; a mismatch makes the server fork instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_modified_gmt: Option<String>,
}

impl SaveData {
    pub fn title_only(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn expecting_modified(mut self, modified_gmt: impl Into<String>) -> Self {
        self.expected_modified_gmt = Some(modified_gmt.into());
        self
    }

    fn without_original_marker(mut self) -> Self {
        if let Some(meta) = self.meta.as_mut() {
            meta.remove(ORIGINAL_POST_META);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForkResult {
    pub id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub original_post_id: Option<i64>,
    #[serde(default)]
    pub modified_gmt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SaveResult {
    pub id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub saved: Option<bool>,
    /// Set when the server wrote to a fresh staging copy instead of `id`.
    #[serde(default)]
    pub forked: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub original_post_id: Option<i64>,
    #[serde(default)]
    pub modified_gmt: Option<String>,
}

impl SaveResult {
    pub fn was_forked(&self) -> bool {
        self.forked.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishResult {
    pub published_id: i64,
    /// True when the staging copy overwrote the post it was forked from.
    #[serde(default)]
    pub used_original: bool,
}

/// Staging write path over the `rex/v1` endpoints: fork a post into a
/// draft copy, save into it, then publish it over the original.
#[derive(Debug, Clone)]
pub struct EditingService {
    site: SiteClient,
}

impl EditingService {
    pub fn new(site: SiteClient) -> Self {
        Self { site }
    }

    pub async fn fork(&self, source_id: i64, status: &str) -> Result<ForkResult, FeedError> {
        let status = if status.trim().is_empty() { "draft" } else { status };
        let result: ForkResult = self
            .post(FORK_PATH, json!({ "source_id": source_id, "status": status }), "fork")
            .await?;
        info!(source_id, staging_id = result.id, "forked post");
        Ok(result)
    }

    /// Updates `id` when given, otherwise creates a new `post_type` item.
    pub async fn save(
        &self,
        data: SaveData,
        id: Option<i64>,
        post_type: &str,
    ) -> Result<SaveResult, FeedError> {
        let data = data.without_original_marker();
        let payload = match id {
            Some(id) => json!({ "data": data, "id": id }),
            None => {
                let post_type = if post_type.trim().is_empty() { "post" } else { post_type };
                json!({ "data": data, "post_type": post_type })
            }
        };
        let result: SaveResult = self.post(SAVE_PATH, payload, "save").await?;
        if result.was_forked() {
            info!(
                requested = ?id,
                staging_id = result.id,
                reason = result.reason.as_deref().unwrap_or(""),
                "save landed on a forked copy"
            );
        }
        Ok(result)
    }

    pub async fn publish(&self, staging_id: i64) -> Result<PublishResult, FeedError> {
        let result: PublishResult = self
            .post(PUBLISH_PATH, json!({ "staging_id": staging_id }), "publish")
            .await?;
        info!(
            staging_id,
            published_id = result.published_id,
            used_original = result.used_original,
            "published staging copy"
        );
        Ok(result)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: serde_json::Value,
        op: &str,
    ) -> Result<T, FeedError> {
        let url = self.site.endpoint(path)?;
        let response = self
            .site
            .request(Method::POST, url)
            .json(&payload)
            .send()
            .await
            .map_err(FeedError::transport)?;
        if !response.status().is_success() {
            debug!(op, status = %response.status(), "staging request failed");
            return Err(error_from_response(response).await);
        }
        let bytes = response.bytes().await.map_err(FeedError::transport)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(FeedError::Parse(format!("{op} returned no content")));
        }
        serde_json::from_slice(&bytes).map_err(|e| FeedError::Parse(format!("{op}: {e}")))
    }
}
