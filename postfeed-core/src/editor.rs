use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{CACHE_CONTROL, IF_UNMODIFIED_SINCE, PRAGMA};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::post::EditResult;
use crate::site::{error_from_response, SiteClient};

/// Write path against the remote collection.
///
/// `update` does not check `last_seen_modified_utc` itself; callers run
/// [`check_before_update`] first, and the remote side may reject stale writes.
#[async_trait]
pub trait PostEditor: Send + Sync {
    async fn create(&self, title: &str, html: &str) -> Result<EditResult, FeedError>;

    async fn update(
        &self,
        id: i64,
        html: &str,
        last_seen_modified_utc: &str,
    ) -> Result<EditResult, FeedError>;

    /// Server-side `modified_gmt`, read past any cache. `None` when the post
    /// cannot be read.
    async fn last_modified_utc(&self, id: i64) -> Result<Option<String>, FeedError>;

    async fn set_status(&self, id: i64, status: &str) -> Result<EditResult, FeedError>;

    /// A post that is already gone counts as deleted.
    async fn delete(&self, id: i64, force: bool) -> Result<(), FeedError>;
}

/// Last-writer-wins preflight: fails with [`FeedError::Conflict`] when the
/// server copy is strictly newer than what the caller last saw.
pub async fn check_before_update<E>(
    editor: &E,
    id: i64,
    last_seen_modified_utc: &str,
) -> Result<(), FeedError>
where
    E: PostEditor + ?Sized,
{
    match editor.last_modified_utc(id).await? {
        Some(server) if is_newer(&server, last_seen_modified_utc) => {
            info!(id, server = %server, last_seen = %last_seen_modified_utc, "stale edit detected");
            Err(FeedError::Conflict {
                last_seen: last_seen_modified_utc.to_owned(),
                server: Some(server),
            })
        }
        _ => Ok(()),
    }
}

/// Preflight then update.
pub async fn update_checked<E>(
    editor: &E,
    id: i64,
    html: &str,
    last_seen_modified_utc: &str,
) -> Result<EditResult, FeedError>
where
    E: PostEditor + ?Sized,
{
    check_before_update(editor, id, last_seen_modified_utc).await?;
    editor.update(id, html, last_seen_modified_utc).await
}

/// Parses WordPress `modified_gmt` (`2024-10-21T07:28:00`) or RFC 3339.
pub fn parse_modified(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn is_newer(server: &str, last_seen: &str) -> bool {
    match (parse_modified(server), parse_modified(last_seen)) {
        (Some(server), Some(seen)) => server > seen,
        // both formats sort lexicographically when they cannot be parsed alike
        _ => server.trim() > last_seen.trim(),
    }
}

#[derive(Debug, Deserialize)]
struct WpEditResponse {
    id: i64,
    #[serde(default)]
    link: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct WpModified {
    modified_gmt: Option<String>,
}

/// [`PostEditor`] over the WordPress REST API.
#[derive(Debug, Clone)]
pub struct WpEditor {
    site: SiteClient,
    rest_base: String,
}

impl WpEditor {
    pub fn new(site: SiteClient) -> Self {
        Self {
            site,
            rest_base: "posts".to_owned(),
        }
    }

    pub fn with_rest_base(mut self, rest_base: &str) -> Self {
        self.rest_base = rest_base.trim_matches('/').to_owned();
        self
    }

    fn collection_path(&self) -> String {
        format!("wp-json/wp/v2/{}", self.rest_base)
    }

    fn item_path(&self, id: i64) -> String {
        format!("wp-json/wp/v2/{}/{id}", self.rest_base)
    }

    async fn post_json(
        &self,
        path: &str,
        payload: serde_json::Value,
        last_seen: Option<&str>,
    ) -> Result<Response, FeedError> {
        let url = self.site.endpoint(path)?;
        let mut request = self.site.request(Method::POST, url).json(&payload);
        if let Some(since) = last_seen.and_then(parse_modified) {
            request = request.header(
                IF_UNMODIFIED_SINCE,
                since.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }
        request.send().await.map_err(FeedError::transport)
    }

    async fn recover_as_draft(&self, id: i64, html: &str) -> Result<EditResult, FeedError> {
        let title = format!("Recovered #{id} {} UTC", Utc::now().format("%Y-%m-%d %H:%M"));
        warn!(id, title = %title, "post is gone, saving content as a new draft");
        let response = self
            .post_json(
                &self.collection_path(),
                json!({ "title": title, "status": "draft", "content": html }),
                None,
            )
            .await?;
        parse_edit_result(response).await
    }
}

async fn parse_edit_result(response: Response) -> Result<EditResult, FeedError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    let bytes = response.bytes().await.map_err(FeedError::transport)?;
    let parsed: WpEditResponse =
        serde_json::from_slice(&bytes).map_err(|e| FeedError::Parse(e.to_string()))?;
    Ok(EditResult {
        id: parsed.id,
        link: parsed.link,
        status: parsed.status,
    })
}

#[async_trait]
impl PostEditor for WpEditor {
    async fn create(&self, title: &str, html: &str) -> Result<EditResult, FeedError> {
        let response = self
            .post_json(
                &self.collection_path(),
                json!({ "title": title, "status": "draft", "content": html }),
                None,
            )
            .await?;
        parse_edit_result(response).await
    }

    async fn update(
        &self,
        id: i64,
        html: &str,
        last_seen_modified_utc: &str,
    ) -> Result<EditResult, FeedError> {
        if last_seen_modified_utc.trim().is_empty() {
            return Err(FeedError::InvalidArgument(
                "last_seen_modified_utc is required".to_owned(),
            ));
        }
        let response = self
            .post_json(
                &self.item_path(id),
                json!({ "content": html }),
                Some(last_seen_modified_utc),
            )
            .await?;
        match response.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Err(FeedError::Conflict {
                last_seen: last_seen_modified_utc.to_owned(),
                server: None,
            }),
            StatusCode::NOT_FOUND | StatusCode::GONE => self.recover_as_draft(id, html).await,
            _ => parse_edit_result(response).await,
        }
    }

    async fn last_modified_utc(&self, id: i64) -> Result<Option<String>, FeedError> {
        let mut url = self.site.endpoint(&self.item_path(id))?;
        url.query_pairs_mut()
            .append_pair("context", "edit")
            .append_pair("_", &Utc::now().timestamp_millis().to_string());
        let response = self
            .site
            .request(Method::GET, url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(FeedError::transport)?;
        if !response.status().is_success() {
            debug!(id, status = %response.status(), "last-modified read failed");
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(FeedError::transport)?;
        Ok(serde_json::from_slice::<WpModified>(&bytes)
            .ok()
            .and_then(|m| m.modified_gmt))
    }

    async fn set_status(&self, id: i64, status: &str) -> Result<EditResult, FeedError> {
        if status.trim().is_empty() {
            return Err(FeedError::InvalidArgument("status is required".to_owned()));
        }
        let response = self
            .post_json(&self.item_path(id), json!({ "status": status }), None)
            .await?;
        parse_edit_result(response).await
    }

    async fn delete(&self, id: i64, force: bool) -> Result<(), FeedError> {
        let mut url = self.site.endpoint(&self.item_path(id))?;
        url.query_pairs_mut()
            .append_pair("force", if force { "true" } else { "false" });
        let response = self
            .site
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(FeedError::transport)?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!(id, "post already deleted");
                Ok(())
            }
            _ => Err(error_from_response(response).await),
        }
    }
}
