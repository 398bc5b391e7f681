use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{redirect, Client, ClientBuilder, Method, RequestBuilder, Response, StatusCode};
use url::Url;

use crate::config::SiteConfig;
use crate::error::FeedError;

const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
struct Credentials {
    username: String,
    app_password: String,
}

/// HTTP access to one WordPress site, shared by the page source and the editor.
#[derive(Clone)]
pub struct SiteClient {
    http: Client,
    base: Url,
    credentials: Option<Credentials>,
}

impl std::fmt::Debug for SiteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteClient")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl SiteClient {
    pub fn new(config: &SiteConfig) -> Result<Self, FeedError> {
        let http = ClientBuilder::new()
            .redirect(redirect::Policy::limited(5))
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()?;
        Self::with_client(http, config)
    }

    pub fn with_client(http: Client, config: &SiteConfig) -> Result<Self, FeedError> {
        let base = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))?;
        let credentials = match (&config.username, &config.app_password) {
            (Some(username), Some(app_password)) if !username.is_empty() => Some(Credentials {
                username: username.clone(),
                app_password: app_password.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Resolves a path such as `wp-json/wp/v2/posts` against the site root.
    pub fn endpoint(&self, path: &str) -> Result<Url, FeedError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Some(c) => builder.basic_auth(&c.username, Some(&c.app_password)),
            None => builder,
        }
    }
}

/// Maps a non-success response to the matching [`FeedError`].
pub(crate) async fn error_from_response(response: Response) -> FeedError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FeedError::Auth { status },
        StatusCode::TOO_MANY_REQUESTS => FeedError::RateLimited { retry_after },
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            FeedError::Http { status, body }
        }
    }
}
