use std::time::Duration;

use postfeed_core::{
    ErrorKind, FeedError, FetchOutcome, PageSource, RetryPolicy, SiteClient, SiteConfig,
    WpRestSource,
};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POSTS_PATH: &str = "/wp-json/wp/v2/posts";

fn site_config(server: &MockServer) -> SiteConfig {
    SiteConfig {
        base_url: server.uri(),
        timeout_seconds: 2,
        ..SiteConfig::default()
    }
}

fn authed_config(server: &MockServer) -> SiteConfig {
    SiteConfig {
        username: Some("admin".into()),
        app_password: Some("pass".into()),
        ..site_config(server)
    }
}

fn source(config: &SiteConfig, retry: RetryPolicy) -> WpRestSource {
    WpRestSource::new(SiteClient::new(config).unwrap(), retry)
}

fn sample_page() -> serde_json::Value {
    json!([
        {
            "id": 1,
            "title": { "rendered": "First" },
            "status": "publish",
            "link": "http://example.com/?p=1",
            "modified_gmt": "2024-10-21T07:28:00"
        },
        {
            "id": 2,
            "title": { "rendered": "Second" },
            "status": "publish",
            "link": "http://example.com/?p=2",
            "modified_gmt": "2024-10-21T08:00:00"
        }
    ])
}

fn expect_page(outcome: FetchOutcome) -> postfeed_core::FetchedPage {
    match outcome {
        FetchOutcome::Page(page) => page,
        FetchOutcome::NotModified => panic!("expected a page"),
    }
}

#[tokio::test]
async fn fetch_page_reads_items_total_and_etag() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "2"))
        .and(query_param("orderby", "id"))
        .and(query_param("order", "asc"))
        .and(query_param("_fields", "id,title,status,link,modified_gmt"))
        .and(query_param_is_missing("status"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-WP-TotalPages", "2")
                .insert_header("ETag", "\"v1\"")
                .set_body_json(sample_page()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let src = source(&site_config(&server), RetryPolicy::none());
    let page = expect_page(src.fetch_page("posts", 1, 2, None).await.unwrap());

    let ids: Vec<i64> = page.items.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(page.items[0].title, "First");
    assert_eq!(page.items[1].modified_gmt, "2024-10-21T08:00:00");
    assert_eq!(page.total_pages, Some(2));
    assert_eq!(page.etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn page_past_the_end_is_empty() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "rest_post_invalid_page_number",
            "message": "The page number requested is larger than the number of pages available."
        })))
        .mount(&server)
        .await;

    let src = source(&site_config(&server), RetryPolicy::none());
    let page = expect_page(src.fetch_page("posts", 9, 100, None).await.unwrap());
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn rejected_status_any_falls_back_to_explicit_statuses() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .and(query_param("status", "any"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "rest_invalid_param",
            "message": "Invalid parameter(s): status",
            "data": { "status": 400, "params": { "status": "Status is forbidden." } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .and(query_param("status", "publish,draft,pending,private,future"))
        .and(query_param("context", "edit"))
        .and(header("authorization", "Basic YWRtaW46cGFzcw=="))
        .respond_with(ResponseTemplate::new(200).set_body_json(sample_page()))
        .expect(2)
        .mount(&server)
        .await;

    let src = source(&authed_config(&server), RetryPolicy::none());
    let first = expect_page(src.fetch_page("posts", 1, 100, None).await.unwrap());
    assert_eq!(first.items.len(), 2);

    // the fallback sticks for later requests
    let second = expect_page(src.fetch_page("posts", 1, 100, None).await.unwrap());
    assert_eq!(second.items.len(), 2);
}

#[tokio::test]
async fn unrelated_bad_request_falls_back_for_that_request_only() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .and(query_param("status", "any"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "rest_invalid_param",
            "message": "Invalid parameter(s): search",
            "data": { "status": 400, "params": { "search": "Invalid search." } }
        })))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .and(query_param("status", "publish,draft,pending,private,future"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sample_page()))
        .expect(2)
        .mount(&server)
        .await;

    let src = source(&authed_config(&server), RetryPolicy::none());
    for _ in 0..2 {
        let page = expect_page(src.fetch_page("posts", 1, 100, None).await.unwrap());
        assert_eq!(page.items.len(), 2);
    }
}

#[tokio::test]
async fn bad_request_after_fallback_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "rest_invalid_param",
            "message": "Invalid parameter(s): per_page",
            "data": { "status": 400, "params": { "per_page": "per_page must be between 1 (inclusive) and 100 (inclusive)" } }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let src = source(&authed_config(&server), RetryPolicy::none());
    let err = src.fetch_page("posts", 1, 500, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientError);
}

#[tokio::test]
async fn matching_etag_reports_not_modified() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let src = source(&site_config(&server), RetryPolicy::none());
    let outcome = src.fetch_page("posts", 1, 100, Some("\"v1\"")).await.unwrap();
    assert_eq!(outcome, FetchOutcome::NotModified);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(
            ResponseTemplate::new(429).insert_header("Retry-After", "0"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(sample_page()))
        .expect(1)
        .mount(&server)
        .await;

    let src = source(
        &site_config(&server),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );
    let page = expect_page(src.fetch_page("posts", 1, 100, None).await.unwrap());
    assert_eq!(page.items.len(), 2);
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let src = source(
        &site_config(&server),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );
    let err = src.fetch_page("posts", 1, 100, None).await.unwrap_err();
    assert!(matches!(err, FeedError::Auth { .. }));
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POSTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let src = source(&site_config(&server), RetryPolicy::none());
    let err = src.fetch_page("posts", 1, 100, None).await.unwrap_err();
    assert!(matches!(err, FeedError::Parse(_)));
}
