use std::collections::BTreeMap;

use postfeed_core::staging::ORIGINAL_POST_META;
use postfeed_core::{EditingService, ErrorKind, FeedError, SaveData, SiteClient, SiteConfig};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(server: &MockServer) -> EditingService {
    let config = SiteConfig {
        base_url: server.uri(),
        username: Some("admin".into()),
        app_password: Some("pass".into()),
        timeout_seconds: 2,
        ..SiteConfig::default()
    };
    EditingService::new(SiteClient::new(&config).unwrap())
}

async fn sent_body(server: &MockServer) -> serde_json::Value {
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 1);
    serde_json::from_slice(&requests[0].body).unwrap()
}

#[tokio::test]
async fn fork_posts_source_and_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/fork"))
        .and(header("authorization", "Basic YWRtaW46cGFzcw=="))
        .and(body_json(json!({ "source_id": 7, "status": "draft" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 70,
            "status": "draft",
            "original_post_id": 7,
            "modified_gmt": "2024-10-21T07:28:00"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fork = service(&server).fork(7, "draft").await.unwrap();
    assert_eq!(fork.id, 70);
    assert_eq!(fork.original_post_id, Some(7));
    assert_eq!(fork.status.as_deref(), Some("draft"));
}

#[tokio::test]
async fn fork_of_missing_post_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/fork"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "not_found",
            "message": "Source post not found"
        })))
        .mount(&server)
        .await;

    let err = service(&server).fork(999, "draft").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn save_update_sends_id_without_post_type() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/save"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 70,
            "status": "draft",
            "saved": true,
            "modified_gmt": "2024-10-21T08:00:00"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let data = SaveData::title_only("Hello")
        .with_content("<p>body</p>")
        .expecting_modified("2024-10-21T07:28:00");
    let saved = service(&server).save(data, Some(70), "page").await.unwrap();
    assert_eq!(saved.saved, Some(true));
    assert!(!saved.was_forked());

    assert_eq!(
        sent_body(&server).await,
        json!({
            "id": 70,
            "data": {
                "post_title": "Hello",
                "post_content": "<p>body</p>",
                "expected_modified_gmt": "2024-10-21T07:28:00"
            }
        })
    );
}

#[tokio::test]
async fn save_create_defaults_post_type() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/save"))
        .and(body_partial_json(json!({ "post_type": "post" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 81,
            "status": "draft",
            "saved": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let saved = service(&server)
        .save(SaveData::title_only("New"), None, " ")
        .await
        .unwrap();
    assert_eq!(saved.id, 81);

    let body = sent_body(&server).await;
    assert!(body.get("id").is_none());
}

#[tokio::test]
async fn save_never_sends_the_original_post_marker() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/save"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 70, "saved": true })))
        .expect(1)
        .mount(&server)
        .await;

    let data = SaveData {
        meta: Some(BTreeMap::from([
            (ORIGINAL_POST_META.to_owned(), json!(7)),
            ("subtitle".to_owned(), json!("kept")),
        ])),
        ..SaveData::title_only("Hello")
    };
    service(&server).save(data, Some(70), "post").await.unwrap();

    let body = sent_body(&server).await;
    assert_eq!(body["data"]["meta"], json!({ "subtitle": "kept" }));
}

#[tokio::test]
async fn stale_save_reports_the_forked_copy() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/save"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 71,
            "status": "draft",
            "forked": true,
            "reason": "conflict",
            "original_post_id": 7
        })))
        .mount(&server)
        .await;

    let data = SaveData::title_only("Hello").expecting_modified("2000-01-01T00:00:00");
    let saved = service(&server).save(data, Some(7), "post").await.unwrap();
    assert!(saved.was_forked());
    assert_eq!(saved.id, 71);
    assert_eq!(saved.reason.as_deref(), Some("conflict"));
    assert_eq!(saved.original_post_id, Some(7));
}

#[tokio::test]
async fn publish_sends_staging_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/publish"))
        .and(body_json(json!({ "staging_id": 70 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "published_id": 7,
            "used_original": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let published = service(&server).publish(70).await.unwrap();
    assert_eq!(published.published_id, 7);
    assert!(published.used_original);
}

#[tokio::test]
async fn empty_response_is_a_parse_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/rex/v1/publish"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let err = service(&server).publish(70).await.unwrap_err();
    assert!(matches!(err, FeedError::Parse(ref msg) if msg.contains("no content")));
}
