//! Integration tests for filtered updates and deletes

use axum::http::StatusCode;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod common;

use common::{TestEnv, json_body, request, send, template_filter};

const ITEM: &str = "/collections/landsat/items/l8-1";

fn item(collection: &str) -> Value {
    json!({
        "type": "Feature",
        "id": "l8-1",
        "collection": collection,
        "properties": {"datetime": "2024-01-01T00:00:00Z"}
    })
}

async fn env_with_existing(existing: Value) -> TestEnv {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(200).set_body_json(existing))
        .mount(&env.upstream)
        .await;
    env
}

fn router(env: &TestEnv) -> axum::Router {
    let mut config = env.config();
    config.items_filter = Some(template_filter("collection = 'landsat'"));
    env.router(config)
}

#[tokio::test]
async fn test_update_of_hidden_record_is_forbidden() {
    let env = env_with_existing(item("sentinel")).await;
    Mock::given(method("PUT"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let response = send(&router, request("PUT", ITEM, Some(&token), Some(item("landsat")))).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_update_moving_record_out_of_filter_is_forbidden() {
    let env = env_with_existing(item("landsat")).await;
    Mock::given(method("PUT"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let response = send(&router, request("PUT", ITEM, Some(&token), Some(item("sentinel")))).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_permitted_update_is_forwarded_with_body() {
    let env = env_with_existing(item("landsat")).await;
    Mock::given(method("PUT"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(200).set_body_json(item("landsat")))
        .expect(1)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let mut updated = item("landsat");
    updated["properties"]["cloud_cover"] = json!(12);
    let response = send(&router, request("PUT", ITEM, Some(&token), Some(updated.clone()))).await;
    assert_eq!(response.status, StatusCode::OK);

    let put = env
        .upstream_requests()
        .await
        .into_iter()
        .find(|r| r.method.as_str() == "PUT")
        .expect("PUT reached the upstream");
    assert_eq!(json_body(&put), updated);
}

#[tokio::test]
async fn test_patch_is_checked_against_merged_record() {
    let env = env_with_existing(item("landsat")).await;
    Mock::given(method("PATCH"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let harmless = json!({"properties": {"cloud_cover": 3}});
    let response = send(&router, request("PATCH", ITEM, Some(&token), Some(harmless))).await;
    assert_eq!(response.status, StatusCode::OK);

    let escaping = json!({"collection": "sentinel"});
    let response = send(&router, request("PATCH", ITEM, Some(&token), Some(escaping))).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_delete_requires_visible_record() {
    let env = env_with_existing(item("landsat")).await;
    Mock::given(method("DELETE"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let response = send(&router, request("DELETE", ITEM, Some(&token), None)).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_delete_of_hidden_record_is_forbidden() {
    let env = env_with_existing(item("sentinel")).await;
    Mock::given(method("DELETE"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let response = send(&router, request("DELETE", ITEM, Some(&token), None)).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"code": "NotFoundError"})))
        .mount(&env.upstream)
        .await;
    Mock::given(method("DELETE"))
        .and(path(ITEM))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&env.upstream)
        .await;
    let router = router(&env);
    let token = env.token(json!({}));

    let response = send(&router, request("DELETE", ITEM, Some(&token), None)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
