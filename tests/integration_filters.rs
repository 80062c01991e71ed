//! Integration tests for filter generation and application

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;
use stac_auth_proxy::FilterExpression;
use stac_auth_proxy::config::FilterConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod common;

use common::{TestEnv, json_body, method_spec, query_pairs, request, send, template_filter};

const VISIBILITY_TEMPLATE: &str = "{{ 'true' if payload else '(private=false)' }}";

fn values<'a>(pairs: &'a [(String, String)], key: &str) -> Vec<&'a str> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .collect()
}

#[tokio::test]
async fn test_anonymous_search_gets_restrictive_query_filter() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"features": []})))
        .expect(1)
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config.default_public = true;
    config.items_filter = Some(template_filter(VISIBILITY_TEMPLATE));
    let router = env.router(config);

    let response = send(&router, request("GET", "/search?limit=10", None, None)).await;
    assert_eq!(response.status, StatusCode::OK);

    let received = env.upstream_requests().await;
    let pairs = query_pairs(&received[0]);
    assert_eq!(values(&pairs, "limit"), vec!["10"]);
    assert_eq!(values(&pairs, "filter-lang"), vec!["cql2-text"]);

    let filters = values(&pairs, "filter");
    assert_eq!(filters.len(), 1);
    let sent = FilterExpression::parse(filters[0]).unwrap();
    assert!(sent.matches(&json!({"id": "a", "private": false})));
    assert!(!sent.matches(&json!({"id": "b", "private": true})));
}

#[tokio::test]
async fn test_client_query_filter_is_combined() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"features": []})))
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config.default_public = true;
    config.items_filter = Some(template_filter(VISIBILITY_TEMPLATE));
    let router = env.router(config);

    let uri = "/search?filter=collection%3D%27landsat%27&filter-lang=cql2-text";
    let response = send(&router, request("GET", uri, None, None)).await;
    assert_eq!(response.status, StatusCode::OK);

    let received = env.upstream_requests().await;
    let pairs = query_pairs(&received[0]);
    let filters = values(&pairs, "filter");
    assert_eq!(filters.len(), 1);
    assert_eq!(values(&pairs, "filter-lang"), vec!["cql2-text"]);

    let sent = FilterExpression::parse(filters[0]).unwrap();
    assert!(sent.matches(&json!({"collection": "landsat", "private": false})));
    assert!(!sent.matches(&json!({"collection": "landsat", "private": true})));
    assert!(!sent.matches(&json!({"collection": "sentinel", "private": false})));
}

#[tokio::test]
async fn test_invalid_client_filter_is_rejected() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config.default_public = true;
    config.items_filter = Some(template_filter(VISIBILITY_TEMPLATE));
    let router = env.router(config);

    let response = send(&router, request("GET", "/search?filter=AND%20AND", None, None)).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_authenticated_post_search_gets_filter_in_body() {
    let env = TestEnv::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"features": []})))
        .expect(2)
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config
        .private_endpoints
        .insert(r"^/search$".into(), vec![method_spec("POST")]);
    config.items_filter = Some(template_filter(VISIBILITY_TEMPLATE));
    let router = env.router(config);
    let token = env.token(json!({}));

    let response = send(
        &router,
        request("POST", "/search", Some(&token), Some(json!({"collections": ["landsat"]}))),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    let client_filter = json!({"op": "=", "args": [{"property": "collection"}, "landsat"]});
    let response = send(
        &router,
        request(
            "POST",
            "/search",
            Some(&token),
            Some(json!({"filter": client_filter, "limit": 3})),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    let received = env.upstream_requests().await;
    let first = json_body(&received[0]);
    assert_eq!(first["collections"], json!(["landsat"]));
    assert_eq!(first["filter"], json!(true));
    assert_eq!(first["filter-lang"], "cql2-json");

    let second = json_body(&received[1]);
    assert_eq!(second["limit"], 3);
    assert_eq!(second["filter-lang"], "cql2-json");
    assert_eq!(second["filter"]["op"], "and");
    let combined = FilterExpression::from_value(&second["filter"]).unwrap();
    assert!(combined.matches(&json!({"collection": "landsat"})));
    assert!(!combined.matches(&json!({"collection": "sentinel"})));
}

#[tokio::test]
async fn test_search_without_token_is_rejected_when_private() {
    let env = TestEnv::start().await;
    let mut config = env.config();
    config
        .private_endpoints
        .insert(r"^/search$".into(), vec![method_spec("POST")]);
    config.items_filter = Some(template_filter(VISIBILITY_TEMPLATE));
    let router = env.router(config);

    let response = send(&router, request("POST", "/search", None, Some(json!({})))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert!(env.upstream_requests().await.is_empty());
}

#[tokio::test]
async fn test_hidden_record_is_not_found() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/sentinel/items/s2-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "Feature", "id": "s2-1", "collection": "sentinel"
        })))
        .mount(&env.upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/collections/landsat/items/l8-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "Feature", "id": "l8-1", "collection": "landsat"
        })))
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config.default_public = true;
    config.items_filter = Some(template_filter("collection = 'landsat'"));
    let router = env.router(config);

    let hidden = send(&router, request("GET", "/collections/sentinel/items/s2-1", None, None)).await;
    assert_eq!(hidden.status, StatusCode::NOT_FOUND);
    assert_eq!(hidden.body["code"], "NotFound");

    let visible = send(&router, request("GET", "/collections/landsat/items/l8-1", None, None)).await;
    assert_eq!(visible.status, StatusCode::OK);
    assert_eq!(visible.body["id"], "l8-1");
}

#[tokio::test]
async fn test_collections_filter_uses_path_params() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/landsat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "Collection", "id": "landsat"
        })))
        .expect(1)
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config.default_public = true;
    config.collections_filter = Some(template_filter(
        "id = '{{ req.path_params.collection_id }}'",
    ));
    let router = env.router(config);

    let response = send(&router, request("GET", "/collections/landsat", None, None)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["id"], "landsat");
}

#[tokio::test]
async fn test_create_outside_filter_is_rejected() {
    let env = TestEnv::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/sentinel/items"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&env.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/landsat/items"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&env.upstream)
        .await;

    let mut config = env.config();
    config.items_filter = Some(template_filter("collection = 'landsat'"));
    let router = env.router(config);
    let token = env.token(json!({}));

    let rejected = send(
        &router,
        request(
            "POST",
            "/collections/sentinel/items",
            Some(&token),
            Some(json!({"type": "Feature", "id": "s2-9", "collection": "sentinel"})),
        ),
    )
    .await;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);

    let accepted = send(
        &router,
        request(
            "POST",
            "/collections/landsat/items",
            Some(&token),
            Some(json!({"type": "Feature", "id": "l8-9", "collection": "landsat"})),
        ),
    )
    .await;
    assert_eq!(accepted.status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_broken_filter_output_is_bad_gateway() {
    let env = TestEnv::start().await;
    let mut config = env.config();
    config.default_public = true;
    config.items_filter = Some(template_filter("{{ 'AND AND' }}"));
    let router = env.router(config);

    let response = send(&router, request("GET", "/search", None, None)).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert!(env.upstream_requests().await.is_empty());
}

#[tokio::test]
async fn test_slow_lookup_is_bad_gateway() {
    let env = TestEnv::start().await;
    Mock::given(method("GET"))
        .and(path("/permitted"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!(["landsat"]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&env.upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"features": []})))
        .expect(0)
        .mount(&env.upstream)
        .await;

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("timeout".into(), json!(0.1));
    let mut config = env.config();
    config.default_public = true;
    config.items_filter = Some(FilterConfig {
        class: "lookup".into(),
        args: vec![json!(format!("{}/permitted", env.upstream.uri())), json!("collection")],
        kwargs,
    });
    let router = env.router(config);

    let response = send(&router, request("GET", "/search", None, None)).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
}
