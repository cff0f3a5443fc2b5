use crate::helpers;
use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn bare_nested_array_is_coerced_to_openai_list() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!([[0.1, 0.2], [0.3, 0.4]])),
        )
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "embed-small",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/embeddings")
        .add_header("Authorization", helpers::bearer())
        .json(&serde_json::json!({
            "model": "embed-small",
            "input": ["first", "second"]
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    assert_eq!(body["model"], "embed-small");
    assert_eq!(body["data"][0]["object"], "embedding");
    assert_eq!(body["data"][0]["index"], 0);
    assert_eq!(body["data"][1]["index"], 1);
    assert_eq!(body["data"][1]["embedding"][0], 0.3);
    assert!(body["usage"].is_object());
}

#[tokio::test]
async fn single_string_input_yields_single_element_list() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embedding": [0.5, 0.6, 0.7]
        })))
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "embed-small",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/embeddings")
        .add_header("Authorization", helpers::bearer())
        .json(&serde_json::json!({"model": "embed-small", "input": "just one"}))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_input_is_invalid_request() {
    let upstream = MockServer::start().await;
    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "embed-small",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/embeddings")
        .add_header("Authorization", helpers::bearer())
        .json(&serde_json::json!({"model": "embed-small", "input": []}))
        .await;

    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "invalid_request");
}
