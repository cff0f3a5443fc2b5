use crate::helpers;
use serde_json::Value;
use wiremock::MockServer;

#[tokio::test]
async fn models_lists_the_union_of_enabled_providers() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let gateway = helpers::gateway(vec![
        helpers::http_provider("a", 10, a.uri(), "gpt-3.5-turbo"),
        helpers::http_provider("b", 5, b.uri(), "embed-small"),
    ])
    .await;

    let response = gateway
        .server
        .get("/v1/models")
        .add_header("Authorization", helpers::bearer())
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["embed-small", "gpt-3.5-turbo"]);
    assert!(body["data"][0]["object"] == "model");
}

#[tokio::test]
async fn healthz_and_ready_report_status() {
    let upstream = MockServer::start().await;
    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let health = gateway.server.get("/healthz").await;
    assert_eq!(health.status_code(), 200);
    let body: Value = health.json();
    assert_eq!(body["status"], "ok");

    let ready = gateway.server.get("/ready").await;
    assert_eq!(ready.status_code(), 200);
}

#[tokio::test]
async fn ready_is_503_without_enabled_providers() {
    let gateway = helpers::gateway(vec![]).await;
    let ready = gateway.server.get("/ready").await;
    assert_eq!(ready.status_code(), 503);
}

#[tokio::test]
async fn metrics_render_prometheus_text() {
    let upstream = MockServer::start().await;
    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let response = gateway.server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);
    let text = response.text();
    assert!(text.contains("crossbar_requests_total"));
    assert!(text.contains("crossbar_uptime_seconds"));
}
