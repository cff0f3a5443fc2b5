use crate::helpers;
use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn request_quota_exhaustion_returns_429_with_retry_after() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("ok")),
        )
        .mount(&upstream)
        .await;

    // Five requests a minute; the sixth trips the ring.
    let gateway = helpers::gateway_with(
        vec![helpers::http_provider(
            "primary",
            10,
            upstream.uri(),
            "gpt-3.5-turbo",
        )],
        5,
        1_000_000,
    )
    .await;

    for _ in 0..5 {
        let response = gateway
            .server
            .post("/v1/chat/completions")
            .add_header("Authorization", helpers::bearer())
            .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
        .await;

    assert_eq!(response.status_code(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after <= 60);

    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert!(body["error"]["details"]["retry_after"].is_number());
}

#[tokio::test]
async fn token_budget_exhaustion_returns_429() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("ok")),
        )
        .mount(&upstream)
        .await;

    // A tiny token budget: the pre-charge for a large max_tokens request
    // overdraws immediately.
    let gateway = helpers::gateway_with(
        vec![helpers::http_provider(
            "primary",
            10,
            upstream.uri(),
            "gpt-3.5-turbo",
        )],
        600,
        100,
    )
    .await;

    let mut body = helpers::chat_body("gpt-3.5-turbo", "hi");
    body["max_tokens"] = serde_json::json!(4000);
    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&body)
        .await;

    assert_eq!(response.status_code(), 429);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn reconciliation_returns_unused_budget() {
    let upstream = MockServer::start().await;
    // Upstream reports 7 actual tokens per call, far below the estimate.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("ok")),
        )
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway_with(
        vec![helpers::http_provider(
            "primary",
            10,
            upstream.uri(),
            "gpt-3.5-turbo",
        )],
        600,
        // Room for one pre-charge (~530) but not two without reconcile.
        600,
    )
    .await;

    for _ in 0..2 {
        let response = gateway
            .server
            .post("/v1/chat/completions")
            .add_header("Authorization", helpers::bearer())
            .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
            .await;
        assert_eq!(response.status_code(), 200);
    }
}
