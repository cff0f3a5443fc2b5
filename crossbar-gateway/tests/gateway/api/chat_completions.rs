use crate::helpers;
use crossbar_gateway::store::ProviderStore;
use serde_json::Value;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn happy_chat_returns_openai_envelope() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(
            serde_json::json!({"model": "internal-gpt-3.5-turbo"}),
        ))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("hello there")),
        )
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["object"], "chat.completion");
    // The external model id comes back even though the upstream saw the
    // internal one.
    assert_eq!(body["model"], "gpt-3.5-turbo");
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
    assert!(body["usage"]["total_tokens"].is_number());
}

#[tokio::test]
async fn fallback_serves_from_secondary_on_transient_failure() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&primary)
        .await;
    let secondary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("from backup")),
        )
        .mount(&secondary)
        .await;

    let gateway = helpers::gateway(vec![
        helpers::http_provider("primary", 10, primary.uri(), "gpt-3.5-turbo"),
        helpers::http_provider("secondary", 5, secondary.uri(), "gpt-3.5-turbo"),
    ])
    .await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "from backup");
    assert_eq!(primary.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_model_is_404_with_envelope() {
    let gateway = helpers::gateway(vec![]).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("no-such-model", "hi"))
        .await;

    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "model_not_found");
    assert!(body["error"]["request_id"].as_str().unwrap().starts_with("req_"));
}

#[tokio::test]
async fn empty_messages_is_invalid_request() {
    let upstream = MockServer::start().await;
    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&serde_json::json!({"model": "gpt-3.5-turbo", "messages": []}))
        .await;

    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn streaming_emits_sse_frames_with_done_sentinel() {
    let upstream = MockServer::start().await;
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"str\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"eam\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n"
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let mut request_body = helpers::chat_body("gpt-3.5-turbo", "hi");
    request_body["stream"] = serde_json::json!(true);
    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&request_body)
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let text = response.text();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .collect();
    assert!(frames.len() >= 3);
    assert!(frames.iter().all(|f| f.starts_with("data: ")));
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    // Chunk order and the external model id on every frame.
    let payloads: Vec<Value> = frames
        .iter()
        .filter(|f| *f != &"data: [DONE]")
        .map(|f| serde_json::from_str(f.trim_start_matches("data: ")).unwrap())
        .collect();
    let contents: String = payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(contents, "stream");
    assert!(payloads.iter().all(|p| p["model"] == "gpt-3.5-turbo"));
    let ids: Vec<&str> = payloads.iter().filter_map(|p| p["id"].as_str()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn cli_echo_proves_stdin_delivery() {
    let gateway = helpers::gateway(vec![helpers::cli_echo_provider("echo", "echo-model")]).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("echo-model", "over stdin"))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "echo-model");

    // `cat` echoes stdin, so the content is the serialized request that
    // was piped in; the caller's text appears inside it, not in argv.
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    let echoed: Value = serde_json::from_str(content).unwrap();
    assert_eq!(echoed["messages"][0]["content"], "over stdin");
}

#[tokio::test]
async fn usage_is_recorded_against_the_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("ok")),
        )
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
        .await;
    assert_eq!(response.status_code(), 200);

    // The recorder drains asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let key = gateway
        .store
        .get_api_key_by_hash(&crossbar_gateway::auth::lookup_hash(helpers::TEST_KEY))
        .await
        .unwrap()
        .unwrap();
    let usage = gateway.store.usage_of(&key.id);
    assert_eq!(usage.total_requests, 1);
    // The stub reports 7 total tokens.
    assert_eq!(usage.total_tokens, 7);
    assert!(usage.last_used.is_some());
}

#[tokio::test]
async fn response_carries_the_request_id_header() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(helpers::openai_chat_response("ok")),
        )
        .mount(&upstream)
        .await;

    let gateway = helpers::gateway(vec![helpers::http_provider(
        "primary",
        10,
        upstream.uri(),
        "gpt-3.5-turbo",
    )])
    .await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .add_header("Authorization", helpers::bearer())
        .json(&helpers::chat_body("gpt-3.5-turbo", "hi"))
        .await;
    let request_id = response.headers().get("x-request-id").unwrap();
    assert!(request_id.to_str().unwrap().starts_with("req_"));
}
