use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use sokhan_llm::{
    AbortReason, BackendConfig, ChatBackend, ChatRequest, HistoryBackend, HttpBackend,
    ModelParameters, NewChatRequest, ServerError, StreamEvent,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> HttpBackend {
    HttpBackend::new(BackendConfig::new(server.uri()).with_api_key("secret"))
        .expect("backend builds for mock server")
}

#[tokio::test]
async fn stream_request_posts_chat_body_and_decodes_frames() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "text": "hello",
            "chatId": "c1",
            "modelType": "deepseek-r1",
            "webSearch": false,
            "reasoning": true,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                "data: {\"type\":\"reasoning\",\"content\":\"thinking...\"}\n",
                "data: {\"content\":\"answer\"}\n",
                "data: [DONE]\n",
            ),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let parameters = ModelParameters::new("deepseek-r1").with_reasoning(true);
    let request = ChatRequest::new("c1", "hello", &parameters);
    let events = backend_for(&server)
        .open_stream(request)
        .await
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Reasoning("thinking...".to_string()),
            StreamEvent::Content("answer".to_string()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn rejected_stream_with_error_body_becomes_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": "no credit",
            "errorType": "no_credit",
            "remainingCredit": 0,
        })))
        .mount(&server)
        .await;

    let request = ChatRequest::new("c1", "hello", &ModelParameters::default());
    let events = backend_for(&server)
        .open_stream(request)
        .await
        .collect::<Vec<_>>()
        .await;

    let mut expected = ServerError::new("no credit").with_error_type("no_credit");
    expected.remaining_credit = Some(0.0);
    assert_eq!(events, vec![StreamEvent::Error(expected)]);
}

#[tokio::test]
async fn rejected_stream_without_error_body_is_a_transport_abort() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let request = ChatRequest::new("c1", "hello", &ModelParameters::default());
    let events = backend_for(&server)
        .open_stream(request)
        .await
        .collect::<Vec<_>>()
        .await;

    let [StreamEvent::Aborted(AbortReason::Transport(message))] = events.as_slice() else {
        panic!("expected a transport abort, got {events:?}");
    };
    assert!(message.contains("502"), "{message}");
}

#[tokio::test]
async fn create_chat_returns_trimmed_identifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/new"))
        .and(body_partial_json(json!({ "title": "سلام" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "chatId": " c42 " })))
        .expect(1)
        .mount(&server)
        .await;

    let chat_id = backend_for(&server)
        .create_chat(NewChatRequest {
            title: "سلام".to_string(),
            model_type: "gpt-4o-mini".to_string(),
        })
        .await
        .expect("chat is created");

    assert_eq!(chat_id, "c42");
}

#[tokio::test]
async fn history_accepts_wrapped_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chat/c1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                { "id": "m1", "sender": "user", "text": "hello" },
                { "id": "m2", "sender": "ai", "text": "hi", "reason": "greeting" },
            ]
        })))
        .mount(&server)
        .await;

    let rows = backend_for(&server)
        .fetch_messages("c1")
        .await
        .expect("history loads");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].reason.as_deref(), Some("greeting"));
    assert_eq!(rows[0].file_url, None);
}

#[tokio::test]
async fn history_status_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chat/missing/messages"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let error = backend_for(&server)
        .fetch_messages("missing")
        .await
        .expect_err("missing chat fails");

    assert!(error.to_string().contains("404"), "{error}");
}
