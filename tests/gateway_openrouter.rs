use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use level_balance::gateway::openrouter::{ChatProvider, EmbeddingProvider, OpenRouterAdapter};
use level_balance::gateway::{
    Attribution, ChatModel, ChatRequest, EmbedRequest, FinishReason, GatewayConfig, Message,
    ProviderError, ProviderGateway,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn chat_request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter("openai/gpt-4o-mini"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    )
}

#[tokio::test]
async fn chat_parses_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&chat_request()).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
}

#[tokio::test]
async fn json_mode_sets_response_format_and_falls_back_to_tool_arguments() {
    let server = MockServer::start().await;
    let args = r#"{"suggestions": [], "overall_strategy": "keep"}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&chat_request().json()).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    assert_eq!(resp.input_tokens, 0);
}

#[tokio::test]
async fn chat_detects_refusal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot comply with that request." },
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&chat_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn http_429_is_rate_limited_with_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&chat_request()).await.unwrap_err();
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
            assert_eq!(context.http_status, Some(429));
            assert_eq!(context.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(context.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn numeric_error_codes_are_kept() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&chat_request()).await.unwrap_err();
    match err {
        ProviderError::InvalidRequest { message, context } => {
            assert_eq!(message, "bad model");
            assert_eq!(context.unwrap().provider_code.as_deref(), Some("400"));
        }
        other => panic!("expected InvalidRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn embeddings_are_returned_in_index_order() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({
            "model": "openai/text-embedding-3-small",
            "input": ["first", "second"],
            "dimensions": 3
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                { "index": 0, "embedding": [1.0, 0.0, 0.0] }
            ],
            "usage": { "prompt_tokens": 4 }
        })))
        .mount(&server)
        .await;

    let req = EmbedRequest::new(
        "openai/text-embedding-3-small",
        vec!["first".into(), "second".into()],
        Attribution::new("test"),
    )
    .dimensions(3);
    let resp = adapter(&server).embed(&req).await.unwrap();
    assert_eq!(resp.embeddings, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
    assert_eq!(resp.input_tokens, 4);
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn gateway_retries_retryable_errors() {
    let server = MockServer::start().await;

    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "data": [{ "index": 0, "embedding": [0.5, 0.5] }]
    }));

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first,
            second,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let req = EmbedRequest::new("m", vec!["x".into()], Attribution::new("test"));
    let resp = gateway.embed(req).await.unwrap();
    assert_eq!(resp.embeddings.len(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn gateway_does_not_retry_invalid_requests() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": { "message": "unprocessable" }
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let err = gateway.chat(chat_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn gateway_waits_for_the_server_retry_hint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first: ResponseTemplate::new(429).insert_header("retry-after", "0"),
            second: ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "ok" }, "finish_reason": "stop" }]
            })),
        })
        .mount(&server)
        .await;

    // Exponential backoff alone would sleep a minute here.
    let gateway = ProviderGateway::with_config(
        adapter(&server),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_secs(60),
        },
    );

    let resp = tokio::time::timeout(Duration::from_secs(5), gateway.chat(chat_request()))
        .await
        .expect("retry ignored the Retry-After hint")
        .unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rate_limit_without_hint_and_in_body_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "message": "upstream overloaded", "code": 502 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&chat_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { retry_after: None, .. }));

    let req = EmbedRequest::new("m", vec!["x".into()], Attribution::new("test"));
    let err = adapter(&server).embed(&req).await.unwrap_err();
    match &err {
        ProviderError::Upstream { message, context } => {
            assert_eq!(message, "upstream overloaded");
            assert_eq!(context.http_status, Some(502));
            assert_eq!(context.provider_code.as_deref(), Some("502"));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
    assert!(err.is_retryable());
}
