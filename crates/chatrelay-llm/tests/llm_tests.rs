//! Tests for chatrelay-llm: types, error classification, and the HTTP clients
//! against an in-process OpenAI-compatible server

use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use chatrelay_core::{LocalRuntimeConfig, Message};
use chatrelay_llm::*;
use serde_json::{json, Value};
use std::path::Path;

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn request(text: &str) -> GenerateRequest {
    GenerateRequest {
        messages: vec![ChatMessage::system("be brief"), ChatMessage::user(text)],
        params: GenerationParams::default(),
    }
}

// ===========================================================================
// Types
// ===========================================================================

#[test]
fn chat_message_from_core_message() {
    let m = Message::assistant("hi there");
    let c = ChatMessage::from(&m);
    assert_eq!(c.role, "assistant");
    assert_eq!(c.content, "hi there");
}

#[test]
fn usage_total() {
    let u = Usage {
        prompt_tokens: 12,
        completion_tokens: 30,
    };
    assert_eq!(u.total(), 42);
}

// ===========================================================================
// LlmError
// ===========================================================================

#[test]
fn transient_errors() {
    assert!(LlmError::Timeout(1000).is_transient());
    assert!(LlmError::RateLimited {
        retry_after_ms: 10
    }
    .is_transient());
    assert!(!LlmError::AuthFailed("nope".into()).is_transient());
    assert!(!LlmError::InvalidResponse("garbage".into()).is_transient());
    assert!(!LlmError::LoadFailed("missing".into()).is_transient());
}

// ===========================================================================
// OpenAiProvider
// ===========================================================================

#[tokio::test]
async fn provider_parses_completion() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["model"], "gpt-test");
            assert_eq!(body["messages"][0]["role"], "system");
            assert_eq!(body["stream"], false);
            Json(json!({
                "choices": [{"message": {"role": "assistant", "content": "pong"}}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 1}
            }))
        }),
    );
    let base = spawn_server(app).await;

    let provider = OpenAiProvider::new("gpt", "gpt-test")
        .with_base_url(format!("{}/v1", base))
        .with_api_key("sk-test");
    assert_eq!(provider.name(), "gpt");

    let generation = provider.generate(request("ping")).await.unwrap();
    assert_eq!(generation.text, "pong");
    assert_eq!(
        generation.usage,
        Some(Usage {
            prompt_tokens: 9,
            completion_tokens: 1
        })
    );
}

#[tokio::test]
async fn provider_maps_rate_limit() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "7")],
                "slow down",
            )
                .into_response()
        }),
    );
    let base = spawn_server(app).await;
    let provider = OpenAiProvider::new("gpt", "gpt-test").with_base_url(format!("{}/v1", base));

    match provider.generate(request("ping")).await {
        Err(LlmError::RateLimited { retry_after_ms }) => assert_eq!(retry_after_ms, 7000),
        other => panic!("Expected RateLimited, got {:?}", other.map(|g| g.text)),
    }
}

#[tokio::test]
async fn provider_saturates_huge_retry_after() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "18446744073709551615")],
                "slow down",
            )
                .into_response()
        }),
    );
    let base = spawn_server(app).await;
    let provider = OpenAiProvider::new("gpt", "gpt-test").with_base_url(format!("{}/v1", base));

    match provider.generate(request("ping")).await {
        Err(LlmError::RateLimited { retry_after_ms }) => assert_eq!(retry_after_ms, u64::MAX),
        other => panic!("Expected RateLimited, got {:?}", other.map(|g| g.text)),
    }
}

#[tokio::test]
async fn provider_maps_auth_failure() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::UNAUTHORIZED, "bad key").into_response() }),
    );
    let base = spawn_server(app).await;
    let provider = OpenAiProvider::new("gpt", "gpt-test").with_base_url(format!("{}/v1", base));

    let err = provider.generate(request("ping")).await.unwrap_err();
    assert!(matches!(err, LlmError::AuthFailed(_)), "{:?}", err);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn provider_rejects_empty_choices() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { Json(json!({"choices": []})) }),
    );
    let base = spawn_server(app).await;
    let provider = OpenAiProvider::new("gpt", "gpt-test").with_base_url(format!("{}/v1", base));

    let err = provider.generate(request("ping")).await.unwrap_err();
    assert!(matches!(err, LlmError::InvalidResponse(_)));
}

#[tokio::test]
async fn provider_unreachable_is_transient() {
    // Nothing listens on port 9 on loopback.
    let provider = OpenAiProvider::new("gpt", "gpt-test").with_base_url("http://127.0.0.1:9/v1");
    let err = provider.generate(request("ping")).await.unwrap_err();
    assert!(err.is_transient(), "{:?}", err);
}

// ===========================================================================
// OpenAiModeration
// ===========================================================================

#[tokio::test]
async fn moderation_keeps_only_flagged_categories() {
    let app = Router::new().route(
        "/v1/moderations",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["input"], "some text");
            Json(json!({
                "results": [{
                    "flagged": true,
                    "categories": {"hate": true, "violence": false},
                    "category_scores": {"hate": 0.93, "violence": 0.02}
                }]
            }))
        }),
    );
    let base = spawn_server(app).await;
    let classifier = OpenAiModeration::new("sk-test").with_base_url(format!("{}/v1", base));

    let c = classifier.classify("some text").await.unwrap();
    assert!(c.flagged);
    assert_eq!(c.categories.len(), 1);
    assert!((c.categories["hate"] - 0.93).abs() < f32::EPSILON);
}

// ===========================================================================
// ProcessRuntime
// ===========================================================================

#[test]
fn process_args_are_rendered() {
    let runtime = ProcessRuntime::new(LocalRuntimeConfig {
        base_port: 18_500,
        ..Default::default()
    });
    let args = runtime.render_args(Path::new("/models/hermes.gguf"), 18_500);
    assert_eq!(
        args,
        vec![
            "-m",
            "/models/hermes.gguf",
            "--host",
            "127.0.0.1",
            "--port",
            "18500"
        ]
    );
}

#[tokio::test]
async fn process_load_missing_artifact_fails() {
    let runtime = ProcessRuntime::new(LocalRuntimeConfig::default());
    let err = runtime
        .load(
            Path::new("/definitely/not/here.gguf"),
            &GenerationParams::default(),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LlmError::LoadFailed(_)));
}

#[tokio::test]
async fn process_load_unknown_command_fails() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("tiny.gguf");
    std::fs::write(&artifact, b"weights").unwrap();

    let runtime = ProcessRuntime::new(LocalRuntimeConfig {
        command: "chatrelay-no-such-inference-binary".into(),
        ..Default::default()
    });
    let err = runtime
        .load(&artifact, &GenerationParams::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LlmError::LoadFailed(_)));
}

#[tokio::test]
async fn process_load_gives_up_on_silent_server() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("tiny.gguf");
    std::fs::write(&artifact, b"weights").unwrap();

    // Accepts connections and never writes a byte back.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let runtime = ProcessRuntime::new(LocalRuntimeConfig {
        command: "sleep".into(),
        args: vec!["30".into()],
        base_port: port,
        port_range: 1,
        startup_timeout_secs: 1,
        ..Default::default()
    });
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        runtime.load(&artifact, &GenerationParams::default()),
    )
    .await
    .expect("load should give up on its own");
    let err = result.err().unwrap();
    assert!(matches!(err, LlmError::LoadFailed(_)), "{:?}", err);
}
