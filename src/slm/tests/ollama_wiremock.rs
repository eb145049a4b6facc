//! Integration tests for the Ollama client against a mocked HTTP API
//!
//! The client is blocking, so each call runs on tokio's blocking pool while
//! the mock server keeps serving on the async side.

use std::time::Duration;

use slm_client::{BackendError, EmbeddingBackend, InferenceBackend, InferenceConfig, OllamaClient};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn config_for_mock(base_url: &str) -> InferenceConfig {
    InferenceConfig {
        base_url: base_url.to_string(),
        model: "test-model".to_string(),
        embedding_model: "test-embed".to_string(),
        timeout_ms: 2000,
        ..InferenceConfig::default()
    }
}

/// Build the client and run `f` off the async runtime
async fn with_client<T, F>(config: InferenceConfig, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&OllamaClient) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let client = OllamaClient::new(config).unwrap();
        f(&client)
    })
    .await
    .unwrap()
}

fn generate_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "test-model",
        "response": text,
        "done": true
    })
}

#[tokio::test]
async fn generate_returns_model_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({
            "model": "test-model",
            "stream": false,
            "options": {"seed": 42}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_response(
            "Decision: Valid\nPrimary Violation: None\nExplanation: First-hand visit.",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| c.infer("classify this")).await;

    let text = result.unwrap();
    assert!(text.starts_with("Decision: Valid"));
}

#[tokio::test]
async fn generate_empty_response_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_response("   ")))
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| c.infer("prompt")).await;

    assert_eq!(result, Err(BackendError::EmptyResponse));
}

#[tokio::test]
async fn generate_timeout_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(generate_response("late"))
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;

    let config = InferenceConfig {
        timeout_ms: 200,
        ..config_for_mock(&server.uri())
    };
    let result = with_client(config, |c| c.infer("prompt")).await;

    let err = result.unwrap_err();
    assert_eq!(err, BackendError::Timeout { timeout_ms: 200 });
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_model_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(serde_json::json!({"error": "model 'test-model' not found"})),
        )
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| c.infer("prompt")).await;

    let err = result.unwrap_err();
    assert!(matches!(err, BackendError::ModelNotAvailable(ref body) if body.contains("not found")));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn server_error_is_per_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| c.infer("prompt")).await;

    let err = result.unwrap_err();
    assert!(matches!(err, BackendError::ServerError(ref msg) if msg.contains("out of memory")));
    assert!(!err.is_fatal());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    // Nothing listens on the discard port.
    let config = config_for_mock("http://127.0.0.1:9");
    let result = with_client(config, |c| c.infer("prompt")).await;

    let err = result.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)), "got {err:?}");
}

#[tokio::test]
async fn embed_returns_vectors_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"model": "test-embed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[1.0, 0.0], [0.0, 1.0]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| {
        c.embed_batch(&["first".to_string(), "second".to_string()])
    })
    .await;

    assert_eq!(result.unwrap(), vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}

#[tokio::test]
async fn embed_count_mismatch_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[1.0, 0.0]]
        })))
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| {
        c.embed_batch(&["a".to_string(), "b".to_string()])
    })
    .await;

    assert!(matches!(result, Err(BackendError::InvalidResponse(_))));
}

#[tokio::test]
async fn embed_single_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[0.5, 0.5, 0.0]]
        })))
        .mount(&server)
        .await;

    let result = with_client(config_for_mock(&server.uri()), |c| c.embed("hello")).await;

    assert_eq!(result.unwrap(), vec![0.5, 0.5, 0.0]);
}
