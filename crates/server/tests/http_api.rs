//! End-to-end tests driving the router in-process

use anyhow::anyhow;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use batchloop_common::{ApiSpec, RoutineKind, ServerConfig};
use batchloop_server::routines::{self, SquareCodec, FIXED_REPLY, STREAM_STEPS};
use batchloop_server::{build_router, Engine, CHAT_COMPLETIONS_PATH};
use batchloop_worker::{
    Backend, PredictResult, Predictor, PredictorFactory, StepStream, StreamingPredictor,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn config(
    spec: ApiSpec,
    routine: RoutineKind,
    max_batch_size: usize,
    batch_timeout_ms: u64,
) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.api.spec = spec;
    config.api.routine = routine;
    config.batching.max_batch_size = max_batch_size;
    config.batching.batch_timeout_ms = batch_timeout_ms;
    config
}

async fn start(config: &ServerConfig) -> (Router, Arc<Engine>) {
    let (factory, codec) = routines::build(config.api.routine);
    let engine = Engine::start(config, factory, codec).await.unwrap();
    (build_router(engine.clone(), config), engine)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn chat_request(stream: bool) -> Value {
    json!({
        "model": "lit",
        "messages": [
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "Hello there"}
        ],
        "stream": stream
    })
}

/// `data:` payloads of an SSE body, in order
fn sse_payloads(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|event| {
            event
                .lines()
                .find_map(|line| line.strip_prefix("data:"))
                .map(|data| data.trim().to_string())
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_square_returns_output() {
    let (app, engine) = start(&config(ApiSpec::Plain, RoutineKind::Square, 1, 0)).await;

    let (status, body) = send(&app, post_json("/predict", &json!({"input": 4.0}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"output": 16.0}));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_square_under_concurrency() {
    let mut config = config(ApiSpec::Plain, RoutineKind::BatchedSquare, 4, 50);
    config.workers.num_workers = 2;
    let (app, engine) = start(&config).await;

    let requests = (0..12).map(|i| {
        let app = app.clone();
        tokio::spawn(async move {
            let (status, body) =
                send(&app, post_json("/predict", &json!({"input": i as f64}))).await;
            (i, status, body)
        })
    });

    for handle in futures::future::join_all(requests).await {
        let (i, status, body) = handle.unwrap();
        assert_eq!(status, StatusCode::OK);
        let expected = (i * i) as f64;
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"output": expected}));
    }

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_square_writes_ndjson() {
    let (app, engine) = start(&config(ApiSpec::Plain, RoutineKind::StreamingSquare, 4, 10)).await;

    let response = app
        .clone()
        .oneshot(post_json("/predict", &json!({"input": 4.0})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let objects: Vec<Value> = String::from_utf8(body.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(objects.len(), STREAM_STEPS);
    assert!(objects.contains(&json!({"output": 16.0})));
    assert_eq!(objects.last(), Some(&json!({"output": 16.0})));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_streams_stay_ordered_per_connection() {
    let config = config(ApiSpec::Plain, RoutineKind::StreamingSquare, 4, 200);
    let (app, engine) = start(&config).await;

    let requests = (1..=4).map(|i| {
        let app = app.clone();
        tokio::spawn(async move {
            let x = i as f64;
            let (status, body) = send(&app, post_json("/predict", &json!({"input": x}))).await;
            (x, status, body)
        })
    });

    for handle in futures::future::join_all(requests).await {
        let (x, status, body) = handle.unwrap();
        assert_eq!(status, StatusCode::OK);

        let outputs: Vec<f64> = body
            .lines()
            .map(|line| {
                let object: Value = serde_json::from_str(line).unwrap();
                object["output"].as_f64().unwrap()
            })
            .collect();

        assert_eq!(outputs.len(), STREAM_STEPS, "input {}", x);
        assert!(outputs.windows(2).all(|pair| pair[0] < pair[1]), "input {}", x);
        assert_eq!(outputs.last(), Some(&(x * x)));
    }

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_input_is_rejected() {
    let (app, engine) = start(&config(ApiSpec::Plain, RoutineKind::Square, 1, 0)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .body(Body::from("not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let (status, _) = send(&app, post_json("/predict", &json!({"input": "four"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The pool is unaffected
    let (status, _) = send(&app, post_json("/predict", &json!({"input": 2.0}))).await;
    assert_eq!(status, StatusCode::OK);

    engine.shutdown().await;
}

/// Fails on negative inputs, squares everything else
struct NoNegatives;

impl Predictor for NoNegatives {
    fn predict(&mut self, input: Value) -> PredictResult<Value> {
        let x = input.as_f64().ok_or_else(|| anyhow!("not a number"))?;
        if x < 0.0 {
            return Err(anyhow!("negative input"));
        }
        Ok(json!(x * x))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prediction_failure_then_recovery() {
    let config = config(ApiSpec::Plain, RoutineKind::Square, 1, 0);
    let factory: PredictorFactory = Arc::new(|_: usize| Backend::blocking(NoNegatives));
    let engine = Engine::start(&config, factory, Arc::new(SquareCodec)).await.unwrap();
    let app = build_router(engine.clone(), &config);

    let (status, body) = send(&app, post_json("/predict", &json!({"input": -1.0}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("negative input"));

    let (status, body) = send(&app, post_json("/predict", &json!({"input": 3.0}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"output": 9.0}));

    engine.shutdown().await;
}

/// Emits one chunk, then fails
struct BreaksMidStream;

impl StreamingPredictor for BreaksMidStream {
    fn predict_stream<'a>(
        &'a mut self,
        inputs: Vec<Value>,
    ) -> PredictResult<Box<dyn StepStream + 'a>> {
        let size = inputs.len();
        let steps: Vec<PredictResult<Vec<Option<Value>>>> = vec![
            Ok(vec![Some(json!(1.0)); size]),
            Err(anyhow!("device lost")),
        ];
        Ok(Box::new(steps.into_iter()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_failure_keeps_sent_lines_intact() {
    let config = config(ApiSpec::Plain, RoutineKind::StreamingSquare, 1, 0);
    let factory: PredictorFactory = Arc::new(|_: usize| Backend::streaming(BreaksMidStream));
    let engine = Engine::start(&config, factory, Arc::new(SquareCodec)).await.unwrap();
    let app = build_router(engine.clone(), &config);

    let (status, body) = send(&app, post_json("/predict", &json!({"input": 4.0}))).await;
    assert_eq!(status, StatusCode::OK);

    let lines: Vec<Value> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], json!({"output": 1.0}));
    assert!(lines[1]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("device lost"));

    engine.shutdown().await;
}

struct Sleepy;

impl Predictor for Sleepy {
    fn predict(&mut self, input: Value) -> PredictResult<Value> {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(input)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_timeout() {
    let mut config = config(ApiSpec::Plain, RoutineKind::Square, 1, 0);
    config.api.request_timeout_secs = Some(1);
    let factory: PredictorFactory = Arc::new(|_: usize| Backend::blocking(Sleepy));
    let engine = Engine::start(&config, factory, Arc::new(SquareCodec)).await.unwrap();
    let app = build_router(engine.clone(), &config);

    let (status, _) = send(&app, post_json("/predict", &json!({"input": 1.0}))).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_completion() {
    let (app, engine) = start(&config(ApiSpec::OpenAi, RoutineKind::FixedReply, 1, 0)).await;

    let (status, body) = send(&app, post_json(CHAT_COMPLETIONS_PATH, &chat_request(false))).await;
    assert_eq!(status, StatusCode::OK);

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "lit");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"].as_array().unwrap().len(), 1);
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], FIXED_REPLY);
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_completion_with_images() {
    let (app, engine) = start(&config(ApiSpec::OpenAi, RoutineKind::FixedReply, 1, 0)).await;

    let request = json!({
        "model": "lit",
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "What is in this image?"},
                {
                    "type": "image_url",
                    "image_url": {"url": "https://example.com/cat.jpg", "detail": "low"}
                },
                {"type": "image_url", "image_url": "data:image/png;base64,iVBORw0KGgo="}
            ]
        }],
        "temperature": 0.2,
        "max_tokens": 16,
        "stop": ["\n"]
    });
    let (status, body) = send(&app, post_json(CHAT_COMPLETIONS_PATH, &request)).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], FIXED_REPLY);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_completion_stream() {
    let (app, engine) = start(&config(ApiSpec::OpenAi, RoutineKind::FixedReply, 1, 0)).await;

    let (status, body) = send(&app, post_json(CHAT_COMPLETIONS_PATH, &chat_request(true))).await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 3, "unexpected events: {:?}", payloads);
    assert_eq!(payloads[2], "[DONE]");

    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    let last: Value = serde_json::from_str(&payloads[1]).unwrap();

    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], FIXED_REPLY);
    assert_eq!(last["choices"][0]["delta"]["content"], Value::Null);
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(first["id"], last["id"]);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_rejects_invalid_request() {
    let (app, engine) = start(&config(ApiSpec::OpenAi, RoutineKind::FixedReply, 1, 0)).await;

    let (status, _) = send(&app, post_json(CHAT_COMPLETIONS_PATH, &json!({"model": "lit"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(CHAT_COMPLETIONS_PATH, &json!({"model": "lit", "messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_routes_follow_api_spec() {
    let (app, engine) = start(&config(ApiSpec::Plain, RoutineKind::Square, 1, 0)).await;

    let (status, _) = send(&app, post_json(CHAT_COMPLETIONS_PATH, &chat_request(false))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_and_metrics() {
    let (app, engine) = start(&config(ApiSpec::Plain, RoutineKind::Square, 1, 0)).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    send(&app, post_json("/predict", &json!({"input": 1.0}))).await;

    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("batchloop_requests_total"));
    assert!(body.contains("batchloop_batch_size"));

    engine.shutdown().await;

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_after_shutdown_are_unavailable() {
    let (app, engine) = start(&config(ApiSpec::Plain, RoutineKind::Square, 1, 0)).await;
    engine.shutdown().await;

    let (status, _) = send(&app, post_json("/predict", &json!({"input": 1.0}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
