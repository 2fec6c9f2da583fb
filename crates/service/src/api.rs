//! HTTP Ingress
//!
//! Proof, verified-RPC, and proxy endpoints plus the administrative
//! surface. Proof answers leave as the binary envelope; every error path
//! degrades to a JSON body with a mapped status code.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gateway_engine::{
    BodyEncoding, CancelToken, DataRequest, GatewayError, HttpVerb, ProofContext, RequestKind,
};
use gateway_proofs::{program_for, verify_and_extract};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const OPENAPI_YAML: &str = include_str!("../assets/openapi.yaml");
const CONFIG_HTML: &str = include_str!("../assets/config.html");

/// Build the gateway router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/proof", post(proof))
        .route("/rpc", post(rpc))
        .route("/unverified_rpc", post(unverified_rpc))
        .route("/eth/{*rest}", get(beacon_proxy))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/openapi.yaml", get(openapi))
        .route("/config", get(config_get).post(config_post))
        .route("/config.html", get(config_html))
        .route("/api/restart", post(restart))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Inbound JSON-RPC call shape.
#[derive(Debug, Deserialize)]
struct RpcCall {
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

fn parse_call(body: &[u8]) -> Result<RpcCall, Response> {
    serde_json::from_slice::<RpcCall>(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("malformed request: {e}")})),
        )
            .into_response()
    })
}

async fn run_program(state: &AppState, call: &RpcCall) -> Result<Vec<u8>, GatewayError> {
    let mut program = program_for(&call.method, &call.params, state.chain_id())?;
    let mut ctx = ProofContext::new(
        call.method.clone(),
        call.params.clone(),
        state.chain_id(),
        state.request_deadline(),
        CancelToken::new(),
    );
    state.runner().run(program.as_mut(), &mut ctx).await
}

fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// `POST /proof` — binary proof envelope.
async fn proof(State(state): State<AppState>, body: Bytes) -> Response {
    let call = match parse_call(&body) {
        Ok(call) => call,
        Err(response) => return response,
    };
    match run_program(&state, &call).await {
        Ok(envelope) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            envelope,
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /rpc` — proof built, verified locally, result surfaced as JSON.
async fn rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let call = match parse_call(&body) {
        Ok(call) => call,
        Err(response) => return response,
    };
    let id = call.id.clone();
    let verified = match run_program(&state, &call).await {
        Ok(envelope) => verify_and_extract(state.verifier(), &envelope, &call.method),
        Err(err) => Err(err),
    };
    match verified {
        Ok(result) => Json(json!({"id": id, "result": result})).into_response(),
        Err(err) => {
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({"id": id, "error": err.to_string()}))).into_response()
        }
    }
}

/// `POST /unverified_rpc` — transparent proxy to an execution upstream.
async fn unverified_rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let method = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("method").and_then(Value::as_str).map(String::from));
    let dr = DataRequest {
        kind: RequestKind::EthRpc,
        verb: HttpVerb::Post,
        path: String::new(),
        payload: Some(body.to_vec()),
        encoding: BodyEncoding::Json,
        rpc_method: method,
        ttl: Some(Duration::ZERO),
        preferred_flags: 0,
        min_block: None,
    };
    match state.engine().fetch(&dr).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// `GET /eth/...` — transparent beacon proxy.
async fn beacon_proxy(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let path = match &query {
        Some(query) => format!("eth/{rest}?{query}"),
        None => format!("eth/{rest}"),
    };
    let dr = DataRequest::beacon_get(&path, BodyEncoding::Json);
    match state.engine().fetch(&dr).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Prometheus text exposition.
async fn metrics(State(state): State<AppState>) -> String {
    // refresh point-in-time gauges before rendering
    for snapshot in state.engine().registry().snapshot() {
        metrics::gauge!(
            "gateway_upstream_healthy",
            "pool" => snapshot.kind, "url" => snapshot.url.clone()
        )
        .set(if snapshot.healthy { 1.0 } else { 0.0 });
        metrics::gauge!(
            "gateway_upstream_inflight",
            "pool" => snapshot.kind, "url" => snapshot.url.clone()
        )
        .set(f64::from(snapshot.inflight));
        metrics::gauge!(
            "gateway_upstream_max_concurrency",
            "pool" => snapshot.kind, "url" => snapshot.url.clone()
        )
        .set(f64::from(snapshot.max_concurrency));
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(
            "gateway_upstream_latest_block",
            "pool" => snapshot.kind, "url" => snapshot.url
        )
        .set(snapshot.latest_block as f64);
    }
    let cache = state.engine().cache().stats();
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!("gateway_cache_entries").set(cache.entries as f64);

    match state.prometheus() {
        Some(handle) => handle.render(),
        // recorder not installed (tests): minimal hand-rendered exposition
        None => format!(
            "# TYPE gateway_cache_entries gauge\ngateway_cache_entries {}\n",
            cache.entries
        ),
    }
}

/// `GET /status` — operational snapshot.
async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "chain_id": state.chain_id(),
        "uptime_secs": state.uptime_secs(),
        "beacon_events": state.consumer_state(),
        "head": state.head_snapshot(),
        "upstreams": state.engine().registry().snapshot(),
        "cache": state.engine().cache().stats(),
    }))
}

/// Health: at least one healthy upstream per configured pool.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let snapshots = state.engine().registry().snapshot();
    let degraded = !snapshots.is_empty() && !snapshots.iter().any(|s| s.healthy);
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({"status": if degraded { "degraded" } else { "healthy" }})),
    )
}

async fn openapi() -> ([(header::HeaderName, &'static str); 1], &'static str) {
    ([(header::CONTENT_TYPE, "application/yaml")], OPENAPI_YAML)
}

async fn config_get(State(state): State<AppState>) -> Json<Value> {
    Json(state.config_snapshot())
}

async fn config_post(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match state.apply_config(&body) {
        Ok(applied) => Json(json!({
            "applied": applied,
            "note": "changes take effect after restart",
        }))
        .into_response(),
        Err(message) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": message})),
        )
            .into_response(),
    }
}

async fn config_html() -> Html<&'static str> {
    Html(CONFIG_HTML)
}

async fn restart(State(state): State<AppState>) -> Json<Value> {
    state.request_restart();
    Json(json!({"status": "restarting"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use clap::Parser;
    use gateway_engine::{
        flags, CacheConfig, CoalescingCache, DispatchConfig, Dispatcher, Engine, ProofRunner,
        RegistryConfig, RunnerConfig, Upstream, UpstreamRegistry,
    };
    use gateway_proofs::StructuralEnvelopeVerifier;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_state(rpc: &MockServer, beacon: &MockServer) -> AppState {
        let args = crate::config::Args::try_parse_from([
            "stateless-gateway",
            "--rpc-nodes",
            &rpc.uri(),
            "--beacon-nodes",
            &beacon.uri(),
        ])
        .unwrap();
        let config = args.registry_config();
        let eth = vec![Upstream::new(rpc.uri(), 0, &config)];
        let bc = vec![Upstream::new(beacon.uri(), flags::EVENT_SOURCE, &config)];
        let registry = Arc::new(UpstreamRegistry::new(config, eth, bc, Vec::new()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), DispatchConfig::default()).unwrap();
        let engine = Engine::new(
            registry,
            CoalescingCache::new(CacheConfig::default()),
            dispatcher,
            None,
        );
        let runner = ProofRunner::new(Arc::clone(&engine), None, RunnerConfig::default());
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        AppState::new(
            engine,
            runner,
            Arc::new(StructuralEnvelopeVerifier),
            args,
            None,
            None,
            None,
            shutdown_tx,
        )
    }

    fn proof_result_body() -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "balance": "0xa",
                "nonce": "0x0",
                "codeHash": format!("0x{}", "00".repeat(32)),
                "storageHash": format!("0x{}", "00".repeat(32)),
                "accountProof": ["0x01"],
                "storageProof": []
            }
        })
        .to_string()
    }

    fn head_block_body() -> String {
        json!({
            "version": "deneb",
            "data": {
                "message": {
                    "slot": "64",
                    "parent_root": "0x00",
                    "body": {
                        "execution_payload": { "block_number": "1", "block_hash": "0x00" }
                    }
                }
            }
        })
        .to_string()
    }

    async fn mount_proof_upstreams(rpc: &MockServer, beacon: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getProof"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(proof_result_body()))
            .mount(rpc)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v2/beacon/blocks/head"))
            .respond_with(ResponseTemplate::new(200).set_body_string(head_block_body()))
            .mount(beacon)
            .await;
    }

    #[tokio::test]
    async fn proof_endpoint_emits_balance_envelope() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        mount_proof_upstreams(&rpc, &beacon).await;
        let router = create_router(test_state(&rpc, &beacon).await);

        let body = json!({
            "method": "eth_getBalance",
            "params": [format!("0x{}", "00".repeat(20)), {"block": "0x1"}],
            "id": 1
        });
        let response = router
            .oneshot(
                Request::post("/proof")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let mut expected = vec![1u8, 1u8];
        expected.extend_from_slice(&[0u8; 31]);
        expected.push(0x0a);
        assert_eq!(bytes.as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn rpc_endpoint_verifies_and_extracts() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        mount_proof_upstreams(&rpc, &beacon).await;
        let router = create_router(test_state(&rpc, &beacon).await);

        let body = json!({
            "method": "eth_getBalance",
            "params": [format!("0x{}", "00".repeat(20)), "0x1"],
            "id": 7
        });
        let response = router
            .oneshot(
                Request::post("/rpc")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["result"], "0xa");
    }

    #[tokio::test]
    async fn malformed_proof_body_is_400() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        let router = create_router(test_state(&rpc, &beacon).await);

        let response = router
            .oneshot(Request::post("/proof").body(Body::from("not json")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_method_is_400() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        let router = create_router(test_state(&rpc, &beacon).await);

        let body = json!({"method": "eth_mine", "params": [], "id": 1});
        let response = router
            .oneshot(Request::post("/proof").body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unverified_rpc_forwards_body() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_gasPrice"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"jsonrpc":"2.0","id":1,"result":"0x3b9aca00"}"#),
            )
            .expect(1)
            .mount(&rpc)
            .await;
        let router = create_router(test_state(&rpc, &beacon).await);

        let body = json!({"jsonrpc": "2.0", "method": "eth_gasPrice", "params": [], "id": 1});
        let response = router
            .oneshot(
                Request::post("/unverified_rpc")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["result"], "0x3b9aca00");
    }

    #[tokio::test]
    async fn beacon_proxy_forwards_path_and_query() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/headers/head"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":{}}"#))
            .expect(1)
            .mount(&beacon)
            .await;
        let router = create_router(test_state(&rpc, &beacon).await);

        let response = router
            .oneshot(
                Request::get("/eth/v1/beacon/headers/head")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_and_health_endpoints() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        let state = test_state(&rpc, &beacon).await;

        let response = create_router(state.clone())
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["chain_id"], 1);
        assert_eq!(value["upstreams"].as_array().unwrap().len(), 2);

        let response = create_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exposition_renders() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        let router = create_router(test_state(&rpc, &beacon).await);
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("gateway_cache_entries"));
    }

    #[tokio::test]
    async fn concurrent_identical_proofs_dispatch_once() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getProof"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(proof_result_body())
                    .set_delay(std::time::Duration::from_millis(80)),
            )
            .expect(1)
            .mount(&rpc)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v2/beacon/blocks/head"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(head_block_body())
                    .set_delay(std::time::Duration::from_millis(80)),
            )
            .expect(1)
            .mount(&beacon)
            .await;

        let router = create_router(test_state(&rpc, &beacon).await);
        let body = json!({
            "method": "eth_getBalance",
            "params": [format!("0x{}", "00".repeat(20)), {"block": "0x1"}],
            "id": 1
        })
        .to_string();

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let router = router.clone();
            let body = body.clone();
            tasks.push(tokio::spawn(async move {
                router
                    .oneshot(Request::post("/proof").body(Body::from(body)).unwrap())
                    .await
                    .unwrap()
            }));
        }

        let mut bodies = Vec::new();
        for task in tasks {
            let response = task.await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            bodies.push(response.into_body().collect().await.unwrap().to_bytes());
        }
        // byte-equal proofs for every caller
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn graceful_shutdown_drains_inflight_requests() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getProof"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(proof_result_body())
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&rpc)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(head_block_body()))
            .mount(&beacon)
            .await;

        let router = create_router(test_state(&rpc, &beacon).await);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .unwrap();
        });

        let client = reqwest::Client::new();
        let body = json!({
            "method": "eth_getBalance",
            "params": [format!("0x{}", "00".repeat(20)), "0x1"],
            "id": 1
        });
        let request = tokio::spawn(async move {
            client
                .post(format!("http://{addr}/proof"))
                .json(&body)
                .send()
                .await
                .unwrap()
        });

        // let the request reach the slow upstream, then pull the plug
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send_replace(true);

        let response = request.await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        // listener closed, open request drained, loop exits cleanly
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server drained within the window")
            .unwrap();
    }

    #[tokio::test]
    async fn config_round_trip() {
        let rpc = MockServer::start().await;
        let beacon = MockServer::start().await;
        let state = test_state(&rpc, &beacon).await;

        let response = create_router(state.clone())
            .oneshot(
                Request::post("/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"latency_target_ms": 250}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = create_router(state)
            .oneshot(Request::get("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["latency_target_ms"], 250);
    }
}
