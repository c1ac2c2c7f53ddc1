// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios against the full router: envelope echo, proof
//! enforcement, translation with receipts, bridge hop limits, registry
//! registration, quotas, and the signing/discovery header pipeline.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use odin_gateway::config::{GatewayConfig, StorageBackend};
use odin_gateway::{AppState, build_router};
use odin_keys::SigningIdentity;
use odin_proof::SignOptions;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

const AGENT_SEED: [u8; 32] = [42u8; 32];
const GATEWAY_SEED: [u8; 32] = [7u8; 32];

fn agent_identity() -> SigningIdentity {
    SigningIdentity {
        kid: "agent-beta".into(),
        key: ed25519_dalek::SigningKey::from_bytes(&AGENT_SEED),
    }
}

fn base_config() -> GatewayConfig {
    let agent = agent_identity();
    let keystore = json!({
        "active_kid": "agent-beta",
        "keys": [
            {"kid": "agent-beta", "public_key": hex::encode(agent.verifying_key().as_bytes())},
        ],
    });
    GatewayConfig {
        storage_backend: StorageBackend::Mem,
        keystore_json: Some(keystore.to_string()),
        signing_seed: Some(hex::encode(GATEWAY_SEED)),
        signing_kid: "gw-test".into(),
        quota_rate: 1_000.0,
        quota_burst: 1_000.0,
        ..GatewayConfig::default()
    }
}

fn app_with(config: GatewayConfig) -> (Router, Arc<AppState>) {
    let state = AppState::build(config).expect("state builds");
    (build_router(state.clone()), state)
}

fn maps_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a@v1__b@v1.json"),
        json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "fields": {"x": "y"},
            "defaults": {"z": 0},
        })
        .to_string(),
    )
    .unwrap();
    dir
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let resp = app.clone().oneshot(request).await.expect("infallible");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, headers, value)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ---------------------------------------------------------------------------
// S1: envelope echo
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_envelope_echo_and_stored_receipt() {
    let (app, _state) = app_with(base_config());

    let (status, headers, body) = send(&app, post_json("/v1/envelope", &json!({"hello": "world"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payload"], json!({"hello": "world"}));
    let cid = body["proof"]["cid"].as_str().expect("cid").to_owned();
    assert_eq!(body["proof"]["kid"], "gw-test");
    assert!(body["proof"]["ope"].as_str().is_some());
    assert_eq!(headers["x-odin-oml-cid"].to_str().unwrap(), cid);

    let (status, headers, stored) = send(&app, get(&format!("/v1/receipts/{cid}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["etag"].to_str().unwrap(), format!("W/\"{cid}\""));
    assert!(headers["cache-control"].to_str().unwrap().contains("max-age"));
    assert_eq!(stored["cid"], cid.as_str());
    assert_eq!(stored["kid"], "gw-test");
}

#[tokio::test]
async fn envelope_with_valid_proof_is_verified_and_echoed() {
    let (app, _state) = app_with(base_config());
    let agent = agent_identity();
    let payload = json!({"intent": "demo", "n": 1});
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();

    let body = json!({"payload": payload.clone(), "proof": proof});
    let (status, _headers, out) = send(&app, post_json("/v1/envelope", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["payload"], payload);
    assert_eq!(out["proof"]["kid"], "agent-beta");
}

#[tokio::test]
async fn envelope_with_tampered_proof_is_rejected() {
    let (app, _state) = app_with(base_config());
    let agent = agent_identity();
    let payload = json!({"n": 1});
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();

    let body = json!({"payload": {"n": 2}, "proof": proof});
    let (status, _headers, out) = send(&app, post_json("/v1/envelope", &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(out["error"], "odin.proof.cid_mismatch");
}

#[tokio::test]
async fn invalid_json_is_a_taxonomy_error() {
    let (app, _state) = app_with(base_config());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/envelope")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _headers, out) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(out["error"], "odin.request.invalid_json");
}

// ---------------------------------------------------------------------------
// S2: strict missing proof
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_strict_mode_rejects_missing_proof() {
    let mut config = base_config();
    config.enforce_routes = vec!["/v1/envelope".into()];
    config.enforce_require = true;
    let (app, _state) = app_with(config);

    let (status, _headers, out) = send(&app, post_json("/v1/envelope", &json!({"hello": "world"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(out["error"], "odin.proof.missing");
}

#[tokio::test]
async fn enforced_route_unwraps_valid_envelope_for_handler() {
    let mut config = base_config();
    config.enforce_routes = vec!["/v1/envelope".into()];
    config.enforce_require = true;
    let (app, _state) = app_with(config);

    let agent = agent_identity();
    let payload = json!({"hello": "proof"});
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();
    let body = json!({"payload": payload.clone(), "proof": proof});
    let (status, headers, out) = send(&app, post_json("/v1/envelope", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["payload"], payload);
    assert_eq!(out["proof"]["kid"], "agent-beta");
    assert_eq!(headers["x-odin-proof-status"].to_str().unwrap(), "verified");
}

#[tokio::test]
async fn annotate_only_mode_reports_proof_status() {
    let mut config = base_config();
    config.enforce_routes = vec!["/v1/envelope".into()];
    config.enforce_require = false;
    let (app, _state) = app_with(config);
    let agent = agent_identity();

    // No proof: the request passes, annotated as missing.
    let (status, headers, _out) =
        send(&app, post_json("/v1/envelope", &json!({"hello": "world"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-odin-proof-status"].to_str().unwrap(), "missing");

    // Valid proof: annotated as verified.
    let payload = json!({"hello": "proof"});
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();
    let body = json!({"payload": payload, "proof": proof.clone()});
    let (status, headers, _out) = send(&app, post_json("/v1/envelope", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-odin-proof-status"].to_str().unwrap(), "verified");

    // Failing proof: still passes, annotated with the failure reason.
    let body = json!({"payload": {"hello": "tampered"}, "proof": proof});
    let (status, headers, out) = send(&app, post_json("/v1/envelope", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-odin-proof-status"].to_str().unwrap(), "cid_mismatch");
    // The handler saw the unwrapped payload without a verified identity,
    // so it wrapped it under the gateway's own key.
    assert_eq!(out["payload"], json!({"hello": "tampered"}));
    assert_eq!(out["proof"]["kid"], "gw-test");
}

// ---------------------------------------------------------------------------
// S3 + S4: translate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_translate_map_not_found() {
    let (app, _state) = app_with(base_config());
    let body = json!({"payload": {"x": 1}, "from_sft": "a@v1", "to_sft": "b@v1"});
    let (status, _headers, out) = send(&app, post_json("/v1/translate", &body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(out["error"], "odin.translate.map_not_found");
}

#[tokio::test]
async fn s4_translate_success_with_receipt() {
    let dir = maps_dir();
    let mut config = base_config();
    config.maps_dir = Some(dir.path().to_path_buf());
    let (app, _state) = app_with(config);

    let body = json!({"payload": {"x": 1}, "from_sft": "a@v1", "to_sft": "b@v1"});
    let (status, headers, out) = send(&app, post_json("/v1/translate", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["payload"], json!({"y": 1, "z": 0}));
    assert_eq!(headers["x-odin-transform-map"].to_str().unwrap(), "a@v1__b@v1");

    let receipt_path = headers["x-odin-transform-receipt"].to_str().unwrap().to_owned();
    assert!(receipt_path.starts_with("/v1/receipts/transform/"));

    let (status, _headers, receipt) = send(&app, get(&receipt_path)).await;
    assert_eq!(status, StatusCode::OK);
    let subject = &receipt["subject"];
    assert_eq!(subject["map_id"], "a@v1__b@v1");
    assert_eq!(subject["from_sft"], "a@v1");
    assert_eq!(subject["to_sft"], "b@v1");
    assert!(subject["linkage_hash"].as_str().is_some());
    assert_eq!(
        subject["input_cid"].as_str().unwrap(),
        odin_oml::cid_of(&json!({"x": 1})).unwrap()
    );
    assert_eq!(
        subject["output_cid"].as_str().unwrap(),
        odin_oml::cid_of(&json!({"y": 1, "z": 0})).unwrap()
    );
    // The envelope signs the subject.
    assert_eq!(receipt["envelope"]["kid"], "gw-test");
}

#[tokio::test]
async fn translate_passthrough_returns_body_unchanged() {
    let (app, _state) = app_with(base_config());
    let body = json!({"just": "data", "no": "mapping"});
    let (status, _headers, out) = send(&app, post_json("/v1/translate", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out, body);
}

#[tokio::test]
async fn translate_identity_map_needs_no_file() {
    let (app, _state) = app_with(base_config());
    let body = json!({"payload": {"k": true}, "from_sft": "a@v1", "to_sft": "a@v1"});
    let (status, _headers, out) = send(&app, post_json("/v1/translate", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["payload"], json!({"k": true}));
}

// ---------------------------------------------------------------------------
// Response signing + discovery headers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signed_responses_carry_proof_and_discovery_headers() {
    let (app, _state) = app_with(base_config());
    // The translate passthrough response has no top-level proof, so the
    // signing stage applies.
    let body = json!({"plain": "response"});
    let (status, headers, _out) = send(&app, post_json("/v1/translate", &body)).await;
    assert_eq!(status, StatusCode::OK);

    let cid = headers["x-odin-oml-cid"].to_str().unwrap();
    assert!(!cid.is_empty());
    assert_eq!(headers["x-odin-ope-kid"].to_str().unwrap(), "gw-test");
    assert!(headers.contains_key("x-odin-ope"));
    assert!(headers["x-odin-jwks"].to_str().unwrap().ends_with("/.well-known/odin/jwks.json"));
    assert_eq!(headers["x-odin-proof-version"].to_str().unwrap(), "1");
    assert_eq!(odin_oml::cid(&odin_oml::encode(&body).unwrap()), cid);
}

#[tokio::test]
async fn sign_embed_wraps_the_body() {
    let mut config = base_config();
    config.sign_embed = true;
    let (app, _state) = app_with(config);

    let body = json!({"plain": "response"});
    let (status, _headers, out) = send(&app, post_json("/v1/translate", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["payload"], body);
    assert_eq!(out["proof"]["kid"], "gw-test");
}

#[tokio::test]
async fn health_and_metrics_are_never_signed_or_enforced() {
    let mut config = base_config();
    config.enforce_routes = vec!["/".into()];
    config.enforce_require = true;
    config.sign_routes = vec!["/".into()];
    let (app, _state) = app_with(config);

    let (status, headers, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(!headers.contains_key("x-odin-ope"));

    let (status, headers, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!headers.contains_key("x-odin-ope"));
    assert!(body.as_str().unwrap().contains("odin_requests_total"));
}

#[tokio::test]
async fn trace_id_is_echoed() {
    let (app, _state) = app_with(base_config());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/envelope")
        .header("content-type", "application/json")
        .header("x-odin-trace-id", "trace-abc")
        .body(Body::from(b"{}".to_vec()))
        .unwrap();
    let (_status, headers, _body) = send(&app, request).await;
    assert_eq!(headers["x-odin-trace-id"].to_str().unwrap(), "trace-abc");
}

// ---------------------------------------------------------------------------
// S5: bridge hop limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_bridge_hop_limit_writes_error_receipt() {
    let (app, _state) = app_with(base_config());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/bridge/beta")
        .header("content-type", "application/json")
        .header("x-odin-trace-id", "trace-hop-limit")
        .header("x-odin-hop-count", "8")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "payload": {"x": 1},
                "target_url": "http://peer.example/v1/envelope",
            }))
            .unwrap(),
        ))
        .unwrap();

    let (status, _headers, out) = send(&app, request).await;
    assert_eq!(status.as_u16(), 421);
    assert_eq!(out["error"], "odin.hop.limit");

    let (status, _headers, chain) =
        send(&app, get("/v1/receipts/hops/chain/trace-hop-limit")).await;
    assert_eq!(status, StatusCode::OK);
    let hops = chain["hops"].as_array().unwrap();
    assert_eq!(hops.len(), 1);
    assert_eq!(hops[0]["outcome"]["error"]["kind"], "hop_limit");
}

#[tokio::test]
async fn bridge_without_destination_returns_translation() {
    let dir = maps_dir();
    let mut config = base_config();
    config.maps_dir = Some(dir.path().to_path_buf());
    let (app, _state) = app_with(config);

    let body = json!({"payload": {"x": 5}, "from_sft": "a@v1", "to_sft": "b@v1"});
    let (status, _headers, out) = send(&app, post_json("/v1/bridge/beta", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["payload"], json!({"y": 5, "z": 0}));
}

#[tokio::test]
async fn missing_chain_is_empty_list() {
    let (app, _state) = app_with(base_config());
    let (status, _headers, chain) = send(&app, get("/v1/receipts/hops/chain/never-seen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chain["hops"], json!([]));
}

// ---------------------------------------------------------------------------
// S6: registry
// ---------------------------------------------------------------------------

fn advert_body() -> Value {
    let agent = agent_identity();
    let payload = json!({
        "intent": "service.advertise",
        "service": "agent_beta",
        "version": "v1",
        "base_url": "http://b:9090",
        "sft": ["beta@v1"],
        "ttl_seconds": 3600,
    });
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();
    json!({"payload": payload, "proof": proof})
}

#[tokio::test]
async fn s6_registry_register_and_list() {
    let (app, _state) = app_with(base_config());

    let (status, _headers, out) = send(&app, post_json("/v1/registry/register", &advert_body())).await;
    assert_eq!(status, StatusCode::OK);
    let id = out["id"].as_str().expect("id").to_owned();

    let (status, _headers, listed) =
        send(&app, get("/v1/registry/services?service=agent_beta")).await;
    assert_eq!(status, StatusCode::OK);
    let services = listed["services"].as_array().unwrap();
    assert!(!services.is_empty());
    assert_eq!(services[0]["id"].as_str().unwrap(), id);

    let (status, _headers, one) = send(&app, get(&format!("/v1/registry/services/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["payload"]["service"], "agent_beta");
}

#[tokio::test]
async fn registry_rejects_unsigned_adverts() {
    let (app, _state) = app_with(base_config());
    let body = json!({"payload": {"intent": "service.advertise"}});
    let (status, _headers, out) = send(&app, post_json("/v1/registry/register", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(out["error"], "odin.request.invalid_json");
}

// ---------------------------------------------------------------------------
// Quota and tenants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quota_exhaustion_yields_429_with_retry_after() {
    let mut config = base_config();
    config.quota_rate = 0.001;
    config.quota_burst = 2.0;
    let (app, _state) = app_with(config);

    for _ in 0..2 {
        let (status, _h, _b) = send(&app, post_json("/v1/envelope", &json!({"n": 1}))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, out) = send(&app, post_json("/v1/envelope", &json!({"n": 1}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(out["error"], "odin.quota.exceeded");
    assert!(out["retry_after"].as_u64().unwrap() >= 1);
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn one_tenant_cannot_starve_another() {
    let mut config = base_config();
    config.quota_rate = 0.001;
    config.quota_burst = 1.0;
    let (app, _state) = app_with(config);

    let with_tenant = |tenant: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/envelope")
            .header("content-type", "application/json")
            .header("x-odin-agent", tenant.to_owned())
            .body(Body::from(b"{}".to_vec()))
            .unwrap()
    };

    let (status, _h, _b) = send(&app, with_tenant("did:odin:noisy")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _h, _b) = send(&app, with_tenant("did:odin:noisy")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    // The quiet tenant's bucket is untouched.
    let (status, _h, _b) = send(&app, with_tenant("did:odin:quiet")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn require_tenant_rejects_anonymous_requests() {
    let mut config = base_config();
    config.require_tenant = true;
    let (app, _state) = app_with(config);
    let (status, _headers, out) = send(&app, post_json("/v1/envelope", &json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(out["error"], "odin.tenant.unknown");
}

// ---------------------------------------------------------------------------
// Verify endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verify_accepts_and_rejects() {
    let (app, _state) = app_with(base_config());
    let agent = agent_identity();
    let payload = json!({"v": 1});
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();

    let (status, _h, out) = send(
        &app,
        post_json("/v1/verify", &json!({"payload": payload, "proof": proof.clone()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["ok"], true);
    assert_eq!(out["kid"], "agent-beta");

    let (status, _h, out) = send(
        &app,
        post_json("/v1/verify", &json!({"payload": {"v": 2}, "proof": proof})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["ok"], false);
    assert_eq!(out["reason"], "cid_mismatch");
}

// ---------------------------------------------------------------------------
// Discovery, admin
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_and_jwks_documents() {
    let dir = maps_dir();
    let mut config = base_config();
    config.maps_dir = Some(dir.path().to_path_buf());
    config.enforce_routes = vec!["/v1/envelope".into()];
    let (app, _state) = app_with(config);

    let (status, headers, doc) = send(&app, get("/.well-known/odin/discovery.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["cache-control"].to_str().unwrap().contains("max-age=60"));
    assert!(doc["jwks_url"].as_str().unwrap().ends_with("/.well-known/odin/jwks.json"));
    assert_eq!(doc["policy"]["enforce_routes"], json!(["/v1/envelope"]));
    assert_eq!(doc["sft_maps"], json!(["a@v1__b@v1"]));
    assert_eq!(doc["capabilities"]["translate"], true);

    let (status, _headers, jwks) = send(&app, get("/.well-known/odin/jwks.json")).await;
    assert_eq!(status, StatusCode::OK);
    let kids: Vec<&str> = jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|k| k["kid"].as_str())
        .collect();
    assert!(kids.contains(&"agent-beta"));
}

#[tokio::test]
async fn admin_routes_are_gated() {
    let mut config = base_config();
    config.enable_admin = true;
    config.admin_token = Some("sesame".into());
    let (app, _state) = app_with(config);

    // No key.
    let (status, _h, _b) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/admin/reload/policy")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Correct key.
    let (status, _h, out) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/admin/reload/policy")
            .header("x-admin-key", "sesame")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["reloaded"], "policy");
}

#[tokio::test]
async fn admin_disabled_is_forbidden_even_with_key() {
    let mut config = base_config();
    config.admin_token = Some("sesame".into());
    config.enable_admin = false;
    let (app, _state) = app_with(config);
    let (status, _h, _b) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/admin/reload/maps")
            .header("x-admin-key", "sesame")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_agent_lifecycle() {
    let mut config = base_config();
    config.enable_admin = true;
    config.admin_token = Some("sesame".into());
    let (app, _state) = app_with(config);

    let admin_post = |uri: &str, body: Value| {
        Request::builder()
            .method("POST")
            .uri(uri.to_owned())
            .header("content-type", "application/json")
            .header("x-admin-key", "sesame")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    };

    let (status, _h, agent) = send(
        &app,
        admin_post("/v1/admin/agents", json!({"did": "did:odin:alice", "name": "Alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent["status"], "active");

    let (status, _h, agent) = send(
        &app,
        admin_post("/v1/admin/agents/did:odin:alice/status", json!({"status": "suspended"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent["status"], "suspended");

    let (status, _h, listed) = send(
        &app,
        Request::builder()
            .uri("/v1/admin/agents")
            .header("x-admin-key", "sesame")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["agents"][0]["did"], "did:odin:alice");
}

// ---------------------------------------------------------------------------
// Policy enforcement through the pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn policy_blocks_denied_intent_on_enforced_route() {
    let mut config = base_config();
    config.enforce_routes = vec!["/v1/envelope".into()];
    config.policy_json = Some(
        json!({
            "max_payload_bytes": 65536,
            "deny_intents": ["forbidden.*"],
        })
        .to_string(),
    );
    let (app, _state) = app_with(config);

    let agent = agent_identity();
    let payload = json!({"intent": "forbidden.action"});
    let proof = odin_proof::sign_value(&payload, &agent, &SignOptions::default()).unwrap();
    let (status, _h, out) =
        send(&app, post_json("/v1/envelope", &json!({"payload": payload, "proof": proof}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(out["error"], "odin.policy.blocked");
    assert_eq!(out["violations"][0]["rule"], "deny_intents");
}

#[tokio::test]
async fn oversized_payload_is_413_on_enforced_route() {
    let mut config = base_config();
    config.enforce_routes = vec!["/v1/envelope".into()];
    config.policy_json = Some(json!({"max_payload_bytes": 32}).to_string());
    let (app, _state) = app_with(config);

    let big = json!({"data": "x".repeat(128)});
    let (status, _h, out) = send(&app, post_json("/v1/envelope", &big)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(out["error"], "odin.payload.too_large");
}

// ---------------------------------------------------------------------------
// Bridge forwarding against a live peer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bridge_forwards_and_chains_receipts() {
    use wiremock::matchers::{method as wm_method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let peer = MockServer::start().await;
    Mock::given(wm_method("POST"))
        .and(wm_path("/v1/envelope"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"echoed": true})))
        .mount(&peer)
        .await;

    let mut config = base_config();
    config.bridge_allow_private = true; // the mock peer is on loopback
    let (app, _state) = app_with(config);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/bridge/beta")
        .header("content-type", "application/json")
        .header("x-odin-trace-id", "trace-fwd")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "payload": {"x": 1},
                "target_url": format!("{}/v1/envelope", peer.uri()),
            }))
            .unwrap(),
        ))
        .unwrap();

    let (status, headers, out) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out, json!({"echoed": true}));
    assert_eq!(headers["x-odin-hop-count"].to_str().unwrap(), "1");

    let (status, _headers, chain) = send(&app, get("/v1/receipts/hops/chain/trace-fwd")).await;
    assert_eq!(status, StatusCode::OK);
    let hops = chain["hops"].as_array().unwrap();
    assert_eq!(hops.len(), 1);
    assert_eq!(hops[0]["outcome"], "ok");
    assert_eq!(hops[0]["stage"], "forward");
    assert_eq!(
        hops[0]["input_cid"].as_str().unwrap(),
        odin_oml::cid_of(&json!({"x": 1})).unwrap()
    );
}
