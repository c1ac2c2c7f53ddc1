// SPDX-License-Identifier: MIT OR Apache-2.0
//! Route handlers.
//!
//! Handlers see plain payloads — proof unwrap happened in the pipeline —
//! and never re-dispatch on runtime shapes beyond the declared request
//! cases (envelope, plain, mapping request, passthrough).

use crate::AppState;
use crate::error::ApiError;
use crate::pipeline::{self, TraceId, Tenant, VerifiedProof};
use axum::Extension;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use odin_bridge::{HopOutcome, HopReceipt, HopStage, OutboundHop, chain, receipt::write_hop_receipt};
use odin_proof::{ProofEnvelope, SignOptions};
use odin_registry::ListFilter;
use odin_roaming::MintRequest;
use odin_sft::{SftMap, TranslateError, TranslateOptions};
use odin_storage::keys;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

fn parse_json(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::invalid_json(e.to_string()))
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// `POST /v1/envelope` — wrap an arbitrary value into a proof envelope, or
/// verify and echo an already-enveloped `{payload, proof}` body.
pub async fn envelope(
    State(state): State<Arc<AppState>>,
    verified: Option<Extension<VerifiedProof>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let value = parse_json(&body)?;

    // Enforced route: the pipeline already unwrapped and verified.
    if let Some(Extension(verified)) = verified {
        return Ok(envelope_response(value, verified.proof));
    }

    // Unenforced route carrying an envelope anyway: verify and echo.
    if value.get("payload").is_some() && value.get("proof").is_some() {
        let payload = value["payload"].clone();
        let proof: ProofEnvelope = serde_json::from_value(value["proof"].clone())
            .map_err(|e| ApiError::invalid_json(format!("proof: {e}")))?;
        let snapshot = state.policy.snapshot();
        state
            .verifier
            .verify(&proof, None, Some(&payload), |h| snapshot.keyset_host_allowed(h), None)
            .await
            .map_err(|e| ApiError::from_proof(&e))?;
        return Ok(envelope_response(payload, proof));
    }

    // Plain value: wrap it.
    let payload_bytes = odin_oml::encode(&value).map_err(|e| ApiError::invalid_json(e.to_string()))?;
    let opts = SignOptions {
        jwks_url: Some(format!(
            "{}/.well-known/odin/jwks.json",
            state.config.external_url
        )),
        ..SignOptions::default()
    };
    let proof = odin_proof::sign_bytes(&payload_bytes, &state.signing, &opts);
    pipeline::persist_envelope(&state, &proof, &payload_bytes).await;
    Ok(envelope_response(value, proof))
}

fn envelope_response(payload: Value, proof: ProofEnvelope) -> Response {
    let cid = proof.cid.clone();
    let kid = proof.kid.clone();
    let mut resp = Json(json!({ "payload": payload, "proof": proof })).into_response();
    let headers = resp.headers_mut();
    if let Ok(v) = cid.parse() {
        headers.insert("x-odin-oml-cid", v);
    }
    if let Ok(v) = format!("oml/{cid}").parse() {
        headers.insert("x-odin-oml-c-path", v);
    }
    if let Ok(v) = kid.parse() {
        headers.insert("x-odin-ope-kid", v);
    }
    resp
}

// ---------------------------------------------------------------------------
// Translate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MappingRequest {
    payload: Value,
    from_sft: String,
    to_sft: String,
    #[serde(default)]
    map: Option<SftMap>,
}

/// `POST /v1/translate` — mapping mode for `{payload, from_sft, to_sft}`
/// bodies, transparent passthrough for anything else.
pub async fn translate(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let value = parse_json(&body)?;
    let is_mapping = value.get("payload").is_some()
        && value.get("from_sft").is_some()
        && value.get("to_sft").is_some();
    if !is_mapping {
        return Ok(Json(value).into_response());
    }

    let request: MappingRequest =
        serde_json::from_value(value).map_err(|e| ApiError::invalid_json(e.to_string()))?;

    let (output, output_cid, map_id) = run_translation(
        &state,
        &request.payload,
        &request.from_sft,
        &request.to_sft,
        request.map,
        "forward",
    )
    .await?;

    let mut resp = Json(json!({ "payload": output })).into_response();
    let headers = resp.headers_mut();
    if let Ok(v) = map_id.parse() {
        headers.insert("x-odin-transform-map", v);
    }
    if let Ok(v) = format!("/v1/receipts/transform/{output_cid}").parse() {
        headers.insert("x-odin-transform-receipt", v);
    }
    Ok(resp)
}

/// Resolve, translate, and persist the transform + translation receipts.
async fn run_translation(
    state: &AppState,
    payload: &Value,
    from: &str,
    to: &str,
    inline_map: Option<SftMap>,
    stage: &'static str,
) -> Result<(Value, String, String), ApiError> {
    let map = match inline_map {
        Some(map) => {
            map.validate().map_err(|e| {
                ApiError::from_translate(&TranslateError::InputInvalid {
                    violations: vec![format!("inline map: {e}")],
                })
            })?;
            Arc::new(map)
        }
        None => state.maps.resolve(from, to).ok_or_else(|| {
            ApiError::from_translate(&TranslateError::MapNotFound {
                from: from.to_owned(),
                to: to.to_owned(),
            })
        })?,
    };
    let reverse = state.maps.resolve_reverse(from, to);

    let opts = TranslateOptions {
        coverage_gate: state.config.coverage_gate,
        reverse: reverse.as_deref(),
        timestamp_ms: now_millis(),
    };
    let translated = odin_sft::translate(payload, &map, &opts).map_err(|e| {
        state
            .metrics
            .transform_receipts_total
            .with_label_values(&[stage, "error"])
            .inc();
        ApiError::from_translate(&e)
    })?;

    let receipt_file =
        odin_sft::build_transform_receipt(payload, &map, &translated.output, &state.signing)
            .map_err(|e| {
                warn!(error = %e, "transform receipt build failed");
                ApiError::internal("odin.storage.write_failed")
            })?;
    let output_cid = receipt_file.subject.output_cid.clone();

    let receipt_key = keys::transform(&output_cid);
    let persisted = match serde_json::to_vec_pretty(&receipt_file) {
        Ok(doc) => state
            .storage
            .put_bytes(&receipt_key, &doc, "application/json")
            .await
            .is_ok(),
        Err(_) => false,
    };
    if !persisted {
        state
            .metrics
            .receipt_write_failures_total
            .with_label_values(&["transform"])
            .inc();
        warn!(key = %receipt_key, "transform receipt write failed");
    }
    state
        .metrics
        .transform_receipts_total
        .with_label_values(&[stage, if persisted { "ok" } else { "storage_error" }])
        .inc();

    // The provenance record rides next to the signed subject.
    let translation_key = format!("receipts/translation/{output_cid}.json");
    if let Ok(doc) = serde_json::to_vec_pretty(&translated.receipt) {
        if let Err(e) = state
            .storage
            .put_bytes(&translation_key, &doc, "application/json")
            .await
        {
            debug!(key = %translation_key, error = %e, "translation receipt write failed");
        }
    }

    debug!(
        map = %receipt_file.subject.map_id,
        coverage = translated.receipt.coverage_pct,
        round_trip = ?translated.receipt.round_trip_ok,
        "translation complete"
    );
    Ok((translated.output, output_cid, receipt_file.subject.map_id))
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    payload: Value,
    #[serde(default)]
    from_sft: Option<String>,
    #[serde(default)]
    to_sft: Option<String>,
    #[serde(default)]
    map: Option<SftMap>,
    #[serde(default)]
    target_url: Option<String>,
}

/// `POST /v1/bridge/{target}` — translate (optionally) and forward to a
/// peer gateway, emitting transform and hop receipts along the way.
pub async fn bridge(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    tenant: Option<Extension<Tenant>>,
    verified: Option<Extension<VerifiedProof>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let value = parse_json(&body)?;
    let request: BridgeRequest =
        serde_json::from_value(value).map_err(|e| ApiError::invalid_json(e.to_string()))?;
    let tenant = tenant.map_or_else(|| "public".to_owned(), |Extension(Tenant(t))| t);
    let from_kid = verified.map(|Extension(v)| v.attestation.kid);

    let inbound_hop_count = headers
        .get("x-odin-hop-count")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    // Optional forward translation.
    let (outbound_payload, pair) = match (&request.from_sft, &request.to_sft) {
        (Some(from), Some(to)) => {
            let (output, _cid, _map_id) = run_translation(
                &state,
                &request.payload,
                from,
                to,
                request.map.clone(),
                "forward",
            )
            .await?;
            (output, Some((from.clone(), to.clone())))
        }
        _ => (request.payload.clone(), None),
    };

    // Resolve the destination: explicit target_url, else the registry.
    let target_url = match request.target_url {
        Some(url) => Some(url),
        None => {
            let filter = ListFilter {
                service: Some(target.clone()),
                ..ListFilter::default()
            };
            state
                .registry
                .list(&filter, now_unix())
                .await
                .ok()
                .and_then(|records| {
                    records
                        .first()
                        .map(|r| format!("{}/v1/envelope", r.payload.base_url.trim_end_matches('/')))
                })
        }
    };

    let input_cid = odin_oml::cid_of(&outbound_payload)
        .map_err(|e| ApiError::invalid_json(e.to_string()))?;

    // No destination: the hop degenerates to a local translation.
    let Some(target_url) = target_url else {
        return Ok(Json(json!({ "payload": outbound_payload })).into_response());
    };

    if !state.bridge.has_identity_source() {
        state
            .metrics
            .identity_token_unavailable_total
            .with_label_values(&["not_configured"])
            .inc();
    }

    let roaming_pass = headers
        .get("x-odin-roaming-pass")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let hop = OutboundHop {
        target_url: target_url.clone(),
        payload: outbound_payload.clone(),
        trace_id: trace_id.clone(),
        inbound_hop_count,
        roaming_pass,
    };

    let started = Instant::now();
    let result = state.bridge.forward(&hop).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let (outcome, output_cid, label) = match &result {
        Ok(resp) => (
            HopOutcome::Ok,
            odin_oml::cid_of(&resp.body).ok(),
            "ok",
        ),
        Err(err) => (
            HopOutcome::Error {
                kind: err.kind().to_owned(),
            },
            None,
            "error",
        ),
    };
    state.metrics.hops_total.with_label_values(&[label]).inc();
    state
        .metrics
        .hop_latency
        .with_label_values(&[label])
        .observe(latency_ms as f64 / 1_000.0);

    let receipt = HopReceipt {
        trace_id: trace_id.clone(),
        hop_index: inbound_hop_count,
        stage: HopStage::Forward,
        route: format!("/v1/bridge/{target}"),
        tenant,
        from_kid,
        to_peer: Some(target_url),
        input_cid,
        output_cid,
        latency_ms,
        outcome,
        created_ts: now_unix(),
    };
    if let Err(e) = write_hop_receipt(state.storage.as_ref(), &receipt).await {
        state
            .metrics
            .receipt_write_failures_total
            .with_label_values(&["hop"])
            .inc();
        warn!(trace_id = %trace_id, error = %e, "hop receipt write failed");
    }

    let upstream = result.map_err(|e| ApiError::from_bridge(&e))?;

    // Reverse translation of the reply, when a reverse map is declared.
    let reply = match &pair {
        Some((from, to)) if state.maps.resolve_reverse(from, to).is_some() => {
            let inner = upstream
                .body
                .get("payload")
                .cloned()
                .unwrap_or_else(|| upstream.body.clone());
            if inner.is_object() {
                let (reversed, _cid, _map) =
                    run_translation(&state, &inner, to, from, None, "reverse").await?;
                json!({ "payload": reversed })
            } else {
                upstream.body.clone()
            }
        }
        _ => upstream.body.clone(),
    };

    let mut resp = Json(reply).into_response();
    if let Ok(v) = upstream.hop_count.to_string().parse() {
        resp.headers_mut().insert("x-odin-hop-count", v);
    }
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// `POST /v1/verify` — verify an envelope (wrapped or bare) or a
/// `(bytes, sig, kid)` tuple. Always 200; the body carries the verdict.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    use base64::Engine as _;
    let value = parse_json(&body)?;

    let (proof, payload): (ProofEnvelope, Option<Value>) = if value.get("proof").is_some() {
        let proof = serde_json::from_value(value["proof"].clone())
            .map_err(|e| ApiError::invalid_json(format!("proof: {e}")))?;
        (proof, value.get("payload").cloned())
    } else if value.get("cid").is_some() && value.get("ope").is_some() {
        let proof = serde_json::from_value(value.clone())
            .map_err(|e| ApiError::invalid_json(e.to_string()))?;
        (proof, None)
    } else if let (Some(b), Some(sig), Some(kid)) = (
        value.get("oml_c_b64").and_then(Value::as_str),
        value.get("sig").and_then(Value::as_str),
        value.get("kid").and_then(Value::as_str),
    ) {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(b)
            .map_err(|e| ApiError::invalid_json(format!("oml_c_b64: {e}")))?;
        let proof = ProofEnvelope {
            cid: odin_oml::cid(&bytes),
            kid: kid.to_owned(),
            ope: sig.to_owned(),
            jwks_url: None,
            jwks_inline: None,
            oml_c_b64: Some(b.to_owned()),
            sft_id: None,
        };
        (proof, None)
    } else {
        return Err(ApiError::invalid_json(
            "expected {payload, proof}, an envelope, or {oml_c_b64, sig, kid}",
        ));
    };

    let snapshot = state.policy.snapshot();
    match state
        .verifier
        .verify(&proof, None, payload.as_ref(), |h| snapshot.keyset_host_allowed(h), None)
        .await
    {
        Ok(att) => Ok(Json(json!({ "ok": true, "kid": att.kid, "cid": att.cid }))),
        Err(err) => Ok(Json(json!({ "ok": false, "reason": err.reason() }))),
    }
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

fn cached_receipt_response(cid: &str, value: Value) -> Response {
    let mut resp = Json(value).into_response();
    let headers = resp.headers_mut();
    if let Ok(v) = format!("W/\"{cid}\"").parse() {
        headers.insert(header::ETAG, v);
    }
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    resp
}

fn receipt_not_found() -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "odin.receipt.not_found",
        "no receipt stored under that identifier",
    )
}

/// `GET /v1/receipts/{cid}` — a stored proof envelope.
pub async fn get_receipt(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state
        .storage
        .get_bytes(&keys::envelope(&cid))
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?
        .ok_or_else(receipt_not_found)?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    Ok(cached_receipt_response(&cid, value))
}

/// `GET /v1/receipts/transform/{output_cid}` — a stored transform receipt.
pub async fn get_transform_receipt(
    State(state): State<Arc<AppState>>,
    Path(output_cid): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state
        .storage
        .get_bytes(&keys::transform(&output_cid))
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?
        .ok_or_else(receipt_not_found)?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    Ok(cached_receipt_response(&output_cid, value))
}

/// `GET /v1/receipts/hops/chain/{trace_id}` — the ordered receipt chain.
pub async fn get_chain(
    State(state): State<Arc<AppState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entries = chain::read(state.storage.as_ref(), &trace_id)
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    let mut receipts = Vec::with_capacity(entries.len());
    for entry in &entries {
        if let Ok(Some(bytes)) = state.storage.get_bytes(&entry.key).await {
            if let Ok(receipt) = serde_json::from_slice::<Value>(&bytes) {
                receipts.push(receipt);
            }
        }
    }
    Ok(Json(json!({ "trace_id": trace_id, "hops": receipts })))
}

/// Paging for the recent-hops listing.
#[derive(Debug, Deserialize)]
pub struct HopListQuery {
    /// Maximum receipts returned (default 50).
    pub limit: Option<usize>,
}

/// `GET /v1/receipts/hops` — recent hop receipts, newest last.
pub async fn list_hops(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HopListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let all = state
        .storage
        .list("hops/", 10_000)
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    let receipt_keys: Vec<&String> = all
        .iter()
        .filter(|k| !k.starts_with("hops/index/"))
        .collect();
    let start = receipt_keys.len().saturating_sub(limit);
    let mut receipts = Vec::new();
    for key in &receipt_keys[start..] {
        if let Ok(Some(bytes)) = state.storage.get_bytes(key).await {
            if let Ok(receipt) = serde_json::from_slice::<Value>(&bytes) {
                receipts.push(receipt);
            }
        }
    }
    Ok(Json(json!({ "hops": receipts })))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// `POST /v1/registry/register` — verify and persist a service advert.
pub async fn registry_register(
    State(state): State<Arc<AppState>>,
    verified: Option<Extension<VerifiedProof>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let value = parse_json(&body)?;
    let (payload, proof) = match verified {
        // Enforced route: the body is the unwrapped payload.
        Some(Extension(v)) => (value, v.proof),
        None => {
            let payload = value
                .get("payload")
                .cloned()
                .ok_or_else(|| ApiError::invalid_json("expected {payload, proof}"))?;
            let proof = serde_json::from_value(
                value
                    .get("proof")
                    .cloned()
                    .ok_or_else(|| ApiError::invalid_json("expected {payload, proof}"))?,
            )
            .map_err(|e| ApiError::invalid_json(format!("proof: {e}")))?;
            (payload, proof)
        }
    };

    let snapshot = state.policy.snapshot();
    let record = state
        .registry
        .register(&payload, &proof, |h| snapshot.keyset_host_allowed(h), now_unix())
        .await
        .map_err(|e| match e {
            odin_registry::RegistryError::Proof(p) => ApiError::from_proof(&p),
            odin_registry::RegistryError::InvalidPayload { reason } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "odin.registry.invalid_advert",
                reason,
            ),
            other => {
                warn!(error = %other, "registry persistence failed");
                ApiError::internal("odin.storage.write_failed")
            }
        })?;
    Ok(Json(json!({ "id": record.id })))
}

/// `GET /v1/registry/services` — filtered listing.
pub async fn registry_list(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ListFilter>,
) -> Result<Json<Value>, ApiError> {
    let records = state
        .registry
        .list(&filter, now_unix())
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    Ok(Json(json!({ "services": records })))
}

/// `GET /v1/registry/services/{id}`.
pub async fn registry_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .registry
        .get(&id)
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?
        .ok_or_else(receipt_not_found)?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

/// `DELETE /v1/registry/services/{id}` — idempotent.
pub async fn registry_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .delete(&id)
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    Ok(Json(json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Roaming
// ---------------------------------------------------------------------------

fn admin_gate(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let forbidden = || {
        ApiError::new(
            StatusCode::FORBIDDEN,
            "odin.admin.forbidden",
            "admin surface is disabled or the key is wrong",
        )
    };
    if !state.config.enable_admin {
        return Err(forbidden());
    }
    let expected = state.config.admin_token.as_deref().ok_or_else(forbidden)?;
    let presented = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(forbidden)?;
    if presented != expected {
        return Err(forbidden());
    }
    Ok(())
}

/// `POST /v1/roaming/pass` — admin-gated pass minting.
pub async fn roaming_mint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    admin_gate(&state, &headers)?;
    let request: MintRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid_json(e.to_string()))?;
    let (pass, metadata) = odin_roaming::mint(
        &request,
        &state.config.external_url,
        &state.signing,
        now_unix(),
    );
    info!(
        target: "odin::audit",
        agent = %request.agent_did,
        realm_dst = %metadata.realm_dst,
        jti = %metadata.jti,
        "roaming pass minted"
    );
    Ok(Json(json!({
        "pass": pass,
        "exp": metadata.exp,
        "jti": metadata.jti,
        "scope": metadata.scope,
        "realm_dst": metadata.realm_dst,
    })))
}

/// `GET /v1/roaming/config` — trust anchors and audience in effect.
pub async fn roaming_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "audience": state.config.external_url,
        "max_ttl_seconds": odin_roaming::MAX_TTL_SECONDS,
        "clock_skew_seconds": odin_roaming::CLOCK_SKEW_SECONDS,
        "anchors": state.roaming.anchors(),
    }))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

/// `POST /v1/admin/reload/policy`.
pub async fn admin_reload_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_gate(&state, &headers)?;
    state.policy.reload().map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "odin.admin.reload_failed",
            e.to_string(),
        )
    })?;
    state
        .metrics
        .reloads_total
        .with_label_values(&["policy"])
        .inc();
    info!(target: "odin::audit", "policy reloaded");
    Ok(Json(json!({ "reloaded": "policy" })))
}

/// `POST /v1/admin/reload/maps`.
pub async fn admin_reload_maps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_gate(&state, &headers)?;
    let count = state.maps.reload().map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "odin.admin.reload_failed",
            e.to_string(),
        )
    })?;
    state
        .metrics
        .reloads_total
        .with_label_values(&["maps"])
        .inc();
    info!(target: "odin::audit", maps = count, "sft maps reloaded");
    Ok(Json(json!({ "reloaded": "maps", "count": count })))
}

/// A registered agent, as persisted under `agents/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent DID.
    pub did: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Lifecycle status, e.g. `active` or `suspended`.
    pub status: String,
    /// Unix seconds at registration.
    pub created_ts: i64,
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    did: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

async fn put_agent(state: &AppState, record: &AgentRecord) -> Result<(), ApiError> {
    let key = keys::agent(&record.did);
    let bytes = serde_json::to_vec_pretty(record)
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    // Agent records are mutable admin state, not ledger artifacts; replace
    // rather than append.
    state
        .storage
        .delete(&key)
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    state
        .storage
        .put_bytes(&key, &bytes, "application/json")
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))
}

/// `POST /v1/admin/agents` — register or update an agent.
pub async fn admin_register_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AgentRecord>, ApiError> {
    admin_gate(&state, &headers)?;
    let request: RegisterAgentRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::invalid_json(e.to_string()))?;
    if request.did.is_empty() || request.did.contains('/') {
        return Err(ApiError::invalid_json("did must be non-empty and slash-free"));
    }
    let record = AgentRecord {
        did: request.did,
        name: request.name,
        status: request.status.unwrap_or_else(|| "active".to_owned()),
        created_ts: now_unix(),
    };
    put_agent(&state, &record).await?;
    info!(target: "odin::audit", did = %record.did, status = %record.status, "agent registered");
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct AgentStatusRequest {
    status: String,
}

/// `POST /v1/admin/agents/{did}/status`.
pub async fn admin_set_agent_status(
    State(state): State<Arc<AppState>>,
    Path(did): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AgentRecord>, ApiError> {
    admin_gate(&state, &headers)?;
    let request: AgentStatusRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::invalid_json(e.to_string()))?;
    let bytes = state
        .storage
        .get_bytes(&keys::agent(&did))
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?
        .ok_or_else(receipt_not_found)?;
    let mut record: AgentRecord = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    record.status = request.status;
    put_agent(&state, &record).await?;
    info!(target: "odin::audit", did = %record.did, status = %record.status, "agent status changed");
    Ok(Json(record))
}

/// `GET /v1/admin/agents`.
pub async fn admin_list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_gate(&state, &headers)?;
    let agent_keys = state
        .storage
        .list("agents/", 1_000)
        .await
        .map_err(|_| ApiError::internal("odin.storage.write_failed"))?;
    let mut agents = Vec::new();
    for key in agent_keys {
        if let Ok(Some(bytes)) = state.storage.get_bytes(&key).await {
            if let Ok(record) = serde_json::from_slice::<AgentRecord>(&bytes) {
                agents.push(record);
            }
        }
    }
    Ok(Json(json!({ "agents": agents })))
}

// ---------------------------------------------------------------------------
// Discovery, health, metrics
// ---------------------------------------------------------------------------

/// `GET /.well-known/odin/discovery.json`.
pub async fn discovery(State(state): State<Arc<AppState>>) -> Response {
    let base = &state.config.external_url;
    let pairs: Vec<String> = state
        .maps
        .pairs()
        .into_iter()
        .map(|(from, to)| format!("{from}__{to}"))
        .collect();
    let doc = json!({
        "jwks_url": format!("{base}/.well-known/odin/jwks.json"),
        "proof_version": "1",
        "sft_maps": pairs,
        "endpoints": {
            "envelope": "/v1/envelope",
            "translate": "/v1/translate",
            "bridge": "/v1/bridge/{target}",
            "verify": "/v1/verify",
            "receipts": "/v1/receipts/{cid}",
            "registry": "/v1/registry/services",
            "roaming": "/v1/roaming/config",
        },
        "policy": {
            "enforce_routes": state.config.enforce_routes,
            "sign_routes": state.config.sign_routes,
            "sign_embed": state.config.sign_embed,
        },
        "capabilities": {
            "translate": true,
            "bridge": true,
            "registry": true,
            "roaming": !state.roaming.anchors().anchors.is_empty(),
        },
    });
    let mut resp = Json(doc).into_response();
    resp.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=60"),
    );
    resp
}

/// `GET /.well-known/odin/jwks.json`.
pub async fn jwks(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.keys.current().as_public_document())
}

/// `GET /health` — always unauthenticated, never signed.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
