// SPDX-License-Identifier: MIT OR Apache-2.0
//! The middleware pipeline.
//!
//! Fixed stage order (see `build_router`): observe, discovery, tenant and
//! quota, roaming, proof enforcement, HTTP-signature enforcement, handler,
//! response signing. Any stage may short-circuit with a typed failure.
//! `/metrics`, `/health`, and the well-known documents are exempt from
//! every stage.

use crate::AppState;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use odin_httpsig::RequestFacts;
use odin_proof::{Attestation, ProofEnvelope, SignOptions};
use odin_roaming::{RoamingClaims, VerifyRequirements};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Trace id assigned at ingress, echoed on every response.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Resolved tenant.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

/// Outcome of proof enforcement, attached for handlers.
#[derive(Debug, Clone)]
pub struct VerifiedProof {
    /// The verification outcome.
    pub attestation: Attestation,
    /// The envelope as presented.
    pub proof: ProofEnvelope,
}

/// Verified roaming claims, attached for handlers and policy predicates.
#[derive(Debug, Clone)]
pub struct RoamingContext(pub RoamingClaims);

fn is_exempt(path: &str) -> bool {
    path == "/metrics" || path == "/health" || path.starts_with("/.well-known/")
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_owned()))
        })
        .collect()
}

/// Outermost stage: trace id, request counter, latency histogram.
pub async fn observe(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let trace_id = req
        .headers()
        .get("x-odin-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = req.method().clone();
    let route = req.uri().path().to_owned();
    let start = Instant::now();

    let mut resp = next.run(req).await;

    state
        .metrics
        .requests_total
        .with_label_values(&[&route, method.as_str(), resp.status().as_str()])
        .inc();
    state
        .metrics
        .request_latency
        .with_label_values(&[&route])
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        resp.headers_mut().insert("x-odin-trace-id", value);
    }
    resp
}

/// Attach keyset-discovery headers to any response that carries a proof.
/// Runs outside signing so it observes the attached signature headers.
pub async fn discovery_headers(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let mut resp = next.run(req).await;
    if resp.headers().contains_key("x-odin-ope") {
        let jwks = format!("{}/.well-known/odin/jwks.json", state.config.external_url);
        if let Ok(value) = HeaderValue::from_str(&jwks) {
            resp.headers_mut().insert("x-odin-jwks", value);
        }
        resp.headers_mut()
            .insert("x-odin-proof-version", HeaderValue::from_static("1"));
    }
    resp
}

/// Tenant resolution and quota admission. Quota runs before any crypto so
/// an over-limit tenant cannot burn signature verification cycles.
pub async fn tenant_and_quota(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if is_exempt(req.uri().path()) {
        return next.run(req).await;
    }
    let tenant = req
        .headers()
        .get("x-odin-agent")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    let tenant = match tenant {
        Some(t) => t,
        None if state.config.require_tenant => {
            return ApiError::unknown_tenant().into_response();
        }
        None => "public".to_owned(),
    };

    if let Err(retry_after) = state.quotas.try_take(&tenant) {
        state
            .metrics
            .quota_rejections_total
            .with_label_values(&[&tenant])
            .inc();
        return ApiError::quota_exceeded(retry_after).into_response();
    }

    req.extensions_mut().insert(Tenant(tenant));
    next.run(req).await
}

/// Verify a roaming pass when one is presented. Claims attach to the
/// request context; rejections are final and counted per reason.
pub async fn verify_roaming(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if is_exempt(req.uri().path()) {
        return next.run(req).await;
    }
    let Some(pass) = req
        .headers()
        .get("x-odin-roaming-pass")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return next.run(req).await;
    };

    let agent = req
        .headers()
        .get("x-odin-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let requirements = VerifyRequirements {
        expected_agent: agent.as_deref(),
        required_scope: None,
    };
    match state.roaming.verify(&pass, &requirements, now_unix()).await {
        Ok(claims) => {
            debug!(sub = %claims.sub, realm_dst = %claims.realm_dst, "roaming pass accepted");
            req.extensions_mut().insert(RoamingContext(claims));
            next.run(req).await
        }
        Err(err) => {
            state
                .metrics
                .roaming_rejections_total
                .with_label_values(&[err.reason()])
                .inc();
            ApiError::from_roaming(&err).into_response()
        }
    }
}

/// Proof enforcement on configured prefixes: unwrap `{payload, proof}`,
/// verify the envelope, evaluate policy, and hand the plain payload to
/// the handler. The outcome is echoed on `X-ODIN-Proof-Status`
/// (`verified`, `missing`, or the failure reason); in annotate-only mode
/// a missing or failing proof annotates instead of rejecting. Unenforced
/// routes pass through untouched.
pub async fn enforce_proof(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if is_exempt(&path) || !GatewayConfig::route_matches(&state.config.enforce_routes, &path) {
        return next.run(req).await;
    }
    // Only body-carrying methods can present an envelope.
    if !matches!(req.method().as_str(), "POST" | "PUT" | "PATCH") {
        return next.run(req).await;
    }

    let snapshot = state.policy.snapshot();
    let limit = snapshot.policy().max_payload_bytes as usize;

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, limit.saturating_add(1)).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::payload_too_large(snapshot.policy().max_payload_bytes)
                .into_response();
        }
    };
    if bytes.len() > limit {
        return ApiError::payload_too_large(snapshot.policy().max_payload_bytes).into_response();
    }

    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => return ApiError::invalid_json(e.to_string()).into_response(),
    };

    let enveloped = value.get("payload").is_some() && value.get("proof").is_some();
    let headers = header_map(&parts.headers);

    let (payload_bytes, kid, proof_status) = if enveloped {
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        let proof: ProofEnvelope = match serde_json::from_value(value["proof"].clone()) {
            Ok(proof) => proof,
            Err(e) => return ApiError::invalid_json(format!("proof: {e}")).into_response(),
        };
        let payload_bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return ApiError::invalid_json(e.to_string()).into_response(),
        };
        let verified = state
            .verifier
            .verify(&proof, None, Some(&payload), |host| snapshot.keyset_host_allowed(host), None)
            .await;
        match verified {
            Ok(attestation) => {
                state
                    .metrics
                    .signature_verifications_total
                    .with_label_values(&["proof", "ok"])
                    .inc();
                let kid = attestation.kid.clone();
                parts.extensions.insert(VerifiedProof {
                    attestation,
                    proof,
                });
                (payload_bytes, Some(kid), "verified".to_owned())
            }
            Err(err) => {
                state
                    .metrics
                    .signature_verifications_total
                    .with_label_values(&["proof", err.reason()])
                    .inc();
                if state.config.enforce_require {
                    return ApiError::from_proof(&err).into_response();
                }
                // Annotate-only: the failure is recorded on the response,
                // not turned into a rejection. No verified identity is
                // attached for handlers or policy.
                (payload_bytes, None, err.reason().to_owned())
            }
        }
    } else if state.config.enforce_require {
        return ApiError::proof_missing().into_response();
    } else {
        (bytes.to_vec(), None, "missing".to_owned())
    };

    // Policy gate over the (unwrapped) payload.
    let payload_value: Value = serde_json::from_slice(&payload_bytes).unwrap_or(Value::Null);
    let ctx = odin_policy::RequestContext {
        kid: kid.as_deref(),
        keyset_host: None,
        payload: Some(&payload_value),
        payload_bytes: payload_bytes.len(),
        headers: &headers,
    };
    let evaluation = snapshot.evaluate(&ctx);
    if !evaluation.is_allowed() {
        for violation in &evaluation.violations {
            state
                .metrics
                .policy_violations_total
                .with_label_values(&[&violation.rule])
                .inc();
        }
        let oversize = evaluation
            .violations
            .iter()
            .any(|v| v.rule == "max_payload_bytes");
        if oversize {
            return ApiError::payload_too_large(snapshot.policy().max_payload_bytes)
                .into_response();
        }
        return ApiError::policy_blocked(evaluation.violations).into_response();
    }

    // The body may have shrunk to the unwrapped payload.
    parts.headers.remove(header::CONTENT_LENGTH);
    let req = Request::from_parts(parts, Body::from(payload_bytes));
    let mut resp = next.run(req).await;
    if let Ok(v) = HeaderValue::from_str(&proof_status) {
        resp.headers_mut().insert("x-odin-proof-status", v);
    }
    resp
}

/// HTTP-signature enforcement on configured prefixes.
pub async fn enforce_httpsig(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if is_exempt(&path) || !GatewayConfig::route_matches(&state.config.httpsig_routes, &path) {
        return next.run(req).await;
    }

    let facts = RequestFacts {
        method: req.method().as_str().to_owned(),
        path: path.clone(),
        headers: header_map(req.headers()),
    };
    let signature_input = facts.headers.get("signature-input").cloned();
    let signature = facts.headers.get("signature").cloned();

    match state.httpsig.verify(
        &facts,
        signature_input.as_deref(),
        signature.as_deref(),
        now_unix(),
    ) {
        Ok(verified) => {
            state
                .metrics
                .signature_verifications_total
                .with_label_values(&["httpsig", "ok"])
                .inc();
            debug!(kid = %verified.kid, path = %path, "http signature accepted");
            next.run(req).await
        }
        Err(err) => {
            state
                .metrics
                .httpsig_failures_total
                .with_label_values(&[err.label()])
                .inc();
            ApiError::from_httpsig(&err).into_response()
        }
    }
}

/// Response signing on configured prefixes.
///
/// 2xx JSON responses without a top-level `proof` get canonical-encoded,
/// CID'd, and signed with the active key. Headers-only by default; embed
/// mode rewraps the body as `{payload, proof}`. The envelope receipt is
/// persisted best-effort — a storage failure is counted, not surfaced.
pub async fn sign_responses(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    let eligible =
        !is_exempt(&path) && GatewayConfig::route_matches(&state.config.sign_routes, &path);

    let resp = next.run(req).await;
    if !eligible || !resp.status().is_success() {
        return resp;
    }
    let is_json = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return resp;
    }

    let (mut parts, body) = resp.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer response for signing");
            return ApiError::internal("odin.sign.buffer_failed").into_response();
        }
    };
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };
    if value.get("proof").is_some() {
        return Response::from_parts(parts, Body::from(bytes));
    }

    let payload_bytes = match odin_oml::encode(&value) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "response not canonically encodable; leaving unsigned");
            return Response::from_parts(parts, Body::from(bytes));
        }
    };
    let envelope = odin_proof::sign_bytes(&payload_bytes, &state.signing, &SignOptions::default());

    for (name, header_value) in [
        ("x-odin-oml-cid", envelope.cid.clone()),
        ("x-odin-ope", envelope.ope.clone()),
        ("x-odin-ope-kid", envelope.kid.clone()),
    ] {
        if let Ok(v) = HeaderValue::from_str(&header_value) {
            parts.headers.insert(name, v);
        }
    }

    persist_envelope(&state, &envelope, &payload_bytes).await;

    let out_bytes = if state.config.sign_embed {
        let wrapped = serde_json::json!({ "payload": value, "proof": envelope });
        serde_json::to_vec(&wrapped).unwrap_or_else(|_| bytes.to_vec())
    } else {
        bytes.to_vec()
    };
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(out_bytes))
}

/// Best-effort persistence of a response envelope and its canonical bytes.
pub(crate) async fn persist_envelope(
    state: &AppState,
    envelope: &ProofEnvelope,
    payload_bytes: &[u8],
) {
    let env_key = odin_storage::keys::envelope(&envelope.cid);
    match serde_json::to_vec_pretty(envelope) {
        Ok(doc) => {
            if let Err(e) = state
                .storage
                .put_bytes(&env_key, &doc, "application/json")
                .await
            {
                state
                    .metrics
                    .receipt_write_failures_total
                    .with_label_values(&["envelope"])
                    .inc();
                warn!(key = %env_key, error = %e, "envelope receipt write failed");
            }
        }
        Err(e) => warn!(error = %e, "envelope receipt serialization failed"),
    }

    let oml_key = odin_storage::keys::oml(&envelope.cid);
    if let Err(e) = state
        .storage
        .put_bytes(&oml_key, payload_bytes, "application/octet-stream")
        .await
    {
        state
            .metrics
            .receipt_write_failures_total
            .with_label_values(&["oml"])
            .inc();
        warn!(key = %oml_key, error = %e, "canonical bytes write failed");
    }
}
