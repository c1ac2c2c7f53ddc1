// SPDX-License-Identifier: MIT OR Apache-2.0
//! The wire error taxonomy.
//!
//! Every failure surfaces as `{error, message, violations?, retry_after?}`
//! with the status code the taxonomy assigns to that kind.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use odin_policy::Violation;
use serde_json::json;

/// A structured API failure.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Stable machine-readable kind, e.g. `odin.proof.missing`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Policy or validation violations, when applicable.
    pub violations: Option<Vec<Violation>>,
    /// Seconds to wait, for quota rejections.
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// Build an error with kind and message.
    pub fn new(status: StatusCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: message.into(),
            violations: None,
            retry_after: None,
        }
    }

    /// Attach violations.
    #[must_use]
    pub fn with_violations(mut self, violations: Vec<Violation>) -> Self {
        self.violations = Some(violations);
        self
    }

    /// 400 `odin.request.invalid_json`.
    pub fn invalid_json(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "odin.request.invalid_json", detail)
    }

    /// 401 `odin.proof.missing`.
    pub fn proof_missing() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "odin.proof.missing",
            "a proof envelope is required on this route",
        )
    }

    /// 403 `odin.policy.blocked`.
    pub fn policy_blocked(violations: Vec<Violation>) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "odin.policy.blocked",
            "request blocked by policy",
        )
        .with_violations(violations)
    }

    /// 413 `odin.payload.too_large`.
    pub fn payload_too_large(limit: u64) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "odin.payload.too_large",
            format!("payload exceeds the {limit}-byte policy limit"),
        )
    }

    /// 429 `odin.quota.exceeded` with a retry hint.
    pub fn quota_exceeded(retry_after: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "odin.quota.exceeded",
            "tenant quota exhausted",
        );
        err.retry_after = Some(retry_after);
        err
    }

    /// 403 `odin.tenant.unknown`.
    pub fn unknown_tenant() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "odin.tenant.unknown",
            "a tenant is required on this gateway",
        )
    }

    /// 500 with a generic message; detail goes to the log, not the wire.
    pub fn internal(kind: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            kind,
            "internal error; see gateway logs",
        )
    }

    /// Map a proof failure onto the identity taxonomy.
    pub fn from_proof(err: &odin_proof::ProofError) -> Self {
        use odin_proof::ProofError as E;
        let (status, kind) = match err {
            E::MissingPayload => (StatusCode::UNAUTHORIZED, "odin.proof.missing"),
            E::CidMismatch { .. } => (StatusCode::UNAUTHORIZED, "odin.proof.cid_mismatch"),
            E::BadSignature { .. } | E::BadBase64 { .. } => {
                (StatusCode::UNAUTHORIZED, "odin.proof.bad_signature")
            }
            E::UnknownKid { .. } => (StatusCode::UNAUTHORIZED, "odin.proof.unknown_kid"),
            E::KeysetHostBlocked { .. } => (StatusCode::FORBIDDEN, "odin.policy.blocked"),
            E::KeysetFetch { .. } => (StatusCode::UNAUTHORIZED, "odin.proof.keyset_unavailable"),
            E::SftViolation { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "odin.proof.sft_violation"),
            E::Encode(_) => (StatusCode::BAD_REQUEST, "odin.request.invalid_json"),
        };
        Self::new(status, kind, err.to_string())
    }

    /// Map an HTTP-signature failure onto the identity taxonomy.
    pub fn from_httpsig(err: &odin_httpsig::HttpSigError) -> Self {
        use odin_httpsig::HttpSigError as E;
        let kind = match err {
            E::MissingSignature => "odin.httpsig.missing",
            E::Expired => "odin.httpsig.expired",
            E::Replayed => "odin.httpsig.replayed",
            E::UnknownKid(_) | E::BadSignature | E::Malformed(_) | E::MissingComponent(_) => {
                "odin.httpsig.bad_signature"
            }
        };
        Self::new(StatusCode::UNAUTHORIZED, kind, err.to_string())
    }

    /// Map a roaming rejection onto the authorization taxonomy.
    pub fn from_roaming(err: &odin_roaming::RoamingError) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            format!("odin.roaming.{}", err.reason()),
            err.to_string(),
        )
    }

    /// Map a translation failure onto the input taxonomy.
    pub fn from_translate(err: &odin_sft::TranslateError) -> Self {
        use odin_sft::TranslateError as E;
        match err {
            E::MapNotFound { from, to } => Self::new(
                StatusCode::NOT_FOUND,
                "odin.translate.map_not_found",
                format!("no map registered for {from} -> {to}"),
            ),
            E::InputInvalid { violations } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "odin.translate.input_invalid",
                "payload does not satisfy the map",
            )
            .with_violations(to_violations("input", violations)),
            E::OutputInvalid { violations } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "odin.translate.output_invalid",
                "mapped output violates the map's constraints",
            )
            .with_violations(to_violations("output", violations)),
            E::CoverageBelowGate {
                coverage_pct,
                required,
            } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "odin.translate.coverage_below_gate",
                format!("coverage {coverage_pct}% is below the {required}% gate"),
            ),
        }
    }

    /// Map a bridge failure onto the network taxonomy.
    pub fn from_bridge(err: &odin_bridge::BridgeError) -> Self {
        use odin_bridge::BridgeError as E;
        match err {
            E::HopLimit { count, max } => Self::new(
                StatusCode::MISDIRECTED_REQUEST,
                "odin.hop.limit",
                format!("hop count {count} reached the limit of {max}"),
            ),
            E::Upstream4xx { status, snapshot } => Self::new(
                StatusCode::BAD_GATEWAY,
                "odin.bridge.upstream_4xx",
                format!("upstream returned {status}: {snapshot}"),
            ),
            E::Upstream5xx { status, snapshot } => Self::new(
                StatusCode::BAD_GATEWAY,
                "odin.bridge.upstream_5xx",
                format!("upstream returned {status}: {snapshot}"),
            ),
            E::Network { detail } => Self::new(
                StatusCode::BAD_GATEWAY,
                "odin.bridge.network",
                detail.clone(),
            ),
            E::InvalidTarget(detail) => Self::new(
                StatusCode::BAD_REQUEST,
                "odin.bridge.invalid_target",
                detail.clone(),
            ),
            E::BlockedDestination { host } => Self::new(
                StatusCode::FORBIDDEN,
                "odin.bridge.blocked_destination",
                format!("destination {host} is not permitted"),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.kind,
            "message": self.message,
        });
        if let Some(violations) = &self.violations {
            body["violations"] = serde_json::to_value(violations).unwrap_or_default();
        }
        if let Some(retry_after) = self.retry_after {
            body["retry_after"] = json!(retry_after);
        }
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

fn to_violations(rule: &str, details: &[String]) -> Vec<Violation> {
    details
        .iter()
        .map(|detail| Violation {
            rule: rule.to_owned(),
            detail: detail.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_shape_includes_optional_fields() {
        let err = ApiError::quota_exceeded(7);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.kind, "odin.quota.exceeded");
        assert_eq!(err.retry_after, Some(7));
    }

    #[test]
    fn translate_errors_map_to_taxonomy() {
        let err = ApiError::from_translate(&odin_sft::TranslateError::MapNotFound {
            from: "a@v1".into(),
            to: "b@v1".into(),
        });
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.kind, "odin.translate.map_not_found");
    }

    #[test]
    fn hop_limit_maps_to_421() {
        let err = ApiError::from_bridge(&odin_bridge::BridgeError::HopLimit { count: 8, max: 8 });
        assert_eq!(err.status.as_u16(), 421);
        assert_eq!(err.kind, "odin.hop.limit");
    }

    #[test]
    fn roaming_reasons_become_kinds() {
        let err = ApiError::from_roaming(&odin_roaming::RoamingError::Expired);
        assert_eq!(err.kind, "odin.roaming.expired");
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }
}
