// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};
use lru::LruCache;
use odin_keys::SigningIdentity;
use odin_proof::KeysetFetcher;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

const B64_URL: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Hard ceiling on pass lifetime, seconds.
pub const MAX_TTL_SECONDS: u64 = 600;

/// Clock skew tolerated on `nbf`/`exp`, seconds.
pub const CLOCK_SKEW_SECONDS: i64 = 30;

const PASS_TYP: &str = "odin-roam+jwt";

/// Why a pass was rejected. Each variant is one labeled counter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoamingError {
    /// The pass is not three base64url JSON segments.
    #[error("malformed roaming pass")]
    Malformed,
    /// `exp` is in the past (beyond skew).
    #[error("pass expired")]
    Expired,
    /// `nbf` is in the future (beyond skew).
    #[error("pass not yet valid")]
    NotYetValid,
    /// The presenting agent is not the pass subject.
    #[error("pass subject does not match presenting agent")]
    AgentMismatch,
    /// The destination realm is not permitted.
    #[error("destination realm not permitted")]
    RealmMismatch,
    /// The pass scope does not cover the required capability.
    #[error("scope does not cover required capability")]
    ScopeMismatch,
    /// No trust anchor covers the issuer, or the audience is wrong.
    #[error("issuer is not trusted for this audience")]
    IssuerNotTrusted,
    /// The signature does not verify under the issuer's keyset.
    #[error("pass signature invalid")]
    SignatureInvalid,
    /// The `jti` was already presented within the validity window.
    #[error("pass replayed")]
    Replayed,
}

impl RoamingError {
    /// Stable reason label for counters and error bodies.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::AgentMismatch => "agent_mismatch",
            Self::RealmMismatch => "realm_mismatch",
            Self::ScopeMismatch => "scope_mismatch",
            Self::IssuerNotTrusted => "issuer_not_trusted",
            Self::SignatureInvalid => "signature_invalid",
            Self::Replayed => "replayed",
        }
    }
}

/// Pass claims.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoamingClaims {
    /// Issuing gateway.
    pub iss: String,
    /// Subject agent DID.
    pub sub: String,
    /// Destination gateway base URL.
    pub aud: String,
    /// Source realm.
    pub realm_src: String,
    /// Destination realm.
    pub realm_dst: String,
    /// Granted capabilities.
    pub scope: Vec<String>,
    /// Unique pass id.
    pub jti: String,
    /// Not valid before, unix seconds.
    pub nbf: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Optional proof-of-possession binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PassHeader {
    alg: String,
    typ: String,
    kid: String,
}

/// Mint request, as accepted on the admin surface.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MintRequest {
    /// Subject agent DID.
    pub agent_did: String,
    /// Destination gateway base URL.
    pub audience: String,
    /// Source realm.
    pub realm_src: String,
    /// Destination realm.
    pub realm_dst: String,
    /// Requested capabilities.
    pub scope: Vec<String>,
    /// Requested lifetime; clamped to [`MAX_TTL_SECONDS`].
    pub ttl_seconds: u64,
    /// Optional proof-of-possession binding.
    #[serde(default)]
    pub bind: Option<Value>,
}

/// Metadata returned alongside a minted pass.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PassMetadata {
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Unique pass id.
    pub jti: String,
    /// Granted capabilities.
    pub scope: Vec<String>,
    /// Destination realm.
    pub realm_dst: String,
}

/// Mint a pass signed by this gateway's active key.
#[must_use]
pub fn mint(req: &MintRequest, issuer: &str, identity: &SigningIdentity, now: i64) -> (String, PassMetadata) {
    let ttl = req.ttl_seconds.min(MAX_TTL_SECONDS);
    let jti = uuid::Uuid::new_v4().to_string();
    let claims = RoamingClaims {
        iss: issuer.to_owned(),
        sub: req.agent_did.clone(),
        aud: req.audience.clone(),
        realm_src: req.realm_src.clone(),
        realm_dst: req.realm_dst.clone(),
        scope: req.scope.clone(),
        jti: jti.clone(),
        nbf: now,
        exp: now + ttl as i64,
        bind: req.bind.clone(),
    };
    let header = PassHeader {
        alg: "EdDSA".into(),
        typ: PASS_TYP.into(),
        kid: identity.kid.clone(),
    };
    let header_b64 = B64_URL.encode(serde_json::to_vec(&header).expect("headers serialize"));
    let claims_b64 = B64_URL.encode(serde_json::to_vec(&claims).expect("claims serialize"));
    let signing_input = format!("{header_b64}.{claims_b64}");
    let sig = identity.key.sign(signing_input.as_bytes());
    let pass = format!("{signing_input}.{}", B64_URL.encode(sig.to_bytes()));
    let metadata = PassMetadata {
        exp: claims.exp,
        jti,
        scope: claims.scope.clone(),
        realm_dst: claims.realm_dst.clone(),
    };
    (pass, metadata)
}

/// One trusted issuer, as configured in `configs/roaming/trust_anchors.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TrustAnchor {
    /// Issuer identifier, matched against `iss`.
    pub iss: String,
    /// Keyset discovery URL for the issuer.
    pub jwks_url: String,
    /// Destination realms this issuer may grant.
    pub realms_allowed: Vec<String>,
    /// Audiences this issuer may address.
    pub audience_allowed: Vec<String>,
    /// Maximum pass lifetime this issuer may grant.
    pub max_ttl_seconds: u64,
}

/// The trust-anchor configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TrustAnchors {
    /// All configured anchors.
    #[serde(default)]
    pub anchors: Vec<TrustAnchor>,
}

impl TrustAnchors {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns the YAML parse error.
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Read and parse the anchors file. A missing file yields an empty set
    /// (roaming disabled), not an error.
    ///
    /// # Errors
    ///
    /// Returns an IO or parse error for an unreadable or malformed file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, std::io::Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        Self::from_yaml_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn anchor_for(&self, iss: &str) -> Option<&TrustAnchor> {
        self.anchors.iter().find(|a| a.iss == iss)
    }
}

/// Verification checks that depend on the route, not the pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyRequirements<'a> {
    /// The presenting agent (from `X-ODIN-Agent`); must equal `sub`.
    pub expected_agent: Option<&'a str>,
    /// Capability the route requires; scope must contain it.
    pub required_scope: Option<&'a str>,
}

/// Pass verifier holding trust anchors and the jti replay cache.
pub struct RoamingVerifier {
    anchors: TrustAnchors,
    fetcher: Arc<dyn KeysetFetcher>,
    audience: String,
    seen_jti: Mutex<LruCache<String, i64>>,
}

impl RoamingVerifier {
    /// Build a verifier for this gateway's external URL.
    #[must_use]
    pub fn new(anchors: TrustAnchors, fetcher: Arc<dyn KeysetFetcher>, audience: impl Into<String>) -> Self {
        Self {
            anchors,
            fetcher,
            audience: audience.into(),
            seen_jti: Mutex::new(LruCache::new(
                NonZeroUsize::new(16_384).expect("nonzero"),
            )),
        }
    }

    /// The configured trust anchors (served on the config endpoint).
    #[must_use]
    pub fn anchors(&self) -> &TrustAnchors {
        &self.anchors
    }

    /// Verify a pass presented at time `now`.
    ///
    /// # Errors
    ///
    /// Returns the first [`RoamingError`] encountered. Checks run in a
    /// fixed order: structure, time window, trust anchor, signature,
    /// audience, realm, scope, agent, replay.
    pub async fn verify(
        &self,
        pass: &str,
        requirements: &VerifyRequirements<'_>,
        now: i64,
    ) -> Result<RoamingClaims, RoamingError> {
        let mut segments = pass.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(RoamingError::Malformed);
        };

        let header: PassHeader = decode_segment(header_b64)?;
        if header.alg != "EdDSA" || header.typ != PASS_TYP {
            return Err(RoamingError::Malformed);
        }
        let claims: RoamingClaims = decode_segment(claims_b64)?;

        if now < claims.nbf - CLOCK_SKEW_SECONDS {
            return Err(RoamingError::NotYetValid);
        }
        if now > claims.exp + CLOCK_SKEW_SECONDS {
            return Err(RoamingError::Expired);
        }

        let anchor = self
            .anchors
            .anchor_for(&claims.iss)
            .ok_or(RoamingError::IssuerNotTrusted)?;
        let ttl = claims.exp.saturating_sub(claims.nbf);
        if ttl < 0 || ttl as u64 > anchor.max_ttl_seconds.min(MAX_TTL_SECONDS) {
            return Err(RoamingError::IssuerNotTrusted);
        }

        let keyset = self
            .fetcher
            .fetch(&anchor.jwks_url)
            .await
            .map_err(|_| RoamingError::SignatureInvalid)?;
        let key = keyset
            .get(&header.kid)
            .ok_or(RoamingError::SignatureInvalid)?;
        let sig_bytes = B64_URL
            .decode(sig_b64)
            .map_err(|_| RoamingError::SignatureInvalid)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| RoamingError::SignatureInvalid)?;
        let signing_input = format!("{header_b64}.{claims_b64}");
        key.verify(signing_input.as_bytes(), &sig)
            .map_err(|_| RoamingError::SignatureInvalid)?;

        if claims.aud != self.audience || !anchor.audience_allowed.iter().any(|a| a == &claims.aud) {
            return Err(RoamingError::IssuerNotTrusted);
        }
        if !anchor.realms_allowed.iter().any(|r| r == &claims.realm_dst) {
            return Err(RoamingError::RealmMismatch);
        }
        if let Some(required) = requirements.required_scope {
            if !claims.scope.iter().any(|s| s == required) {
                return Err(RoamingError::ScopeMismatch);
            }
        }
        if let Some(agent) = requirements.expected_agent {
            if claims.sub != agent {
                return Err(RoamingError::AgentMismatch);
            }
        }

        {
            let mut seen = self.seen_jti.lock().expect("jti lock poisoned");
            if let Some(&seen_at) = seen.peek(&claims.jti) {
                if now - seen_at <= MAX_TTL_SECONDS as i64 + CLOCK_SKEW_SECONDS {
                    return Err(RoamingError::Replayed);
                }
            }
            seen.put(claims.jti.clone(), now);
        }

        Ok(claims)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, RoamingError> {
    let bytes = B64_URL.decode(segment).map_err(|_| RoamingError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| RoamingError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use odin_keys::KeySet;
    use odin_proof::StaticKeysetFetcher;

    const NOW: i64 = 1_750_000_000;
    const AUD: &str = "https://gw.dst.example";
    const JWKS: &str = "https://gw.src.example/.well-known/odin/jwks.json";

    fn issuer_identity() -> SigningIdentity {
        SigningIdentity {
            kid: "src-active".into(),
            key: ed25519_dalek::SigningKey::from_bytes(&[21u8; 32]),
        }
    }

    fn anchors() -> TrustAnchors {
        TrustAnchors {
            anchors: vec![TrustAnchor {
                iss: "https://gw.src.example".into(),
                jwks_url: JWKS.into(),
                realms_allowed: vec!["research".into()],
                audience_allowed: vec![AUD.into()],
                max_ttl_seconds: 600,
            }],
        }
    }

    fn verifier() -> RoamingVerifier {
        let id = issuer_identity();
        let set = KeySet::from_pairs([(id.kid.clone(), id.verifying_key())], None).unwrap();
        let mut fetcher = StaticKeysetFetcher::default();
        fetcher.insert(JWKS, set);
        RoamingVerifier::new(anchors(), Arc::new(fetcher), AUD)
    }

    fn mint_req() -> MintRequest {
        MintRequest {
            agent_did: "did:odin:alice".into(),
            audience: AUD.into(),
            realm_src: "home".into(),
            realm_dst: "research".into(),
            scope: vec!["translate".into(), "bridge".into()],
            ttl_seconds: 300,
            bind: None,
        }
    }

    fn minted() -> String {
        mint(&mint_req(), "https://gw.src.example", &issuer_identity(), NOW).0
    }

    #[tokio::test]
    async fn mint_and_verify() {
        let v = verifier();
        let claims = v
            .verify(&minted(), &VerifyRequirements::default(), NOW + 10)
            .await
            .unwrap();
        assert_eq!(claims.sub, "did:odin:alice");
        assert_eq!(claims.realm_dst, "research");
        assert_eq!(claims.exp, NOW + 300);
    }

    #[test]
    fn ttl_is_clamped() {
        let mut req = mint_req();
        req.ttl_seconds = 4_000;
        let (_, meta) = mint(&req, "https://gw.src.example", &issuer_identity(), NOW);
        assert_eq!(meta.exp, NOW + MAX_TTL_SECONDS as i64);
    }

    #[test]
    fn pass_has_three_segments() {
        assert_eq!(minted().split('.').count(), 3);
    }

    #[tokio::test]
    async fn expired_pass_rejected() {
        let v = verifier();
        let err = v
            .verify(&minted(), &VerifyRequirements::default(), NOW + 300 + 31)
            .await
            .unwrap_err();
        assert_eq!(err, RoamingError::Expired);
    }

    #[tokio::test]
    async fn future_pass_rejected_but_skew_tolerated() {
        let v = verifier();
        assert_eq!(
            v.verify(&minted(), &VerifyRequirements::default(), NOW - 31)
                .await
                .unwrap_err(),
            RoamingError::NotYetValid
        );
        assert!(
            v.verify(&minted(), &VerifyRequirements::default(), NOW - 29)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unknown_issuer_rejected() {
        let v = verifier();
        let (pass, _) = mint(&mint_req(), "https://rogue.example", &issuer_identity(), NOW);
        assert_eq!(
            v.verify(&pass, &VerifyRequirements::default(), NOW)
                .await
                .unwrap_err(),
            RoamingError::IssuerNotTrusted
        );
    }

    #[tokio::test]
    async fn wrong_audience_rejected() {
        let v = verifier();
        let mut req = mint_req();
        req.audience = "https://somewhere-else.example".into();
        let (pass, _) = mint(&req, "https://gw.src.example", &issuer_identity(), NOW);
        assert_eq!(
            v.verify(&pass, &VerifyRequirements::default(), NOW)
                .await
                .unwrap_err(),
            RoamingError::IssuerNotTrusted
        );
    }

    #[tokio::test]
    async fn wrong_realm_rejected() {
        let v = verifier();
        let mut req = mint_req();
        req.realm_dst = "production".into();
        let (pass, _) = mint(&req, "https://gw.src.example", &issuer_identity(), NOW);
        assert_eq!(
            v.verify(&pass, &VerifyRequirements::default(), NOW)
                .await
                .unwrap_err(),
            RoamingError::RealmMismatch
        );
    }

    #[tokio::test]
    async fn scope_must_cover_requirement() {
        let v = verifier();
        let reqs = VerifyRequirements {
            required_scope: Some("admin"),
            ..VerifyRequirements::default()
        };
        assert_eq!(
            v.verify(&minted(), &reqs, NOW).await.unwrap_err(),
            RoamingError::ScopeMismatch
        );

        let ok = VerifyRequirements {
            required_scope: Some("translate"),
            ..VerifyRequirements::default()
        };
        assert!(v.verify(&minted(), &ok, NOW).await.is_ok());
    }

    #[tokio::test]
    async fn agent_binding_enforced() {
        let v = verifier();
        let reqs = VerifyRequirements {
            expected_agent: Some("did:odin:mallory"),
            ..VerifyRequirements::default()
        };
        assert_eq!(
            v.verify(&minted(), &reqs, NOW).await.unwrap_err(),
            RoamingError::AgentMismatch
        );
    }

    #[tokio::test]
    async fn tampered_claims_fail_signature() {
        let v = verifier();
        let pass = minted();
        let mut parts: Vec<&str> = pass.split('.').collect();
        let mut claims: RoamingClaims = decode_segment(parts[1]).unwrap();
        claims.scope.push("admin".into());
        let forged = B64_URL.encode(serde_json::to_vec(&claims).unwrap());
        parts[1] = &forged;
        let forged_pass = parts.join(".");
        assert_eq!(
            v.verify(&forged_pass, &VerifyRequirements::default(), NOW)
                .await
                .unwrap_err(),
            RoamingError::SignatureInvalid
        );
    }

    #[tokio::test]
    async fn jti_replay_rejected() {
        let v = verifier();
        let pass = minted();
        v.verify(&pass, &VerifyRequirements::default(), NOW).await.unwrap();
        assert_eq!(
            v.verify(&pass, &VerifyRequirements::default(), NOW + 1)
                .await
                .unwrap_err(),
            RoamingError::Replayed
        );
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let v = verifier();
        for bad in ["", "a.b", "a.b.c.d", "!!!.!!!.!!!"] {
            assert_eq!(
                v.verify(bad, &VerifyRequirements::default(), NOW)
                    .await
                    .unwrap_err(),
                RoamingError::Malformed,
                "input {bad:?}"
            );
        }
    }

    #[test]
    fn anchors_parse_from_yaml() {
        let yaml = r"
anchors:
  - iss: https://gw.src.example
    jwks_url: https://gw.src.example/.well-known/odin/jwks.json
    realms_allowed: [research]
    audience_allowed: [https://gw.dst.example]
    max_ttl_seconds: 600
";
        let anchors = TrustAnchors::from_yaml_str(yaml).unwrap();
        assert_eq!(anchors.anchors.len(), 1);
        assert_eq!(anchors.anchors[0].realms_allowed, vec!["research"]);
    }

    #[test]
    fn missing_anchor_file_disables_roaming() {
        let anchors =
            TrustAnchors::from_yaml_file(Path::new("/nope/missing.yaml")).unwrap();
        assert!(anchors.anchors.is_empty());
    }
}
