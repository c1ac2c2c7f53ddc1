// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};
use lru::LruCache;
use odin_keys::{KeyRegistry, SigningIdentity};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const B64_STD: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// Default clock-skew bound in seconds.
pub const DEFAULT_SKEW_SECS: i64 = 300;

/// Signature label used in the `Signature`/`Signature-Input` headers.
const LABEL: &str = "odin";

/// Failures while verifying a signed request.
///
/// Each variant maps to one labeled failure counter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpSigError {
    /// The request carried no signature headers.
    #[error("request is not signed")]
    MissingSignature,
    /// The signature headers could not be parsed.
    #[error("malformed signature header: {0}")]
    Malformed(String),
    /// A covered component is absent from the request.
    #[error("covered component {0} is missing")]
    MissingComponent(String),
    /// `created` is outside the permitted clock-skew window.
    #[error("signature created timestamp outside skew window")]
    Expired,
    /// The nonce was already seen within the replay window.
    #[error("nonce replayed")]
    Replayed,
    /// No key with the declared kid is known.
    #[error("unknown kid {0}")]
    UnknownKid(String),
    /// The signature does not verify.
    #[error("signature does not verify")]
    BadSignature,
}

impl HttpSigError {
    /// Stable label for failure counters.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing",
            Self::Malformed(_) | Self::MissingComponent(_) => "malformed",
            Self::Expired => "expired",
            Self::Replayed => "replayed",
            Self::UnknownKid(_) => "unknown_kid",
            Self::BadSignature => "bad_signature",
        }
    }
}

/// The request facts a signature can cover. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    /// HTTP method, uppercase.
    pub method: String,
    /// Request path (no scheme/authority).
    pub path: String,
    /// Headers, lowercased names.
    pub headers: BTreeMap<String, String>,
}

impl RequestFacts {
    fn component(&self, name: &str) -> Option<String> {
        match name {
            "@method" => Some(self.method.clone()),
            "@path" => Some(self.path.clone()),
            other => self.headers.get(other).cloned(),
        }
    }
}

/// Parsed parameters of a `Signature-Input` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParams {
    /// Covered component names, in declared order.
    pub components: Vec<String>,
    /// Unix seconds at which the signature was created.
    pub created: i64,
    /// Single-use nonce.
    pub nonce: String,
    /// Key id.
    pub kid: String,
}

impl SignatureParams {
    fn params_line(&self) -> String {
        let components = self
            .components
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "({components});created={};nonce=\"{}\";kid=\"{}\";alg=\"ed25519\"",
            self.created, self.nonce, self.kid
        )
    }

    /// Render the `Signature-Input` header value.
    #[must_use]
    pub fn to_header(&self) -> String {
        format!("{LABEL}={}", self.params_line())
    }

    /// Parse a `Signature-Input` header value.
    ///
    /// # Errors
    ///
    /// Returns [`HttpSigError::Malformed`] on any structural problem.
    pub fn parse(header: &str) -> Result<Self, HttpSigError> {
        let malformed = |what: &str| HttpSigError::Malformed(what.to_owned());
        let rest = header
            .trim()
            .strip_prefix(LABEL)
            .and_then(|r| r.strip_prefix('='))
            .ok_or_else(|| malformed("expected label"))?;
        let open = rest.find('(').ok_or_else(|| malformed("missing component list"))?;
        let close = rest.find(')').ok_or_else(|| malformed("unterminated component list"))?;
        if open != 0 || close < open {
            return Err(malformed("bad component list"));
        }
        let components: Vec<String> = rest[open + 1..close]
            .split_whitespace()
            .map(|c| c.trim_matches('"').to_owned())
            .filter(|c| !c.is_empty())
            .collect();
        if components.is_empty() {
            return Err(malformed("empty component list"));
        }

        let mut created = None;
        let mut nonce = None;
        let mut kid = None;
        let mut alg = None;
        for param in rest[close + 1..].split(';').filter(|p| !p.is_empty()) {
            let (name, value) = param
                .split_once('=')
                .ok_or_else(|| malformed("bad parameter"))?;
            let value = value.trim_matches('"');
            match name {
                "created" => {
                    created = Some(value.parse::<i64>().map_err(|_| malformed("bad created"))?);
                }
                "nonce" => nonce = Some(value.to_owned()),
                "kid" => kid = Some(value.to_owned()),
                "alg" => alg = Some(value.to_owned()),
                _ => {}
            }
        }
        if alg.as_deref() != Some("ed25519") {
            return Err(malformed("unsupported alg"));
        }
        Ok(Self {
            components,
            created: created.ok_or_else(|| malformed("missing created"))?,
            nonce: nonce.ok_or_else(|| malformed("missing nonce"))?,
            kid: kid.ok_or_else(|| malformed("missing kid"))?,
        })
    }
}

/// Build the canonical signing string: one `name: value` line per covered
/// component in declared order, terminated by the parameters line.
///
/// # Errors
///
/// Returns [`HttpSigError::MissingComponent`] when the request lacks a
/// covered component.
pub fn signing_string(params: &SignatureParams, facts: &RequestFacts) -> Result<String, HttpSigError> {
    let mut lines = Vec::with_capacity(params.components.len() + 1);
    for name in &params.components {
        let value = facts
            .component(name)
            .ok_or_else(|| HttpSigError::MissingComponent(name.clone()))?;
        lines.push(format!("\"{name}\": {value}"));
    }
    lines.push(format!("\"@signature-params\": {}", params.params_line()));
    Ok(lines.join("\n"))
}

/// Replay cache: a bounded nonce LRU per kid, sharded by kid hash.
///
/// Every kid owns its own LRU, so one caller's nonce volume can never
/// evict another caller's replay memory. Kids are themselves held in a
/// bounded LRU per shard so the cache stays bounded as kids churn.
/// Entries age out by timestamp comparison on access; eviction is O(1).
pub struct NonceCache {
    shards: Vec<Mutex<LruCache<String, LruCache<String, i64>>>>,
    nonces_per_kid: NonZeroUsize,
}

impl NonceCache {
    /// Build a cache of `shards` shards, each tracking up to
    /// `kids_per_shard` kids with `nonces_per_kid` nonces each.
    ///
    /// # Panics
    ///
    /// Panics if any argument is zero (configuration error).
    #[must_use]
    pub fn new(shards: usize, kids_per_shard: usize, nonces_per_kid: usize) -> Self {
        assert!(
            shards > 0 && kids_per_shard > 0 && nonces_per_kid > 0,
            "nonce cache must have capacity"
        );
        let kid_cap = NonZeroUsize::new(kids_per_shard).expect("checked above");
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(LruCache::new(kid_cap)))
                .collect(),
            nonces_per_kid: NonZeroUsize::new(nonces_per_kid).expect("checked above"),
        }
    }

    /// Default sizing: 16 shards × 64 kids, 10 240 nonces retained per kid
    /// so a single caller cannot cycle its own nonces back into validity
    /// inside the replay window.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(16, 64, 10_240)
    }

    /// Record the nonce; returns `false` when it was already seen within
    /// `window_secs` of `now`.
    pub fn check_and_insert(&self, kid: &str, nonce: &str, now: i64, window_secs: i64) -> bool {
        let mut hasher = DefaultHasher::new();
        kid.hash(&mut hasher);
        let shard = &self.shards[(hasher.finish() as usize) % self.shards.len()];
        let mut guard = shard.lock().expect("nonce shard lock poisoned");
        let per_kid = self.nonces_per_kid;
        let kid_cache = guard.get_or_insert_mut(kid.to_owned(), || LruCache::new(per_kid));
        if let Some(&seen_at) = kid_cache.peek(nonce) {
            if now - seen_at <= window_secs {
                return false;
            }
        }
        kid_cache.put(nonce.to_owned(), now);
        true
    }
}

/// Verifier for inbound signed requests.
pub struct HttpSigVerifier {
    registry: Arc<KeyRegistry>,
    nonces: NonceCache,
    skew_secs: i64,
}

/// Successful verification outcome.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    /// Kid the signature verified under.
    pub kid: String,
    /// Signature creation time (unix seconds).
    pub created: i64,
}

impl HttpSigVerifier {
    /// Build a verifier with the given skew bound.
    #[must_use]
    pub fn new(registry: Arc<KeyRegistry>, skew_secs: i64) -> Self {
        Self {
            registry,
            nonces: NonceCache::with_default_capacity(),
            skew_secs,
        }
    }

    /// Verify the signature headers against the request facts at time `now`.
    ///
    /// # Errors
    ///
    /// Returns an [`HttpSigError`]; every variant is final (no retries).
    pub fn verify(
        &self,
        facts: &RequestFacts,
        signature_input: Option<&str>,
        signature: Option<&str>,
        now: i64,
    ) -> Result<VerifiedSignature, HttpSigError> {
        let (input, sig_header) = match (signature_input, signature) {
            (Some(i), Some(s)) => (i, s),
            _ => return Err(HttpSigError::MissingSignature),
        };
        let params = SignatureParams::parse(input)?;

        if (now - params.created).abs() > self.skew_secs {
            return Err(HttpSigError::Expired);
        }

        let key = self
            .registry
            .verifying_key(&params.kid)
            .ok_or_else(|| HttpSigError::UnknownKid(params.kid.clone()))?;

        let base = signing_string(&params, facts)?;
        let sig_b64 = parse_signature_header(sig_header)?;
        let sig_bytes = B64_STD
            .decode(sig_b64)
            .map_err(|_| HttpSigError::Malformed("bad signature base64".into()))?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| HttpSigError::BadSignature)?;
        key.verify(base.as_bytes(), &sig)
            .map_err(|_| HttpSigError::BadSignature)?;

        // Replay check last: an attacker must present a valid signature
        // before consuming nonce-cache capacity.
        if !self
            .nonces
            .check_and_insert(&params.kid, &params.nonce, now, 2 * self.skew_secs)
        {
            return Err(HttpSigError::Replayed);
        }

        Ok(VerifiedSignature {
            kid: params.kid,
            created: params.created,
        })
    }
}

fn parse_signature_header(header: &str) -> Result<&str, HttpSigError> {
    header
        .trim()
        .strip_prefix(LABEL)
        .and_then(|r| r.strip_prefix("=:"))
        .and_then(|r| r.strip_suffix(':'))
        .ok_or_else(|| HttpSigError::Malformed("expected odin=:base64:".into()))
}

/// Sign a request, producing `(Signature-Input, Signature)` header values.
#[must_use]
pub fn sign_request(
    identity: &SigningIdentity,
    components: &[&str],
    facts: &RequestFacts,
    created: i64,
    nonce: &str,
) -> (String, String) {
    let params = SignatureParams {
        components: components.iter().map(|s| (*s).to_owned()).collect(),
        created,
        nonce: nonce.to_owned(),
        kid: identity.kid.clone(),
    };
    let base = signing_string(&params, facts).expect("signer controls covered components");
    let sig = identity.key.sign(base.as_bytes());
    (
        params.to_header(),
        format!("{LABEL}=:{}:", B64_STD.encode(sig.to_bytes())),
    )
}
