// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};
use odin_keys::{KeyRegistry, KeySet, SigningIdentity};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const B64_URL: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Errors produced while building or verifying a proof envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    /// No payload bytes were available from any source.
    #[error("envelope carries no payload bytes and none were provided")]
    MissingPayload,
    /// A base64url field could not be decoded.
    #[error("invalid base64url in field {field}")]
    BadBase64 {
        /// The offending field name.
        field: String,
    },
    /// The declared CID does not match the recomputed one.
    #[error("cid mismatch: declared {declared}, computed {computed}")]
    CidMismatch {
        /// CID carried in the envelope.
        declared: String,
        /// CID recomputed from the bytes.
        computed: String,
    },
    /// No key with the envelope's kid could be resolved.
    #[error("unknown kid {kid}")]
    UnknownKid {
        /// The unresolvable kid.
        kid: String,
    },
    /// The signature did not verify.
    #[error("signature does not verify under kid {kid}")]
    BadSignature {
        /// Kid the verification was attempted under.
        kid: String,
    },
    /// The keyset URL's host is not on the policy allowlist.
    #[error("keyset host {host} is not allowed")]
    KeysetHostBlocked {
        /// The blocked host.
        host: String,
    },
    /// Fetching or parsing a remote keyset failed.
    #[error("keyset fetch from {url} failed: {reason}")]
    KeysetFetch {
        /// The keyset URL.
        url: String,
        /// Failure detail.
        reason: String,
    },
    /// The declared semantic format does not match the expected one.
    #[error("sft mismatch: envelope declares {declared}, expected {expected}")]
    SftViolation {
        /// Format id declared on the envelope.
        declared: String,
        /// Format id the caller expected.
        expected: String,
    },
    /// The payload value could not be canonically encoded.
    #[error(transparent)]
    Encode(#[from] odin_oml::EncodeError),
}

impl ProofError {
    /// Stable machine-readable reason string for API responses.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingPayload => "missing_payload",
            Self::BadBase64 { .. } => "bad_base64",
            Self::CidMismatch { .. } => "cid_mismatch",
            Self::UnknownKid { .. } => "unknown_kid",
            Self::BadSignature { .. } => "bad_signature",
            Self::KeysetHostBlocked { .. } => "keyset_host_blocked",
            Self::KeysetFetch { .. } => "keyset_fetch_failed",
            Self::SftViolation { .. } => "sft_violation",
            Self::Encode(_) => "encode_failed",
        }
    }
}

/// A proof envelope: the signed attestation persisted alongside payloads.
///
/// Field names are the wire/file contract — `ope` is the base64url Ed25519
/// signature over the canonical bytes, `oml_c_b64` optionally embeds those
/// bytes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProofEnvelope {
    /// Content-addressed identifier of the canonical bytes.
    pub cid: String,
    /// Key id the signature was produced under.
    pub kid: String,
    /// base64url(Ed25519 signature over the canonical bytes).
    pub ope: String,
    /// Optional URL of a keyset that can verify this envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,
    /// Optional inline keyset document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_inline: Option<Value>,
    /// Optional base64url copy of the canonical bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oml_c_b64: Option<String>,
    /// Optional declared semantic format id of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sft_id: Option<String>,
}

/// Where the verifying key was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeysetSource {
    /// Keyset embedded in the envelope.
    Inline,
    /// Keyset fetched from the envelope's URL.
    Url(String),
    /// Key resolved from the local registry.
    Local,
}

/// Outcome of a successful verification, attached to the request context.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Attestation {
    /// Always `true` for a returned attestation.
    pub ok: bool,
    /// Kid the signature verified under.
    pub kid: String,
    /// CID of the verified bytes.
    pub cid: String,
    /// Where the verifying key came from.
    pub keyset_source: KeysetSource,
}

/// Options controlling envelope construction.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// Embed the canonical bytes in `oml_c_b64`.
    pub embed_bytes: bool,
    /// Advertise a keyset URL on the envelope.
    pub jwks_url: Option<String>,
    /// Declare the payload's semantic format.
    pub sft_id: Option<String>,
}

/// Sign a payload value into a proof envelope.
///
/// # Errors
///
/// Returns [`ProofError::Encode`] when the value cannot be canonically
/// encoded.
pub fn sign_value(
    value: &Value,
    identity: &SigningIdentity,
    opts: &SignOptions,
) -> Result<ProofEnvelope, ProofError> {
    let bytes = odin_oml::encode(value)?;
    Ok(sign_bytes(&bytes, identity, opts))
}

/// Sign pre-encoded canonical bytes into a proof envelope.
#[must_use]
pub fn sign_bytes(bytes: &[u8], identity: &SigningIdentity, opts: &SignOptions) -> ProofEnvelope {
    let sig = identity.key.sign(bytes);
    ProofEnvelope {
        cid: odin_oml::cid(bytes),
        kid: identity.kid.clone(),
        ope: B64_URL.encode(sig.to_bytes()),
        jwks_url: opts.jwks_url.clone(),
        jwks_inline: None,
        oml_c_b64: opts.embed_bytes.then(|| B64_URL.encode(bytes)),
        sft_id: opts.sft_id.clone(),
    }
}

/// Fetches keyset documents referenced by envelopes.
#[async_trait::async_trait]
pub trait KeysetFetcher: Send + Sync {
    /// Fetch and parse the keyset at `url`.
    async fn fetch(&self, url: &str) -> Result<KeySet, ProofError>;
}

/// [`KeysetFetcher`] backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpKeysetFetcher {
    client: reqwest::Client,
}

impl HttpKeysetFetcher {
    /// Build a fetcher sharing an existing client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl KeysetFetcher for HttpKeysetFetcher {
    async fn fetch(&self, url: &str) -> Result<KeySet, ProofError> {
        let fetch_err = |reason: String| ProofError::KeysetFetch {
            url: url.to_owned(),
            reason,
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("status {}", resp.status())));
        }
        let doc: Value = resp.json().await.map_err(|e| fetch_err(e.to_string()))?;
        KeySet::from_public_document(&doc).map_err(|e| fetch_err(e.to_string()))
    }
}

/// In-memory [`KeysetFetcher`] for tests and embedders.
#[derive(Default)]
pub struct StaticKeysetFetcher {
    sets: HashMap<String, KeySet>,
}

impl StaticKeysetFetcher {
    /// Register the keyset served for `url`.
    pub fn insert(&mut self, url: impl Into<String>, set: KeySet) {
        self.sets.insert(url.into(), set);
    }
}

#[async_trait::async_trait]
impl KeysetFetcher for StaticKeysetFetcher {
    async fn fetch(&self, url: &str) -> Result<KeySet, ProofError> {
        self.sets.get(url).cloned().ok_or_else(|| ProofError::KeysetFetch {
            url: url.to_owned(),
            reason: "no keyset registered".into(),
        })
    }
}

/// Envelope verifier wired to the local key registry and a keyset fetcher.
pub struct EnvelopeVerifier {
    registry: Arc<KeyRegistry>,
    fetcher: Arc<dyn KeysetFetcher>,
}

impl EnvelopeVerifier {
    /// Build a verifier.
    #[must_use]
    pub fn new(registry: Arc<KeyRegistry>, fetcher: Arc<dyn KeysetFetcher>) -> Self {
        Self { registry, fetcher }
    }

    /// Verify an envelope.
    ///
    /// Payload bytes are taken from, in order: `provided_bytes`, the
    /// envelope's inline `oml_c_b64`, or the canonical encoding of
    /// `provided_value`. The key is resolved from the inline keyset, then
    /// the keyset URL (its host must pass `host_allowed`), then the local
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProofError`] encountered; errors are final.
    pub async fn verify(
        &self,
        envelope: &ProofEnvelope,
        provided_bytes: Option<&[u8]>,
        provided_value: Option<&Value>,
        host_allowed: impl Fn(&str) -> bool,
        expected_sft: Option<&str>,
    ) -> Result<Attestation, ProofError> {
        let bytes: Vec<u8> = if let Some(b) = provided_bytes {
            b.to_vec()
        } else if let Some(b64) = &envelope.oml_c_b64 {
            B64_URL.decode(b64).map_err(|_| ProofError::BadBase64 {
                field: "oml_c_b64".into(),
            })?
        } else if let Some(value) = provided_value {
            odin_oml::encode(value)?
        } else {
            return Err(ProofError::MissingPayload);
        };

        let computed = odin_oml::cid(&bytes);
        if computed != envelope.cid {
            return Err(ProofError::CidMismatch {
                declared: envelope.cid.clone(),
                computed,
            });
        }

        let (key, keyset_source) = self.resolve_key(envelope, &host_allowed).await?;

        let sig_bytes = B64_URL.decode(&envelope.ope).map_err(|_| ProofError::BadBase64 {
            field: "ope".into(),
        })?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| ProofError::BadSignature {
            kid: envelope.kid.clone(),
        })?;
        key.verify(&bytes, &sig).map_err(|_| ProofError::BadSignature {
            kid: envelope.kid.clone(),
        })?;

        if let (Some(declared), Some(expected)) = (&envelope.sft_id, expected_sft) {
            if declared != expected {
                return Err(ProofError::SftViolation {
                    declared: declared.clone(),
                    expected: expected.to_owned(),
                });
            }
        }

        Ok(Attestation {
            ok: true,
            kid: envelope.kid.clone(),
            cid: envelope.cid.clone(),
            keyset_source,
        })
    }

    async fn resolve_key(
        &self,
        envelope: &ProofEnvelope,
        host_allowed: &impl Fn(&str) -> bool,
    ) -> Result<(ed25519_dalek::VerifyingKey, KeysetSource), ProofError> {
        if let Some(inline) = &envelope.jwks_inline {
            let set = KeySet::from_public_document(inline).map_err(|e| ProofError::KeysetFetch {
                url: "<inline>".into(),
                reason: e.to_string(),
            })?;
            let key = set.get(&envelope.kid).ok_or_else(|| ProofError::UnknownKid {
                kid: envelope.kid.clone(),
            })?;
            return Ok((*key, KeysetSource::Inline));
        }

        if let Some(jwks_url) = &envelope.jwks_url {
            let host = url::Url::parse(jwks_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_owned))
                .ok_or_else(|| ProofError::KeysetFetch {
                    url: jwks_url.clone(),
                    reason: "unparseable url".into(),
                })?;
            if !host_allowed(&host) {
                return Err(ProofError::KeysetHostBlocked { host });
            }
            let set = self.fetcher.fetch(jwks_url).await?;
            let key = set.get(&envelope.kid).ok_or_else(|| ProofError::UnknownKid {
                kid: envelope.kid.clone(),
            })?;
            return Ok((*key, KeysetSource::Url(jwks_url.clone())));
        }

        let key = self
            .registry
            .verifying_key(&envelope.kid)
            .ok_or_else(|| ProofError::UnknownKid {
                kid: envelope.kid.clone(),
            })?;
        Ok((key, KeysetSource::Local))
    }
}
