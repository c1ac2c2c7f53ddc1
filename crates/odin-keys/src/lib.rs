// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use arc_swap::ArcSwap;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const B64_STD: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;
const B64_STD_NOPAD: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD_NO_PAD;
const B64_URL: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;
const B64_URL_PAD: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE;

/// Errors raised while loading or validating key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyLoadError {
    /// A configured keystore source could not be read.
    #[error("failed to read keystore {path}: {source}")]
    Unreadable {
        /// Path of the keystore file.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The keystore document was not valid JSON of the expected shape.
    #[error("malformed keystore document: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A key's textual material could not be decoded.
    #[error("key {kid}: material is not hex or base64")]
    Undecodable {
        /// The offending kid.
        kid: String,
    },
    /// A key decoded to the wrong number of bytes.
    #[error("key {kid}: expected 32 bytes, got {len}")]
    WrongLength {
        /// The offending kid.
        kid: String,
        /// Decoded length.
        len: usize,
    },
    /// The decoded bytes are not a valid Ed25519 public key.
    #[error("key {kid}: invalid Ed25519 point")]
    InvalidPoint {
        /// The offending kid.
        kid: String,
    },
    /// Two entries share a kid.
    #[error("duplicate kid {kid}")]
    DuplicateKid {
        /// The duplicated kid.
        kid: String,
    },
    /// Two entries share the same public-key bytes.
    #[error("kids {first} and {second} carry the same public key")]
    DuplicateKeyBytes {
        /// First kid with these bytes.
        first: String,
        /// Second kid with the same bytes.
        second: String,
    },
    /// The keystore named an active kid that is not in the set.
    #[error("active_kid {kid} is not present in the key set")]
    UnknownActiveKid {
        /// The missing kid.
        kid: String,
    },
    /// No key source is configured at all.
    #[error("no keystore source configured")]
    NoSource,
}

/// Where key material comes from, in precedence order.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Inline JSON document (highest precedence).
    InlineJson(String),
    /// A keystore file on disk.
    File(PathBuf),
    /// A single public key; registered under the kid `env-key`.
    SinglePublicKey(String),
}

/// One entry of the keystore document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeystoreEntry {
    kid: String,
    public_key: String,
}

/// On-disk / inline keystore document shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeystoreDoc {
    #[serde(default)]
    active_kid: Option<String>,
    keys: Vec<KeystoreEntry>,
}

/// An immutable, validated set of verification keys in stable kid order.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: BTreeMap<String, VerifyingKey>,
    active_kid: Option<String>,
}

impl KeySet {
    /// Build a key set from `(kid, key)` pairs, enforcing uniqueness of both
    /// kids and public-key bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyLoadError`] on duplicates or when `active_kid` names a
    /// kid not in the set.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (String, VerifyingKey)>,
        active_kid: Option<String>,
    ) -> Result<Self, KeyLoadError> {
        let mut keys = BTreeMap::new();
        let mut by_bytes: BTreeMap<[u8; 32], String> = BTreeMap::new();
        for (kid, key) in pairs {
            if keys.contains_key(&kid) {
                return Err(KeyLoadError::DuplicateKid { kid });
            }
            if let Some(first) = by_bytes.get(key.as_bytes()) {
                return Err(KeyLoadError::DuplicateKeyBytes {
                    first: first.clone(),
                    second: kid,
                });
            }
            by_bytes.insert(*key.as_bytes(), kid.clone());
            keys.insert(kid, key);
        }
        if let Some(active) = &active_kid {
            if !keys.contains_key(active) {
                return Err(KeyLoadError::UnknownActiveKid { kid: active.clone() });
            }
        }
        Ok(Self { keys, active_kid })
    }

    /// Parse a keystore document (inline or file contents).
    fn from_doc_str(doc: &str) -> Result<Self, KeyLoadError> {
        let doc: KeystoreDoc = serde_json::from_str(doc)?;
        let mut pairs = Vec::with_capacity(doc.keys.len());
        for entry in doc.keys {
            let key = decode_verifying_key(&entry.kid, &entry.public_key)?;
            pairs.push((entry.kid, key));
        }
        Self::from_pairs(pairs, doc.active_kid)
    }

    /// Look up a key by kid.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&VerifyingKey> {
        self.keys.get(kid)
    }

    /// All keys in stable kid order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VerifyingKey)> {
        self.keys.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The designated active kid, if one was declared.
    #[must_use]
    pub fn active_kid(&self) -> Option<&str> {
        self.active_kid.as_deref()
    }

    /// Render a JWKS-style public document suitable for the well-known
    /// discovery path.
    #[must_use]
    pub fn as_public_document(&self) -> serde_json::Value {
        let keys: Vec<serde_json::Value> = self
            .keys
            .iter()
            .map(|(kid, key)| {
                serde_json::json!({
                    "kid": kid,
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "x": B64_URL.encode(key.as_bytes()),
                })
            })
            .collect();
        match &self.active_kid {
            Some(active) => serde_json::json!({ "keys": keys, "active_kid": active }),
            None => serde_json::json!({ "keys": keys }),
        }
    }

    /// Parse a JWKS-style public document (the shape served by
    /// [`KeySet::as_public_document`]) into a key set.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyLoadError`] for malformed documents or invalid keys.
    pub fn from_public_document(doc: &serde_json::Value) -> Result<Self, KeyLoadError> {
        #[derive(Deserialize)]
        struct Jwk {
            kid: String,
            x: String,
        }
        #[derive(Deserialize)]
        struct Jwks {
            #[serde(default)]
            active_kid: Option<String>,
            keys: Vec<Jwk>,
        }
        let jwks: Jwks = serde_json::from_value(doc.clone())?;
        let mut pairs = Vec::with_capacity(jwks.keys.len());
        for jwk in jwks.keys {
            let key = decode_verifying_key(&jwk.kid, &jwk.x)?;
            pairs.push((jwk.kid, key));
        }
        Self::from_pairs(pairs, jwks.active_kid)
    }
}

/// Decode textual key material: hex, base64, or base64url, padded or not,
/// surrounding whitespace ignored.
fn decode_key_text(text: &str) -> Option<Vec<u8>> {
    let trimmed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if trimmed.len() == 64 {
        if let Ok(bytes) = hex::decode(&trimmed) {
            return Some(bytes);
        }
    }
    B64_URL
        .decode(&trimmed)
        .or_else(|_| B64_URL_PAD.decode(&trimmed))
        .or_else(|_| B64_STD.decode(&trimmed))
        .or_else(|_| B64_STD_NOPAD.decode(&trimmed))
        .ok()
}

/// Decode and validate one verification key.
///
/// # Errors
///
/// Returns a [`KeyLoadError`] when the text cannot be decoded, decodes to
/// the wrong length, or is not a valid Ed25519 point.
pub fn decode_verifying_key(kid: &str, text: &str) -> Result<VerifyingKey, KeyLoadError> {
    let bytes = decode_key_text(text).ok_or_else(|| KeyLoadError::Undecodable {
        kid: kid.to_owned(),
    })?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyLoadError::WrongLength {
        kid: kid.to_owned(),
        len: bytes.len(),
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyLoadError::InvalidPoint {
        kid: kid.to_owned(),
    })
}

/// Decode a 32-byte Ed25519 signing seed from hex or base64 text.
///
/// # Errors
///
/// Returns a [`KeyLoadError`] when the text cannot be decoded or has the
/// wrong length.
pub fn decode_signing_key(text: &str) -> Result<SigningKey, KeyLoadError> {
    let bytes = decode_key_text(text).ok_or_else(|| KeyLoadError::Undecodable {
        kid: "signing".into(),
    })?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyLoadError::WrongLength {
        kid: "signing".into(),
        len: bytes.len(),
    })?;
    Ok(SigningKey::from_bytes(&arr))
}

struct RegistrySnapshot {
    active: Arc<KeySet>,
    previous: Option<(Arc<KeySet>, Instant)>,
}

/// Registry handle serving immutable [`KeySet`] snapshots with rotation
/// grace.
///
/// Readers call [`KeyRegistry::current`] or [`KeyRegistry::verifying_key`];
/// both are lock-free loads. [`KeyRegistry::reload`] swaps in a new snapshot
/// atomically and keeps the prior one addressable for verification until
/// the grace window lapses.
pub struct KeyRegistry {
    sources: Vec<KeySource>,
    snapshot: ArcSwap<RegistrySnapshot>,
    rotation_grace: Duration,
}

impl KeyRegistry {
    /// Load the registry from `sources`, listed in precedence order; the
    /// first source is authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLoadError::NoSource`] when `sources` is empty, or the
    /// first source's load error.
    pub fn load(sources: Vec<KeySource>, rotation_grace: Duration) -> Result<Self, KeyLoadError> {
        if sources.is_empty() {
            return Err(KeyLoadError::NoSource);
        }
        let set = load_from_sources(&sources)?;
        Ok(Self {
            sources,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot {
                active: Arc::new(set),
                previous: None,
            }),
            rotation_grace,
        })
    }

    /// Build a registry directly from an existing key set (tests, embedders).
    #[must_use]
    pub fn from_set(set: KeySet, rotation_grace: Duration) -> Self {
        Self {
            sources: Vec::new(),
            snapshot: ArcSwap::from_pointee(RegistrySnapshot {
                active: Arc::new(set),
                previous: None,
            }),
            rotation_grace,
        }
    }

    /// The current active key set.
    #[must_use]
    pub fn current(&self) -> Arc<KeySet> {
        self.snapshot.load().active.clone()
    }

    /// Resolve a verification key by kid, consulting the active snapshot and
    /// then, within the grace window, the previous one.
    #[must_use]
    pub fn verifying_key(&self, kid: &str) -> Option<VerifyingKey> {
        let snap = self.snapshot.load();
        if let Some(key) = snap.active.get(kid) {
            return Some(*key);
        }
        if let Some((prev, rotated_at)) = &snap.previous {
            if rotated_at.elapsed() <= self.rotation_grace {
                return prev.get(kid).copied();
            }
        }
        None
    }

    /// Re-read the configured sources and publish a new snapshot.
    ///
    /// Readers never observe a partial set: the swap is a single atomic
    /// pointer store.
    ///
    /// # Errors
    ///
    /// Returns the source's load error; on failure the previous snapshot
    /// stays in place.
    pub fn reload(&self) -> Result<(), KeyLoadError> {
        if self.sources.is_empty() {
            return Ok(());
        }
        let set = load_from_sources(&self.sources)?;
        let old = self.snapshot.load().active.clone();
        self.snapshot.store(Arc::new(RegistrySnapshot {
            active: Arc::new(set),
            previous: Some((old, Instant::now())),
        }));
        Ok(())
    }
}

fn load_from_sources(sources: &[KeySource]) -> Result<KeySet, KeyLoadError> {
    let source = sources.first().ok_or(KeyLoadError::NoSource)?;
    match source {
        KeySource::InlineJson(doc) => KeySet::from_doc_str(doc),
        KeySource::File(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| KeyLoadError::Unreadable {
                path: path.display().to_string(),
                source,
            })?;
            KeySet::from_doc_str(&text)
        }
        KeySource::SinglePublicKey(text) => {
            let key = decode_verifying_key("env-key", text)?;
            KeySet::from_pairs([("env-key".to_owned(), key)], Some("env-key".to_owned()))
        }
    }
}

/// The gateway's own signing identity.
#[derive(Clone)]
pub struct SigningIdentity {
    /// Kid advertised on signatures the gateway produces.
    pub kid: String,
    /// The Ed25519 signing key.
    pub key: SigningKey,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Build from a configured seed, or generate an ephemeral key when no
    /// seed is configured. Ephemeral keys are fine for development but mean
    /// signatures do not survive a restart, hence the warning.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyLoadError`] when a configured seed is undecodable.
    pub fn from_seed_or_ephemeral(
        seed: Option<&str>,
        kid: impl Into<String>,
    ) -> Result<Self, KeyLoadError> {
        let kid = kid.into();
        let key = match seed {
            Some(text) => decode_signing_key(text)?,
            None => {
                warn!(kid = %kid, "no signing seed configured; generating ephemeral key");
                SigningKey::generate(&mut rand::rngs::OsRng)
            }
        };
        Ok(Self { kid, key })
    }

    /// The matching verification key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}
