// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use odin_proof::{EnvelopeVerifier, ProofEnvelope, ProofError};
use odin_storage::{Storage, StorageError, keys};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Required advertisement intent.
pub const ADVERTISE_INTENT: &str = "service.advertise";

/// Maximum TTL accepted for an advertisement (one day).
pub const MAX_TTL_SECONDS: u64 = 86_400;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The advertisement payload is structurally invalid.
    #[error("invalid advertisement: {reason}")]
    InvalidPayload {
        /// What is wrong.
        reason: String,
    },
    /// The accompanying proof failed verification.
    #[error(transparent)]
    Proof(#[from] ProofError),
    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A stored record could not be decoded.
    #[error("corrupt registry record at {key}")]
    Corrupt {
        /// Storage key of the corrupt record.
        key: String,
    },
}

/// A service advertisement payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceAdvert {
    /// Must be `service.advertise`.
    pub intent: String,
    /// Service name.
    pub service: String,
    /// Service version label.
    pub version: String,
    /// Where the service is reachable.
    pub base_url: String,
    /// Semantic formats the service speaks.
    #[serde(alias = "supported_sft")]
    pub sft: Vec<String>,
    /// Advertisement lifetime in seconds.
    pub ttl_seconds: u64,
}

impl ServiceAdvert {
    fn validate(&self, max_ttl: u64) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidPayload {
            reason: reason.to_owned(),
        };
        if self.intent != ADVERTISE_INTENT {
            return Err(invalid("intent must be service.advertise"));
        }
        if self.service.is_empty() || self.version.is_empty() || self.base_url.is_empty() {
            return Err(invalid("service, version, and base_url are required"));
        }
        if self.sft.is_empty() {
            return Err(invalid("at least one sft is required"));
        }
        if self.ttl_seconds == 0 || self.ttl_seconds > max_ttl {
            return Err(invalid("ttl_seconds is out of range"));
        }
        Ok(())
    }
}

/// A persisted registry record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistryRecord {
    /// CID of the canonical advertisement payload.
    pub id: String,
    /// The advertisement.
    pub payload: ServiceAdvert,
    /// The proof it arrived with.
    pub proof: ProofEnvelope,
    /// Unix seconds at registration.
    pub created_ts: i64,
    /// `created_ts + ttl_seconds`.
    pub expires_ts: i64,
}

impl RegistryRecord {
    /// Whether the record is expired at `now`.
    #[must_use]
    pub fn expired(&self, now: i64) -> bool {
        now >= self.expires_ts
    }
}

/// Listing filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    /// Exact service-name filter.
    pub service: Option<String>,
    /// Keep records advertising this format.
    pub sft: Option<String>,
    /// Filter out expired records (default true).
    pub active_only: Option<bool>,
    /// Maximum number of records returned.
    pub limit: Option<usize>,
}

/// The registry service.
pub struct ServiceRegistry {
    storage: Arc<dyn Storage>,
    verifier: Arc<EnvelopeVerifier>,
    max_ttl_seconds: u64,
}

impl ServiceRegistry {
    /// Build a registry over `storage`, verifying proofs with `verifier`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, verifier: Arc<EnvelopeVerifier>) -> Self {
        Self {
            storage,
            verifier,
            max_ttl_seconds: MAX_TTL_SECONDS,
        }
    }

    /// Verify, validate, and persist an advertisement.
    ///
    /// The id is the CID of the canonical payload, so re-registering an
    /// identical advertisement is idempotent while it is live; once the
    /// record has expired a fresh registration replaces it.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] from proof verification, payload
    /// validation, or persistence.
    pub async fn register(
        &self,
        payload: &Value,
        proof: &ProofEnvelope,
        host_allowed: impl Fn(&str) -> bool,
        now: i64,
    ) -> Result<RegistryRecord, RegistryError> {
        self.verifier
            .verify(proof, None, Some(payload), host_allowed, None)
            .await?;

        let advert: ServiceAdvert =
            serde_json::from_value(payload.clone()).map_err(|e| RegistryError::InvalidPayload {
                reason: e.to_string(),
            })?;
        advert.validate(self.max_ttl_seconds)?;

        let id = odin_oml::cid_of(payload).map_err(|e| RegistryError::InvalidPayload {
            reason: e.to_string(),
        })?;
        let key = keys::registry(&id);

        if let Some(existing) = self.read_record(&key).await? {
            if !existing.expired(now) {
                return Ok(existing);
            }
            self.storage.delete(&key).await?;
        }

        let record = RegistryRecord {
            id: id.clone(),
            expires_ts: now + advert.ttl_seconds as i64,
            payload: advert,
            proof: proof.clone(),
            created_ts: now,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| {
            RegistryError::InvalidPayload {
                reason: e.to_string(),
            }
        })?;
        self.storage
            .put_bytes(&key, &bytes, "application/json")
            .await?;
        info!(id = %id, service = %record.payload.service, "service registered");
        Ok(record)
    }

    /// List records matching `filter`, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] from the storage backend.
    pub async fn list(&self, filter: &ListFilter, now: i64) -> Result<Vec<RegistryRecord>, RegistryError> {
        let limit = filter.limit.unwrap_or(100);
        let active_only = filter.active_only.unwrap_or(true);
        let record_keys = self.storage.list("registry/", 10_000).await?;
        let mut out = Vec::new();
        for key in record_keys {
            let Some(record) = self.read_record(&key).await? else {
                continue;
            };
            if active_only && record.expired(now) {
                continue;
            }
            if let Some(service) = &filter.service {
                if &record.payload.service != service {
                    continue;
                }
            }
            if let Some(sft) = &filter.sft {
                if !record.payload.sft.iter().any(|s| s == sft) {
                    continue;
                }
            }
            out.push(record);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] from the storage backend.
    pub async fn get(&self, id: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        self.read_record(&keys::registry(id)).await
    }

    /// Delete a record by id. Deleting an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] from the storage backend.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        Ok(self.storage.delete(&keys::registry(id)).await?)
    }

    async fn read_record(&self, key: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        match self.storage.get_bytes(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|_| RegistryError::Corrupt { key: key.to_owned() }),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odin_keys::{KeyRegistry, KeySet, SigningIdentity};
    use odin_proof::{SignOptions, StaticKeysetFetcher};
    use odin_storage::MemStore;
    use serde_json::json;
    use std::time::Duration;

    fn identity() -> SigningIdentity {
        SigningIdentity {
            kid: "agent-beta".into(),
            key: ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]),
        }
    }

    fn registry() -> (ServiceRegistry, SigningIdentity) {
        let id = identity();
        let set = KeySet::from_pairs([(id.kid.clone(), id.verifying_key())], None).unwrap();
        let verifier = Arc::new(EnvelopeVerifier::new(
            Arc::new(KeyRegistry::from_set(set, Duration::from_secs(60))),
            Arc::new(StaticKeysetFetcher::default()),
        ));
        (
            ServiceRegistry::new(Arc::new(MemStore::new()), verifier),
            id,
        )
    }

    fn advert() -> Value {
        json!({
            "intent": "service.advertise",
            "service": "agent_beta",
            "version": "v1",
            "base_url": "http://b:9090",
            "sft": ["beta@v1"],
            "ttl_seconds": 3600,
        })
    }

    fn proof_for(payload: &Value, id: &SigningIdentity) -> ProofEnvelope {
        odin_proof::sign_value(payload, id, &SignOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn register_and_list() {
        let (registry, id) = registry();
        let payload = advert();
        let proof = proof_for(&payload, &id);
        let record = registry.register(&payload, &proof, |_| true, 1_000).await.unwrap();
        assert_eq!(record.id, odin_oml::cid_of(&payload).unwrap());
        assert_eq!(record.expires_ts, 1_000 + 3_600);

        let filter = ListFilter {
            service: Some("agent_beta".into()),
            ..ListFilter::default()
        };
        let listed = registry.list(&filter, 1_001).await.unwrap();
        assert!(!listed.is_empty());
        assert_eq!(listed[0].id, record.id);
    }

    #[tokio::test]
    async fn bad_proof_is_rejected() {
        let (registry, id) = registry();
        let payload = advert();
        let mut proof = proof_for(&payload, &id);
        proof.cid = "tampered".into();
        let err = registry.register(&payload, &proof, |_| true, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::Proof(_)));
    }

    #[tokio::test]
    async fn wrong_intent_is_rejected() {
        let (registry, id) = registry();
        let mut payload = advert();
        payload["intent"] = json!("service.something_else");
        let proof = proof_for(&payload, &id);
        let err = registry.register(&payload, &proof, |_| true, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected() {
        let (registry, id) = registry();
        let mut payload = advert();
        payload["ttl_seconds"] = json!(MAX_TTL_SECONDS + 1);
        let proof = proof_for(&payload, &id);
        let err = registry.register(&payload, &proof, |_| true, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn expired_records_drop_out_of_listing() {
        let (registry, id) = registry();
        let payload = advert();
        let proof = proof_for(&payload, &id);
        registry.register(&payload, &proof, |_| true, 1_000).await.unwrap();

        let after_expiry = 1_000 + 3_600;
        let listed = registry.list(&ListFilter::default(), after_expiry).await.unwrap();
        assert!(listed.is_empty());

        let include_expired = ListFilter {
            active_only: Some(false),
            ..ListFilter::default()
        };
        assert_eq!(registry.list(&include_expired, after_expiry).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reregistration_is_idempotent_then_refreshes() {
        let (registry, id) = registry();
        let payload = advert();
        let proof = proof_for(&payload, &id);
        let first = registry.register(&payload, &proof, |_| true, 1_000).await.unwrap();
        // Still live: same record back.
        let second = registry.register(&payload, &proof, |_| true, 2_000).await.unwrap();
        assert_eq!(second.created_ts, first.created_ts);
        // Expired: refreshed.
        let third = registry.register(&payload, &proof, |_| true, 10_000).await.unwrap();
        assert_eq!(third.created_ts, 10_000);
    }

    #[tokio::test]
    async fn get_and_idempotent_delete() {
        let (registry, id) = registry();
        let payload = advert();
        let proof = proof_for(&payload, &id);
        let record = registry.register(&payload, &proof, |_| true, 1_000).await.unwrap();

        assert!(registry.get(&record.id).await.unwrap().is_some());
        registry.delete(&record.id).await.unwrap();
        registry.delete(&record.id).await.unwrap();
        assert!(registry.get(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sft_filter_applies() {
        let (registry, id) = registry();
        let payload = advert();
        let proof = proof_for(&payload, &id);
        registry.register(&payload, &proof, |_| true, 1_000).await.unwrap();

        let hit = ListFilter {
            sft: Some("beta@v1".into()),
            ..ListFilter::default()
        };
        assert_eq!(registry.list(&hit, 1_001).await.unwrap().len(), 1);

        let miss = ListFilter {
            sft: Some("gamma@v1".into()),
            ..ListFilter::default()
        };
        assert!(registry.list(&miss, 1_001).await.unwrap().is_empty());
    }
}
