// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

/// Route handlers.
pub mod api;
/// Environment configuration.
pub mod config;
/// Wire error taxonomy.
pub mod error;
/// Prometheus metric families.
pub mod metrics;
/// Middleware pipeline.
pub mod pipeline;
/// Per-tenant token buckets.
pub mod quota;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use config::{GatewayConfig, StorageBackend};
use metrics::Metrics;
use odin_bridge::{BridgeClient, HopPolicy};
use odin_httpsig::HttpSigVerifier;
use odin_keys::{KeyRegistry, KeySource, SigningIdentity};
use odin_policy::{HelPolicy, PolicySource, PolicyStore};
use odin_proof::{EnvelopeVerifier, HttpKeysetFetcher, KeysetFetcher};
use odin_registry::ServiceRegistry;
use odin_roaming::{RoamingVerifier, TrustAnchors};
use odin_sft::MapRegistry;
use odin_storage::{FallbackStore, FsStore, HttpStore, MemStore, MirrorStore, Storage};
use quota::QuotaSet;
use std::sync::Arc;
use std::time::Duration;

/// Fallback payload ceiling when no policy source is configured.
const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1_048_576;

/// Everything a request handler can reach.
pub struct AppState {
    /// Immutable environment configuration.
    pub config: GatewayConfig,
    /// Verification-key registry.
    pub keys: Arc<KeyRegistry>,
    /// The gateway's signing identity.
    pub signing: Arc<SigningIdentity>,
    /// Hot-reloadable policy.
    pub policy: Arc<PolicyStore>,
    /// Hot-reloadable SFT maps.
    pub maps: Arc<MapRegistry>,
    /// Receipt and ledger store.
    pub storage: Arc<dyn Storage>,
    /// Proof-envelope verifier.
    pub verifier: Arc<EnvelopeVerifier>,
    /// Inbound HTTP-signature verifier.
    pub httpsig: Arc<HttpSigVerifier>,
    /// Outbound hop client.
    pub bridge: Arc<BridgeClient>,
    /// Signed service registry.
    pub registry: Arc<ServiceRegistry>,
    /// Roaming-pass verifier.
    pub roaming: Arc<RoamingVerifier>,
    /// Metric families.
    pub metrics: Arc<Metrics>,
    /// Per-tenant quotas.
    pub quotas: Arc<QuotaSet>,
}

impl AppState {
    /// Wire up every subsystem from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when key material, policy, maps, or trust anchors
    /// fail to load — the gateway refuses to start half-configured.
    pub fn build(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let rotation_grace = Duration::from_secs(config.rotation_grace_secs);
        let keys = Arc::new(load_key_registry(&config, rotation_grace)?);
        let signing = Arc::new(SigningIdentity::from_seed_or_ephemeral(
            config.signing_seed.as_deref(),
            config.signing_kid.clone(),
        )?);

        let policy = Arc::new(load_policy(&config)?);
        let maps = Arc::new(match &config.maps_dir {
            Some(dir) => MapRegistry::load_dir(dir.clone())?,
            None => MapRegistry::empty(),
        });

        let metrics = Arc::new(Metrics::new());
        let http = reqwest::Client::new();
        let storage = build_storage(&config, &http, &metrics);

        let fetcher: Arc<dyn KeysetFetcher> = Arc::new(HttpKeysetFetcher::new(http));
        let verifier = Arc::new(EnvelopeVerifier::new(keys.clone(), fetcher.clone()));
        let httpsig = Arc::new(HttpSigVerifier::new(keys.clone(), config.httpsig_skew_secs));

        let bridge = Arc::new(
            BridgeClient::new(HopPolicy {
                timeout_ms: config.bridge_timeout_ms,
                retries: config.bridge_retries,
                backoff_ms: config.bridge_backoff_ms,
                max_hops: config.bridge_max_hops,
                allow_private: config.bridge_allow_private,
            })
            .with_signer((*signing).clone()),
        );

        let registry = Arc::new(ServiceRegistry::new(storage.clone(), verifier.clone()));
        let anchors = TrustAnchors::from_yaml_file(&config.trust_anchors_path)?;
        let roaming = Arc::new(RoamingVerifier::new(
            anchors,
            fetcher,
            config.external_url.clone(),
        ));

        let quotas = Arc::new(QuotaSet::new(config.quota_rate, config.quota_burst));

        Ok(Arc::new(Self {
            config,
            keys,
            signing,
            policy,
            maps,
            storage,
            verifier,
            httpsig,
            bridge,
            registry,
            roaming,
            metrics,
            quotas,
        }))
    }
}

fn load_key_registry(
    config: &GatewayConfig,
    rotation_grace: Duration,
) -> anyhow::Result<KeyRegistry> {
    let mut sources = Vec::new();
    if let Some(doc) = &config.keystore_json {
        sources.push(KeySource::InlineJson(doc.clone()));
    }
    if let Some(path) = &config.keystore_path {
        sources.push(KeySource::File(path.clone()));
    }
    if let Some(key) = &config.keystore_pubkey {
        sources.push(KeySource::SinglePublicKey(key.clone()));
    }
    if sources.is_empty() {
        // No verification material configured: serve only the gateway's
        // own key so response signatures remain verifiable.
        let signing = SigningIdentity::from_seed_or_ephemeral(
            config.signing_seed.as_deref(),
            config.signing_kid.clone(),
        )?;
        let set = odin_keys::KeySet::from_pairs(
            [(signing.kid.clone(), signing.verifying_key())],
            Some(signing.kid.clone()),
        )?;
        return Ok(KeyRegistry::from_set(set, rotation_grace));
    }
    Ok(KeyRegistry::load(sources, rotation_grace)?)
}

fn load_policy(config: &GatewayConfig) -> anyhow::Result<PolicyStore> {
    if let Some(doc) = &config.policy_json {
        return Ok(PolicyStore::load(PolicySource::InlineJson(doc.clone()))?);
    }
    if let Some(path) = &config.policy_path {
        return Ok(PolicyStore::load(PolicySource::File(path.clone()))?);
    }
    Ok(PolicyStore::fixed(HelPolicy::permissive(
        DEFAULT_MAX_PAYLOAD_BYTES,
    ))?)
}

fn build_storage(
    config: &GatewayConfig,
    http: &reqwest::Client,
    metrics: &Arc<Metrics>,
) -> Arc<dyn Storage> {
    let make = |backend: &StorageBackend| -> Arc<dyn Storage> {
        match backend {
            StorageBackend::Fs => Arc::new(FsStore::new(config.data_dir.clone())),
            StorageBackend::Mem => Arc::new(MemStore::new()),
            StorageBackend::Http(base) => Arc::new(HttpStore::new(http.clone(), base.clone())),
        }
    };
    let primary = make(&config.storage_backend);
    let composed: Arc<dyn Storage> = match &config.storage_fallback {
        Some(fallback) => {
            let metrics = metrics.clone();
            Arc::new(
                FallbackStore::new(primary, make(fallback)).with_failure_hook(Arc::new(
                    move |_op| {
                        metrics
                            .receipt_write_failures_total
                            .with_label_values(&["primary_storage"])
                            .inc();
                    },
                )),
            )
        }
        None => primary,
    };
    // Remote backends get a local write-through read mirror.
    if matches!(config.storage_backend, StorageBackend::Http(_)) {
        return Arc::new(MirrorStore::new(composed));
    }
    composed
}

/// Build the full router with the middleware pipeline attached.
///
/// Layer nesting encodes the contract ordering: quota precedes crypto,
/// proof unwrap precedes handlers, response signing runs directly around
/// the handlers, and discovery-header attachment observes the signed
/// response. `.layer` wraps outside-in, so the list below reads from
/// innermost (signing) to outermost (observe).
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/envelope", post(api::envelope))
        .route("/v1/translate", post(api::translate))
        .route("/v1/bridge/{target}", post(api::bridge))
        .route("/v1/verify", post(api::verify))
        .route("/v1/receipts/transform/{output_cid}", get(api::get_transform_receipt))
        .route("/v1/receipts/hops/chain/{trace_id}", get(api::get_chain))
        .route("/v1/receipts/hops", get(api::list_hops))
        .route("/v1/receipts/{cid}", get(api::get_receipt))
        .route("/v1/registry/register", post(api::registry_register))
        .route("/v1/registry/services", get(api::registry_list))
        .route(
            "/v1/registry/services/{id}",
            get(api::registry_get).delete(api::registry_delete),
        )
        .route("/v1/roaming/pass", post(api::roaming_mint))
        .route("/v1/roaming/config", get(api::roaming_config))
        .route("/v1/admin/reload/policy", post(api::admin_reload_policy))
        .route("/v1/admin/reload/maps", post(api::admin_reload_maps))
        .route(
            "/v1/admin/agents",
            post(api::admin_register_agent).get(api::admin_list_agents),
        )
        .route("/v1/admin/agents/{did}/status", post(api::admin_set_agent_status))
        .route("/.well-known/odin/discovery.json", get(api::discovery))
        .route("/.well-known/odin/jwks.json", get(api::jwks))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics_text))
        .layer(from_fn_with_state(state.clone(), pipeline::sign_responses))
        .layer(from_fn_with_state(state.clone(), pipeline::enforce_httpsig))
        .layer(from_fn_with_state(state.clone(), pipeline::enforce_proof))
        .layer(from_fn_with_state(state.clone(), pipeline::verify_roaming))
        .layer(from_fn_with_state(state.clone(), pipeline::tenant_and_quota))
        .layer(from_fn_with_state(state.clone(), pipeline::discovery_headers))
        .layer(from_fn_with_state(state.clone(), pipeline::observe))
        .with_state(state)
}
