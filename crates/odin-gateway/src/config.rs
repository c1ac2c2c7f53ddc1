// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven gateway configuration.
//!
//! Variable names are contractual; parsing happens once at startup and
//! the result is immutable. Hot-reloadable state (policy, keys, maps)
//! lives behind its own snapshot handles, not here.

use std::path::PathBuf;

/// Which storage backend to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local filesystem (default).
    Fs,
    /// In-memory (tests, ephemeral deployments).
    Mem,
    /// External HTTP document store at the given base URL.
    Http(String),
}

impl StorageBackend {
    fn parse(spec: &str) -> Option<Self> {
        match spec {
            "" | "fs" => Some(Self::Fs),
            "mem" => Some(Self::Mem),
            other => other.strip_prefix("http:").map(|rest| {
                // `http:https://store.example` selects the http backend.
                Self::Http(rest.to_owned())
            }),
        }
    }
}

/// Immutable gateway settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Externally reachable base URL (roaming audience, discovery).
    pub external_url: String,
    /// Path prefixes where a proof envelope is required.
    pub enforce_routes: Vec<String>,
    /// Hard-require (`true`) vs annotate-only (`false`).
    pub enforce_require: bool,
    /// Path prefixes where responses are signed.
    pub sign_routes: Vec<String>,
    /// Wrap signed responses as `{payload, proof}` instead of headers-only.
    pub sign_embed: bool,
    /// Path prefixes requiring inbound HTTP signatures.
    pub httpsig_routes: Vec<String>,
    /// Clock-skew bound for HTTP signatures, seconds.
    pub httpsig_skew_secs: i64,
    /// Inline policy JSON, highest-precedence policy source.
    pub policy_json: Option<String>,
    /// Policy file path.
    pub policy_path: Option<PathBuf>,
    /// Directory of SFT map files.
    pub maps_dir: Option<PathBuf>,
    /// Coverage gate for translations, percent.
    pub coverage_gate: Option<f64>,
    /// Inline keystore JSON, highest-precedence key source.
    pub keystore_json: Option<String>,
    /// Keystore file path.
    pub keystore_path: Option<PathBuf>,
    /// Single public verification key.
    pub keystore_pubkey: Option<String>,
    /// Signing seed for the gateway's active key.
    pub signing_seed: Option<String>,
    /// Kid advertised on gateway signatures.
    pub signing_kid: String,
    /// Grace window during key rotation, seconds.
    pub rotation_grace_secs: u64,
    /// Primary storage backend.
    pub storage_backend: StorageBackend,
    /// Optional fallback backend.
    pub storage_fallback: Option<StorageBackend>,
    /// Root directory for the filesystem backend.
    pub data_dir: PathBuf,
    /// Bridge hop budget, milliseconds.
    pub bridge_timeout_ms: u64,
    /// Bridge retries after the first attempt.
    pub bridge_retries: u32,
    /// Bridge backoff base, milliseconds.
    pub bridge_backoff_ms: u64,
    /// Hop-count ceiling.
    pub bridge_max_hops: u32,
    /// Permit forwarding into private address space.
    pub bridge_allow_private: bool,
    /// Trust-anchor file for roaming verification.
    pub trust_anchors_path: PathBuf,
    /// Admin token; admin routes 403 without it.
    pub admin_token: Option<String>,
    /// Master switch for admin routes.
    pub enable_admin: bool,
    /// Reject requests without a tenant instead of using the shared one.
    pub require_tenant: bool,
    /// Token-bucket refill rate per tenant, tokens per second.
    pub quota_rate: f64,
    /// Token-bucket burst size per tenant.
    pub quota_burst: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            external_url: "http://127.0.0.1:8484".into(),
            enforce_routes: Vec::new(),
            enforce_require: false,
            sign_routes: vec!["/v1/".into()],
            sign_embed: false,
            httpsig_routes: Vec::new(),
            httpsig_skew_secs: odin_httpsig::DEFAULT_SKEW_SECS,
            policy_json: None,
            policy_path: None,
            maps_dir: None,
            coverage_gate: None,
            keystore_json: None,
            keystore_path: None,
            keystore_pubkey: None,
            signing_seed: None,
            signing_kid: "gateway".into(),
            rotation_grace_secs: 300,
            storage_backend: StorageBackend::Fs,
            storage_fallback: None,
            data_dir: PathBuf::from(".odin/data"),
            bridge_timeout_ms: 10_000,
            bridge_retries: 2,
            bridge_backoff_ms: 250,
            bridge_max_hops: 8,
            bridge_allow_private: false,
            trust_anchors_path: PathBuf::from("configs/roaming/trust_anchors.yaml"),
            admin_token: None,
            enable_admin: false,
            require_tenant: false,
            quota_rate: 50.0,
            quota_burst: 100.0,
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    match env(name).as_deref() {
        Some("1") | Some("true") => true,
        Some("0") | Some("false") => false,
        _ => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn split_routes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

impl GatewayConfig {
    /// Resolve configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            external_url: env("ODIN_GATEWAY_URL").unwrap_or(defaults.external_url),
            enforce_routes: env("ODIN_ENFORCE_ROUTES")
                .map(|v| split_routes(&v))
                .unwrap_or_default(),
            enforce_require: env_flag("ODIN_ENFORCE_REQUIRE", false),
            sign_routes: env("ODIN_SIGN_ROUTES")
                .map(|v| split_routes(&v))
                .unwrap_or(defaults.sign_routes),
            sign_embed: env_flag("ODIN_SIGN_EMBED", false),
            httpsig_routes: env("ODIN_HTTP_SIGN_ENFORCE_ROUTES")
                .map(|v| split_routes(&v))
                .unwrap_or_default(),
            httpsig_skew_secs: env_parse("ODIN_HTTP_SIGN_SKEW_SEC", defaults.httpsig_skew_secs),
            policy_json: env("ODIN_HEL_POLICY_JSON"),
            policy_path: env("ODIN_HEL_POLICY_PATH").map(PathBuf::from),
            maps_dir: env("ODIN_SFT_MAPS_DIR").map(PathBuf::from),
            coverage_gate: env("ODIN_TRANSLATE_COVERAGE_GATE").and_then(|v| v.parse().ok()),
            keystore_json: env("ODIN_KEYSTORE_JSON"),
            keystore_path: env("ODIN_KEYSTORE_PATH").map(PathBuf::from),
            keystore_pubkey: env("ODIN_KEYSTORE_PUBKEY"),
            signing_seed: env("ODIN_SIGNING_KEY"),
            signing_kid: env("ODIN_SIGNING_KID").unwrap_or(defaults.signing_kid),
            rotation_grace_secs: env_parse("ODIN_ROTATION_GRACE_SEC", defaults.rotation_grace_secs),
            storage_backend: env("ODIN_STORAGE_BACKEND")
                .and_then(|v| StorageBackend::parse(&v))
                .unwrap_or(defaults.storage_backend),
            storage_fallback: env("ODIN_STORAGE_FALLBACK")
                .and_then(|v| StorageBackend::parse(&v)),
            data_dir: env("ODIN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bridge_timeout_ms: env_parse("ODIN_BRIDGE_TIMEOUT_MS", defaults.bridge_timeout_ms),
            bridge_retries: env_parse("ODIN_BRIDGE_RETRIES", defaults.bridge_retries),
            bridge_backoff_ms: env_parse("ODIN_BRIDGE_RETRY_BACKOFF_MS", defaults.bridge_backoff_ms),
            bridge_max_hops: env_parse("ODIN_BRIDGE_MAX_HOPS", defaults.bridge_max_hops),
            bridge_allow_private: env_flag("ODIN_BRIDGE_ALLOW_PRIVATE", false),
            trust_anchors_path: env("ODIN_ROAMING_TRUST_ANCHORS")
                .map(PathBuf::from)
                .unwrap_or(defaults.trust_anchors_path),
            admin_token: env("ODIN_ADMIN_TOKEN"),
            enable_admin: env_flag("ODIN_ENABLE_ADMIN", false),
            require_tenant: env_flag("ODIN_REQUIRE_TENANT", false),
            quota_rate: env_parse("ODIN_QUOTA_RATE", defaults.quota_rate),
            quota_burst: env_parse("ODIN_QUOTA_BURST", defaults.quota_burst),
        }
    }

    /// Whether `path` falls under one of the configured prefixes.
    #[must_use]
    pub fn route_matches(prefixes: &[String], path: &str) -> bool {
        prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}
