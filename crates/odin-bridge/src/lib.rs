// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Per-trace chain index over the receipt store.
pub mod chain;
/// Hop receipts.
pub mod receipt;

use odin_httpsig::RequestFacts;
use odin_keys::SigningIdentity;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub use receipt::{HopOutcome, HopReceipt, HopStage};

/// Header carrying the hop counter across gateways.
pub const HOP_COUNT_HEADER: &str = "x-odin-hop-count";
/// Header carrying the trace id across gateways.
pub const TRACE_HEADER: &str = "x-odin-trace-id";
/// Header carrying a roaming pass, forwarded verbatim.
pub const ROAMING_HEADER: &str = "x-odin-roaming-pass";

/// Upstream response bodies are truncated to this size in error snapshots.
const SNAPSHOT_LIMIT: usize = 2048;

/// Redirects followed per hop before giving up.
const MAX_REDIRECTS: usize = 5;

/// Resilience knobs for one outbound hop.
#[derive(Debug, Clone)]
pub struct HopPolicy {
    /// Total budget for the hop, including retries, in milliseconds.
    pub timeout_ms: u64,
    /// Retries after the first attempt, on 5xx and network errors only.
    pub retries: u32,
    /// Base backoff; attempt `i` sleeps `backoff_ms × 2^i`.
    pub backoff_ms: u64,
    /// Hard ceiling on the hop counter.
    pub max_hops: u32,
    /// Permit destinations that resolve to private address space.
    pub allow_private: bool,
}

impl Default for HopPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retries: 2,
            backoff_ms: 250,
            max_hops: 8,
            allow_private: false,
        }
    }
}

/// Failures from an outbound hop, keyed to the wire error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The hop counter reached the ceiling.
    #[error("hop limit reached: {count} of {max}")]
    HopLimit {
        /// Inbound hop count.
        count: u32,
        /// Configured ceiling.
        max: u32,
    },
    /// The target URL could not be parsed or has no host.
    #[error("invalid target url: {0}")]
    InvalidTarget(String),
    /// The destination resolves into blocked address space.
    #[error("destination {host} resolves to blocked address space")]
    BlockedDestination {
        /// The blocked host.
        host: String,
    },
    /// The upstream answered 4xx; surfaced immediately.
    #[error("upstream returned {status}")]
    Upstream4xx {
        /// Upstream status code.
        status: u16,
        /// Truncated body snapshot.
        snapshot: String,
    },
    /// The upstream answered 5xx on every attempt.
    #[error("upstream returned {status} after retries")]
    Upstream5xx {
        /// Last status code seen.
        status: u16,
        /// Truncated body snapshot.
        snapshot: String,
    },
    /// Connection, timeout, or protocol failure on every attempt.
    #[error("network failure: {detail}")]
    Network {
        /// Failure detail.
        detail: String,
    },
}

impl BridgeError {
    /// Stable error kind for receipts and counters.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HopLimit { .. } => "hop_limit",
            Self::InvalidTarget(_) => "invalid_target",
            Self::BlockedDestination { .. } => "blocked_destination",
            Self::Upstream4xx { .. } => "upstream_4xx",
            Self::Upstream5xx { .. } => "upstream_5xx",
            Self::Network { .. } => "network",
        }
    }
}

/// Optional capability that mints identity tokens for outbound calls.
///
/// When unresolved at startup, hops proceed without a token.
#[async_trait::async_trait]
pub trait IdentityTokenSource: Send + Sync {
    /// A bearer token bound to `audience`, or `None` when unavailable.
    async fn token_for(&self, audience: &str) -> Option<String>;
}

/// One outbound hop request.
#[derive(Debug, Clone)]
pub struct OutboundHop {
    /// Destination URL.
    pub target_url: String,
    /// Payload forwarded as the JSON body.
    pub payload: Value,
    /// Trace id propagated downstream.
    pub trace_id: String,
    /// Hop count observed on the inbound request.
    pub inbound_hop_count: u32,
    /// Roaming pass forwarded verbatim, when the caller presented one.
    pub roaming_pass: Option<String>,
}

/// A successful hop response.
#[derive(Debug, Clone)]
pub struct HopResponse {
    /// Upstream status code.
    pub status: u16,
    /// Parsed JSON body (raw text is wrapped in a JSON string).
    pub body: Value,
    /// Wall-clock latency of the winning attempt chain.
    pub latency_ms: u64,
    /// Hop count sent downstream.
    pub hop_count: u32,
}

/// Outbound hop client.
pub struct BridgeClient {
    http: reqwest::Client,
    policy: HopPolicy,
    signer: Option<SigningIdentity>,
    identity: Option<Arc<dyn IdentityTokenSource>>,
}

impl BridgeClient {
    /// Build a client. Redirects are followed manually so the destination
    /// guard sees every intermediate target.
    #[must_use]
    pub fn new(policy: HopPolicy) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction is infallible here");
        Self {
            http,
            policy,
            signer: None,
            identity: None,
        }
    }

    /// Sign outbound requests with this identity.
    #[must_use]
    pub fn with_signer(mut self, signer: SigningIdentity) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Attach an identity-token source.
    #[must_use]
    pub fn with_identity_source(mut self, source: Arc<dyn IdentityTokenSource>) -> Self {
        self.identity = Some(source);
        self
    }

    /// The active hop policy.
    #[must_use]
    pub fn policy(&self) -> &HopPolicy {
        &self.policy
    }

    /// Whether an identity-token source is configured.
    #[must_use]
    pub fn has_identity_source(&self) -> bool {
        self.identity.is_some()
    }

    /// Execute one hop with the configured resilience budget.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`]; 4xx is final, 5xx and network errors are
    /// retried up to the configured budget.
    pub async fn forward(&self, hop: &OutboundHop) -> Result<HopResponse, BridgeError> {
        if hop.inbound_hop_count >= self.policy.max_hops {
            return Err(BridgeError::HopLimit {
                count: hop.inbound_hop_count,
                max: self.policy.max_hops,
            });
        }
        let hop_count = hop.inbound_hop_count + 1;

        let started = Instant::now();
        let budget = Duration::from_millis(self.policy.timeout_ms);
        let outcome = tokio::time::timeout(budget, self.attempt_loop(hop, hop_count)).await;
        match outcome {
            Ok(result) => result.map(|(status, body)| HopResponse {
                status,
                body,
                latency_ms: started.elapsed().as_millis() as u64,
                hop_count,
            }),
            Err(_) => Err(BridgeError::Network {
                detail: format!("hop budget of {}ms exhausted", self.policy.timeout_ms),
            }),
        }
    }

    async fn attempt_loop(
        &self,
        hop: &OutboundHop,
        hop_count: u32,
    ) -> Result<(u16, Value), BridgeError> {
        let mut last_error = BridgeError::Network {
            detail: "no attempt executed".into(),
        };
        for attempt in 0..=self.policy.retries {
            if attempt > 0 {
                let backoff = self.policy.backoff_ms * (1u64 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.attempt_once(hop, hop_count).await {
                Ok(done) => return Ok(done),
                Err(err @ (BridgeError::Upstream5xx { .. } | BridgeError::Network { .. })) => {
                    debug!(attempt, error = %err, target = %hop.target_url, "hop attempt failed");
                    last_error = err;
                }
                Err(final_err) => return Err(final_err),
            }
        }
        Err(last_error)
    }

    async fn attempt_once(
        &self,
        hop: &OutboundHop,
        hop_count: u32,
    ) -> Result<(u16, Value), BridgeError> {
        let mut target = hop.target_url.clone();
        for _ in 0..=MAX_REDIRECTS {
            self.guard_destination(&target).await?;
            let response = self
                .send_request(&target, hop, hop_count)
                .await
                .map_err(|e| BridgeError::Network {
                    detail: e.to_string(),
                })?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| BridgeError::Network {
                        detail: format!("redirect {status} without location"),
                    })?;
                target = resolve_location(&target, location)?;
                continue;
            }

            let code = status.as_u16();
            let text = response.text().await.unwrap_or_default();
            if status.is_success() {
                let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
                return Ok((code, body));
            }
            let snapshot = truncate(&text);
            if status.is_server_error() {
                return Err(BridgeError::Upstream5xx { status: code, snapshot });
            }
            return Err(BridgeError::Upstream4xx { status: code, snapshot });
        }
        Err(BridgeError::Network {
            detail: "too many redirects".into(),
        })
    }

    async fn send_request(
        &self,
        target: &str,
        hop: &OutboundHop,
        hop_count: u32,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .http
            .post(target)
            .json(&hop.payload)
            .header(TRACE_HEADER, &hop.trace_id)
            .header(HOP_COUNT_HEADER, hop_count.to_string());

        if let Some(pass) = &hop.roaming_pass {
            request = request.header(ROAMING_HEADER, pass);
        }

        if let Some(source) = &self.identity {
            if let Some(token) = source.token_for(target).await {
                request = request.bearer_auth(token);
            }
        }

        if let Some(signer) = &self.signer {
            let path = url::Url::parse(target)
                .map(|u| u.path().to_owned())
                .unwrap_or_else(|_| "/".to_owned());
            let mut headers = BTreeMap::new();
            headers.insert(TRACE_HEADER.to_owned(), hop.trace_id.clone());
            let facts = RequestFacts {
                method: "POST".into(),
                path,
                headers,
            };
            let created = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let nonce = uuid::Uuid::new_v4().to_string();
            let (input, signature) = odin_httpsig::sign_request(
                signer,
                &["@method", "@path", TRACE_HEADER],
                &facts,
                created,
                &nonce,
            );
            request = request
                .header("signature-input", input)
                .header("signature", signature);
        }

        request.send().await
    }

    async fn guard_destination(&self, target: &str) -> Result<(), BridgeError> {
        if self.policy.allow_private {
            return Ok(());
        }
        let parsed = url::Url::parse(target)
            .map_err(|e| BridgeError::InvalidTarget(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BridgeError::InvalidTarget("missing host".into()))?
            .to_owned();
        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| BridgeError::Network {
                detail: format!("resolve {host}: {e}"),
            })?;
        for addr in addrs {
            if is_blocked_ip(addr.ip()) {
                warn!(host = %host, ip = %addr.ip(), "blocked private destination");
                return Err(BridgeError::BlockedDestination { host: host.clone() });
            }
        }
        Ok(())
    }
}

fn resolve_location(base: &str, location: &str) -> Result<String, BridgeError> {
    let base = url::Url::parse(base).map_err(|e| BridgeError::InvalidTarget(e.to_string()))?;
    base.join(location)
        .map(|u| u.to_string())
        .map_err(|e| BridgeError::InvalidTarget(e.to_string()))
}

fn truncate(text: &str) -> String {
    if text.len() <= SNAPSHOT_LIMIT {
        return text.to_owned();
    }
    let mut end = SNAPSHOT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00 // unique-local
                || (segments[0] & 0xffc0) == 0xfe80 // link-local
        }
    }
}
