// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prometheus metric families for the gateway.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// All gateway metric families, registered against one registry.
pub struct Metrics {
    registry: Registry,
    /// Requests by route, method, and status.
    pub requests_total: IntCounterVec,
    /// Request latency by route.
    pub request_latency: HistogramVec,
    /// Policy violations by rule.
    pub policy_violations_total: IntCounterVec,
    /// Signature verifications by service and outcome.
    pub signature_verifications_total: IntCounterVec,
    /// HTTP-signature failures by reason.
    pub httpsig_failures_total: IntCounterVec,
    /// Roaming rejections by reason.
    pub roaming_rejections_total: IntCounterVec,
    /// Transform receipts by stage and outcome.
    pub transform_receipts_total: IntCounterVec,
    /// Outbound hops by outcome.
    pub hops_total: IntCounterVec,
    /// Outbound hop latency.
    pub hop_latency: HistogramVec,
    /// Receipt write failures by kind.
    pub receipt_write_failures_total: IntCounterVec,
    /// Dynamic reloads by target.
    pub reloads_total: IntCounterVec,
    /// Quota rejections by tenant.
    pub quota_rejections_total: IntCounterVec,
    /// Outbound hops that proceeded without an identity token.
    pub identity_token_unavailable_total: IntCounterVec,
}

impl Metrics {
    /// Build and register every family.
    ///
    /// # Panics
    ///
    /// Panics when a family cannot be registered — that is a programming
    /// error (duplicate registration), not a runtime condition.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();
        let counter = |name: &str, help: &str, labels: &[&str]| {
            let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric");
            registry.register(Box::new(c.clone())).expect("unique metric");
            c
        };
        let histogram = |name: &str, help: &str, labels: &[&str]| {
            let h = HistogramVec::new(
                HistogramOpts::new(name, help).buckets(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                labels,
            )
            .expect("valid metric");
            registry.register(Box::new(h.clone())).expect("unique metric");
            h
        };

        Self {
            requests_total: counter(
                "odin_requests_total",
                "Requests by route, method, and status",
                &["route", "method", "status"],
            ),
            request_latency: histogram(
                "odin_request_latency_seconds",
                "Request latency by route",
                &["route"],
            ),
            policy_violations_total: counter(
                "odin_policy_violations_total",
                "Policy violations by rule",
                &["rule"],
            ),
            signature_verifications_total: counter(
                "odin_signature_verifications_total",
                "Signature verifications by service and outcome",
                &["service", "outcome"],
            ),
            httpsig_failures_total: counter(
                "odin_httpsig_failures_total",
                "HTTP signature failures by reason",
                &["reason"],
            ),
            roaming_rejections_total: counter(
                "odin_roaming_rejections_total",
                "Roaming pass rejections by reason",
                &["reason"],
            ),
            transform_receipts_total: counter(
                "odin_transform_receipts_total",
                "Transform receipts by stage and outcome",
                &["stage", "outcome"],
            ),
            hops_total: counter(
                "odin_hops_total",
                "Outbound hop requests by outcome",
                &["outcome"],
            ),
            hop_latency: histogram(
                "odin_hop_latency_seconds",
                "Outbound hop latency",
                &["outcome"],
            ),
            receipt_write_failures_total: counter(
                "odin_receipt_write_failures_total",
                "Receipt write failures by kind",
                &["kind"],
            ),
            reloads_total: counter(
                "odin_reloads_total",
                "Dynamic configuration reloads by target",
                &["target"],
            ),
            quota_rejections_total: counter(
                "odin_quota_rejections_total",
                "Quota rejections by tenant",
                &["tenant"],
            ),
            identity_token_unavailable_total: counter(
                "odin_identity_token_unavailable_total",
                "Outbound hops without an identity token",
                &["reason"],
            ),
            registry,
        }
    }

    /// Render the registry in text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
