// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use arc_swap::ArcSwap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors raised while loading or compiling a policy document.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy file could not be read.
    #[error("failed to read policy {path}: {source}")]
    Unreadable {
        /// Path of the policy file.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The document was not valid JSON of the expected shape.
    #[error("malformed policy document: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A glob pattern failed to compile.
    #[error("invalid glob {pattern} in {rule}: {reason}")]
    BadGlob {
        /// Rule the pattern belongs to.
        rule: String,
        /// The offending pattern.
        pattern: String,
        /// Compiler detail.
        reason: String,
    },
    /// A field-constraint regex failed to compile.
    #[error("invalid regex for {path}: {reason}")]
    BadRegex {
        /// Constrained payload path.
        path: String,
        /// Compiler detail.
        reason: String,
    },
    /// No policy source is configured.
    #[error("no policy source configured")]
    NoSource,
}

/// Per-path predicate in `field_constraints`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FieldConstraint {
    /// Required JSON type: `string | number | boolean | array | object | null`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Regex the (string) value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Inclusive numeric lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Closed set of permitted values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
}

/// The HEL rule document. `max_payload_bytes` is deliberately mandatory:
/// a policy that does not bound payload size is rejected at load time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HelPolicy {
    /// Kid allowlist (globs). Empty means any kid.
    #[serde(default)]
    pub allow_kids: Vec<String>,
    /// Kid denylist (globs). Deny wins.
    #[serde(default)]
    pub deny_kids: Vec<String>,
    /// Hosts remote keysets may be fetched from. Empty means none.
    #[serde(default)]
    pub allowed_keyset_hosts: Vec<String>,
    /// Intent allowlist (globs). Empty means any intent.
    #[serde(default)]
    pub allow_intents: Vec<String>,
    /// Intent denylist (globs). Deny wins.
    #[serde(default)]
    pub deny_intents: Vec<String>,
    /// Intents (globs) whose payloads must carry a non-empty `reason`.
    #[serde(default)]
    pub required_reason_for: Vec<String>,
    /// Per-path predicates over the payload.
    #[serde(default)]
    pub field_constraints: BTreeMap<String, FieldConstraint>,
    /// Hard limit on decoded canonical-byte size.
    pub max_payload_bytes: u64,
    /// Headers that must be present and non-empty.
    #[serde(default)]
    pub required_headers: Vec<String>,
}

impl HelPolicy {
    /// A policy that allows everything except oversized payloads.
    #[must_use]
    pub fn permissive(max_payload_bytes: u64) -> Self {
        Self {
            allow_kids: Vec::new(),
            deny_kids: Vec::new(),
            allowed_keyset_hosts: Vec::new(),
            allow_intents: Vec::new(),
            deny_intents: Vec::new(),
            required_reason_for: Vec::new(),
            field_constraints: BTreeMap::new(),
            max_payload_bytes,
            required_headers: Vec::new(),
        }
    }
}

/// One rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Violation {
    /// The rule that fired.
    pub rule: String,
    /// Human-readable detail.
    pub detail: String,
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The request is blocked; see violations.
    Deny,
}

/// Evaluation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Evaluation {
    /// Final decision.
    pub decision: Decision,
    /// Every rule that fired (empty on allow).
    pub violations: Vec<Violation>,
}

impl Evaluation {
    /// Whether the request is allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// The facts a policy is evaluated against.
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    /// Kid from the verified envelope, if any.
    pub kid: Option<&'a str>,
    /// Host of a remote keyset the envelope references, if any.
    pub keyset_host: Option<&'a str>,
    /// Decoded payload value, if any.
    pub payload: Option<&'a Value>,
    /// Canonical payload size in bytes.
    pub payload_bytes: usize,
    /// Request headers, lowercased names.
    pub headers: &'a BTreeMap<String, String>,
}

struct CompiledConstraint {
    constraint: FieldConstraint,
    regex: Option<Regex>,
}

/// A compiled, immutable policy snapshot. Evaluation is pure: the same
/// snapshot and context always produce the same decision and violations.
pub struct PolicyEngine {
    policy: HelPolicy,
    allow_kids: Option<GlobSet>,
    deny_kids: Option<GlobSet>,
    allowed_keyset_hosts: Option<GlobSet>,
    allow_intents: Option<GlobSet>,
    deny_intents: Option<GlobSet>,
    required_reason_for: Option<GlobSet>,
    constraints: BTreeMap<String, CompiledConstraint>,
}

fn compile_globs(rule: &str, patterns: &[String]) -> Result<Option<GlobSet>, PolicyError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| PolicyError::BadGlob {
            rule: rule.to_owned(),
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| PolicyError::BadGlob {
        rule: rule.to_owned(),
        pattern: "<set>".into(),
        reason: e.to_string(),
    })?;
    Ok(Some(set))
}

fn matches(set: &Option<GlobSet>, candidate: &str) -> bool {
    set.as_ref().is_some_and(|s| s.is_match(candidate))
}

impl PolicyEngine {
    /// Compile a policy document into an engine.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] for uncompilable globs or regexes.
    pub fn compile(policy: HelPolicy) -> Result<Self, PolicyError> {
        let mut constraints = BTreeMap::new();
        for (path, constraint) in &policy.field_constraints {
            let regex = match &constraint.regex {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| PolicyError::BadRegex {
                    path: path.clone(),
                    reason: e.to_string(),
                })?),
                None => None,
            };
            constraints.insert(
                path.clone(),
                CompiledConstraint {
                    constraint: constraint.clone(),
                    regex,
                },
            );
        }
        Ok(Self {
            allow_kids: compile_globs("allow_kids", &policy.allow_kids)?,
            deny_kids: compile_globs("deny_kids", &policy.deny_kids)?,
            allowed_keyset_hosts: compile_globs(
                "allowed_keyset_hosts",
                &policy.allowed_keyset_hosts,
            )?,
            allow_intents: compile_globs("allow_intents", &policy.allow_intents)?,
            deny_intents: compile_globs("deny_intents", &policy.deny_intents)?,
            required_reason_for: compile_globs("required_reason_for", &policy.required_reason_for)?,
            constraints,
            policy,
        })
    }

    /// The source document this engine was compiled from.
    #[must_use]
    pub fn policy(&self) -> &HelPolicy {
        &self.policy
    }

    /// Whether a remote keyset may be fetched from `host`.
    #[must_use]
    pub fn keyset_host_allowed(&self, host: &str) -> bool {
        matches(&self.allowed_keyset_hosts, host)
    }

    /// Evaluate the policy against a request context.
    #[must_use]
    pub fn evaluate(&self, ctx: &RequestContext<'_>) -> Evaluation {
        let mut violations = Vec::new();

        if let Some(kid) = ctx.kid {
            if matches(&self.deny_kids, kid) {
                violations.push(Violation {
                    rule: "deny_kids".into(),
                    detail: format!("kid {kid} is denied"),
                });
            } else if self.allow_kids.is_some() && !matches(&self.allow_kids, kid) {
                violations.push(Violation {
                    rule: "allow_kids".into(),
                    detail: format!("kid {kid} is not in the allowlist"),
                });
            }
        }

        if let Some(host) = ctx.keyset_host {
            if !self.keyset_host_allowed(host) {
                violations.push(Violation {
                    rule: "allowed_keyset_hosts".into(),
                    detail: format!("keyset host {host} is not allowed"),
                });
            }
        }

        let intent = ctx
            .payload
            .and_then(|p| p.get("intent"))
            .and_then(Value::as_str);
        if let Some(intent) = intent {
            if matches(&self.deny_intents, intent) {
                violations.push(Violation {
                    rule: "deny_intents".into(),
                    detail: format!("intent {intent} is denied"),
                });
            } else if self.allow_intents.is_some() && !matches(&self.allow_intents, intent) {
                violations.push(Violation {
                    rule: "allow_intents".into(),
                    detail: format!("intent {intent} is not in the allowlist"),
                });
            }
            if matches(&self.required_reason_for, intent) {
                let reason_ok = ctx
                    .payload
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .is_some_and(|r| !r.trim().is_empty());
                if !reason_ok {
                    violations.push(Violation {
                        rule: "required_reason_for".into(),
                        detail: format!("intent {intent} requires a non-empty reason"),
                    });
                }
            }
        }

        if let Some(payload) = ctx.payload {
            for (path, compiled) in &self.constraints {
                if let Some(value) = lookup_path(payload, path) {
                    check_constraint(path, value, compiled, &mut violations);
                }
            }
        }

        if ctx.payload_bytes as u64 > self.policy.max_payload_bytes {
            violations.push(Violation {
                rule: "max_payload_bytes".into(),
                detail: format!(
                    "payload is {} bytes, limit is {}",
                    ctx.payload_bytes, self.policy.max_payload_bytes
                ),
            });
        }

        for header in &self.policy.required_headers {
            let present = ctx
                .headers
                .get(&header.to_ascii_lowercase())
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                violations.push(Violation {
                    rule: "required_headers".into(),
                    detail: format!("header {header} is missing or empty"),
                });
            }
        }

        Evaluation {
            decision: if violations.is_empty() {
                Decision::Allow
            } else {
                Decision::Deny
            },
            violations,
        }
    }
}

fn check_constraint(
    path: &str,
    value: &Value,
    compiled: &CompiledConstraint,
    violations: &mut Vec<Violation>,
) {
    let c = &compiled.constraint;
    if let Some(expected) = &c.type_ {
        let actual = json_type(value);
        if actual != expected {
            violations.push(Violation {
                rule: "field_constraints".into(),
                detail: format!("{path}: expected {expected}, got {actual}"),
            });
            return;
        }
    }
    if let Some(regex) = &compiled.regex {
        match value.as_str() {
            Some(s) if regex.is_match(s) => {}
            Some(s) => violations.push(Violation {
                rule: "field_constraints".into(),
                detail: format!("{path}: {s:?} does not match /{}/", regex.as_str()),
            }),
            None => violations.push(Violation {
                rule: "field_constraints".into(),
                detail: format!("{path}: regex constraint applies to strings only"),
            }),
        }
    }
    if c.min.is_some() || c.max.is_some() {
        match value.as_f64() {
            Some(n) => {
                if let Some(min) = c.min {
                    if n < min {
                        violations.push(Violation {
                            rule: "field_constraints".into(),
                            detail: format!("{path}: {n} is below the minimum {min}"),
                        });
                    }
                }
                if let Some(max) = c.max {
                    if n > max {
                        violations.push(Violation {
                            rule: "field_constraints".into(),
                            detail: format!("{path}: {n} is above the maximum {max}"),
                        });
                    }
                }
            }
            None => violations.push(Violation {
                rule: "field_constraints".into(),
                detail: format!("{path}: range constraint applies to numbers only"),
            }),
        }
    }
    if let Some(one_of) = &c.one_of {
        if !one_of.contains(value) {
            violations.push(Violation {
                rule: "field_constraints".into(),
                detail: format!("{path}: value is not in the permitted set"),
            });
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve a dot-separated path (array segments are numeric indices).
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Where the policy document comes from.
#[derive(Debug, Clone)]
pub enum PolicySource {
    /// Inline JSON document.
    InlineJson(String),
    /// A JSON file on disk.
    File(PathBuf),
}

/// Hot-reloadable policy handle. Each request grabs an immutable snapshot;
/// reloads publish a new one atomically.
pub struct PolicyStore {
    source: Option<PolicySource>,
    engine: ArcSwap<PolicyEngine>,
}

impl PolicyStore {
    /// Load the initial policy from `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] when the source is unreadable or the
    /// document does not compile.
    pub fn load(source: PolicySource) -> Result<Self, PolicyError> {
        let engine = load_engine(&source)?;
        Ok(Self {
            source: Some(source),
            engine: ArcSwap::from_pointee(engine),
        })
    }

    /// Build a store around a fixed policy (no reload source).
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] when the document does not compile.
    pub fn fixed(policy: HelPolicy) -> Result<Self, PolicyError> {
        Ok(Self {
            source: None,
            engine: ArcSwap::from_pointee(PolicyEngine::compile(policy)?),
        })
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicyEngine> {
        self.engine.load_full()
    }

    /// Re-read the source and swap the snapshot. On failure the previous
    /// snapshot stays in place.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] from reading or compiling the new document.
    pub fn reload(&self) -> Result<(), PolicyError> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let engine = load_engine(source)?;
        self.engine.store(Arc::new(engine));
        Ok(())
    }
}

fn load_engine(source: &PolicySource) -> Result<PolicyEngine, PolicyError> {
    let text = match source {
        PolicySource::InlineJson(doc) => doc.clone(),
        PolicySource::File(path) => {
            std::fs::read_to_string(path).map_err(|e| PolicyError::Unreadable {
                path: path.display().to_string(),
                source: e,
            })?
        }
    };
    let policy: HelPolicy = serde_json::from_str(&text)?;
    PolicyEngine::compile(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with<'a>(
        payload: &'a Value,
        headers: &'a BTreeMap<String, String>,
    ) -> RequestContext<'a> {
        RequestContext {
            kid: Some("agent-key-1"),
            keyset_host: None,
            payload: Some(payload),
            payload_bytes: 64,
            headers,
        }
    }

    fn engine(policy: HelPolicy) -> PolicyEngine {
        PolicyEngine::compile(policy).expect("compile policy")
    }

    #[test]
    fn permissive_policy_allows() {
        let e = engine(HelPolicy::permissive(1024));
        let headers = BTreeMap::new();
        let payload = json!({"intent": "anything"});
        assert!(e.evaluate(&ctx_with(&payload, &headers)).is_allowed());
    }

    #[test]
    fn deny_kids_beats_allow_kids() {
        let mut p = HelPolicy::permissive(1024);
        p.allow_kids = vec!["agent-*".into()];
        p.deny_kids = vec!["agent-key-1".into()];
        let e = engine(p);
        let headers = BTreeMap::new();
        let payload = json!({});
        let eval = e.evaluate(&ctx_with(&payload, &headers));
        assert_eq!(eval.decision, Decision::Deny);
        assert_eq!(eval.violations[0].rule, "deny_kids");
    }

    #[test]
    fn allowlist_blocks_unlisted_kid() {
        let mut p = HelPolicy::permissive(1024);
        p.allow_kids = vec!["trusted-*".into()];
        let e = engine(p);
        let headers = BTreeMap::new();
        let payload = json!({});
        let eval = e.evaluate(&ctx_with(&payload, &headers));
        assert!(!eval.is_allowed());
        assert_eq!(eval.violations[0].rule, "allow_kids");
    }

    #[test]
    fn intent_rules_apply() {
        let mut p = HelPolicy::permissive(1024);
        p.allow_intents = vec!["service.*".into()];
        p.deny_intents = vec!["service.shutdown".into()];
        let e = engine(p);
        let headers = BTreeMap::new();

        let ok = json!({"intent": "service.advertise"});
        assert!(e.evaluate(&ctx_with(&ok, &headers)).is_allowed());

        let denied = json!({"intent": "service.shutdown"});
        assert_eq!(
            e.evaluate(&ctx_with(&denied, &headers)).violations[0].rule,
            "deny_intents"
        );

        let unlisted = json!({"intent": "other.thing"});
        assert_eq!(
            e.evaluate(&ctx_with(&unlisted, &headers)).violations[0].rule,
            "allow_intents"
        );
    }

    #[test]
    fn required_reason_is_enforced() {
        let mut p = HelPolicy::permissive(1024);
        p.required_reason_for = vec!["data.delete".into()];
        let e = engine(p);
        let headers = BTreeMap::new();

        let missing = json!({"intent": "data.delete"});
        assert_eq!(
            e.evaluate(&ctx_with(&missing, &headers)).violations[0].rule,
            "required_reason_for"
        );

        let blank = json!({"intent": "data.delete", "reason": "  "});
        assert!(!e.evaluate(&ctx_with(&blank, &headers)).is_allowed());

        let ok = json!({"intent": "data.delete", "reason": "user requested erasure"});
        assert!(e.evaluate(&ctx_with(&ok, &headers)).is_allowed());
    }

    #[test]
    fn field_constraints_check_type_regex_range_enum() {
        let mut p = HelPolicy::permissive(1024);
        p.field_constraints.insert(
            "amount".into(),
            FieldConstraint {
                type_: Some("number".into()),
                min: Some(0.0),
                max: Some(100.0),
                ..FieldConstraint::default()
            },
        );
        p.field_constraints.insert(
            "currency".into(),
            FieldConstraint {
                regex: Some("^[A-Z]{3}$".into()),
                ..FieldConstraint::default()
            },
        );
        p.field_constraints.insert(
            "tier".into(),
            FieldConstraint {
                one_of: Some(vec![json!("basic"), json!("pro")]),
                ..FieldConstraint::default()
            },
        );
        let e = engine(p);
        let headers = BTreeMap::new();

        let ok = json!({"amount": 50, "currency": "USD", "tier": "pro"});
        assert!(e.evaluate(&ctx_with(&ok, &headers)).is_allowed());

        let bad = json!({"amount": 500, "currency": "usd", "tier": "free"});
        let eval = e.evaluate(&ctx_with(&bad, &headers));
        assert_eq!(eval.violations.len(), 3);
    }

    #[test]
    fn nested_paths_resolve() {
        let mut p = HelPolicy::permissive(1024);
        p.field_constraints.insert(
            "order.items.0.qty".into(),
            FieldConstraint {
                min: Some(1.0),
                ..FieldConstraint::default()
            },
        );
        let e = engine(p);
        let headers = BTreeMap::new();
        let payload = json!({"order": {"items": [{"qty": 0}]}});
        assert!(!e.evaluate(&ctx_with(&payload, &headers)).is_allowed());
    }

    #[test]
    fn payload_size_limit() {
        let e = engine(HelPolicy::permissive(16));
        let headers = BTreeMap::new();
        let payload = json!({});
        let mut ctx = ctx_with(&payload, &headers);
        ctx.payload_bytes = 17;
        let eval = e.evaluate(&ctx);
        assert_eq!(eval.violations[0].rule, "max_payload_bytes");
    }

    #[test]
    fn required_headers_case_insensitive() {
        let mut p = HelPolicy::permissive(1024);
        p.required_headers = vec!["X-ODIN-Agent".into()];
        let e = engine(p);

        let mut headers = BTreeMap::new();
        let payload = json!({});
        assert!(!e.evaluate(&ctx_with(&payload, &headers)).is_allowed());

        headers.insert("x-odin-agent".into(), "did:odin:alice".into());
        assert!(e.evaluate(&ctx_with(&payload, &headers)).is_allowed());
    }

    #[test]
    fn keyset_hosts_default_to_none_allowed() {
        let e = engine(HelPolicy::permissive(1024));
        assert!(!e.keyset_host_allowed("keys.example.com"));

        let mut p = HelPolicy::permissive(1024);
        p.allowed_keyset_hosts = vec!["*.example.com".into()];
        let e = engine(p);
        assert!(e.keyset_host_allowed("keys.example.com"));
        assert!(!e.keyset_host_allowed("keys.other.org"));
    }

    #[test]
    fn missing_max_payload_bytes_fails_to_parse() {
        let doc = json!({"allow_kids": ["*"]}).to_string();
        let err = serde_json::from_str::<HelPolicy>(&doc).unwrap_err();
        assert!(err.to_string().contains("max_payload_bytes"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let mut p = HelPolicy::permissive(8);
        p.required_headers = vec!["x-a".into(), "x-b".into()];
        p.deny_intents = vec!["bad.*".into()];
        let e = engine(p);
        let headers = BTreeMap::new();
        let payload = json!({"intent": "bad.thing"});
        let mut ctx = ctx_with(&payload, &headers);
        ctx.payload_bytes = 100;
        let first = e.evaluate(&ctx);
        for _ in 0..5 {
            let again = e.evaluate(&ctx);
            assert_eq!(again.decision, first.decision);
            assert_eq!(again.violations, first.violations);
        }
    }

    #[test]
    fn store_reloads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            json!({"max_payload_bytes": 1024}).to_string(),
        )
        .unwrap();
        let store = PolicyStore::load(PolicySource::File(path.clone())).unwrap();
        assert!(store.snapshot().policy().deny_kids.is_empty());

        std::fs::write(
            &path,
            json!({"max_payload_bytes": 1024, "deny_kids": ["evil-*"]}).to_string(),
        )
        .unwrap();
        store.reload().unwrap();
        assert_eq!(store.snapshot().policy().deny_kids, vec!["evil-*"]);
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, json!({"max_payload_bytes": 64}).to_string()).unwrap();
        let store = PolicyStore::load(PolicySource::File(path.clone())).unwrap();

        std::fs::write(&path, "not json").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().policy().max_payload_bytes, 64);
    }
}
