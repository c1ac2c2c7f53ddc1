// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Dot-path access into JSON values.
pub mod paths;
/// Map registry with hot reload.
pub mod registry;
/// Transform receipts and linkage hashing.
pub mod receipt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub use registry::{MapRegistry, RegistryError};
pub use receipt::{TransformReceiptFile, TransformSubject, build_transform_receipt, linkage_hash};

/// Errors raised while validating a map document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// `from_sft` or `to_sft` is empty.
    #[error("map must declare non-empty from_sft and to_sft")]
    MissingFormats,
    /// Two operations write the same output path.
    #[error("duplicate mapping target {path}")]
    DuplicateTarget {
        /// The contested output path.
        path: String,
    },
}

/// A declarative mapping between two semantic formats.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SftMap {
    /// Source format id, e.g. `alpha@v1`.
    pub from_sft: String,
    /// Target format id.
    pub to_sft: String,
    /// Field renames: source path to target path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    /// Constant outputs written at target paths.
    #[serde(rename = "const", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub const_outputs: BTreeMap<String, Value>,
    /// Source paths removed from the output.
    #[serde(rename = "drop", default, skip_serializing_if = "Vec::is_empty")]
    pub drop_paths: Vec<String>,
    /// Intent rewrites applied to the payload `intent` field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub intents: BTreeMap<String, String>,
    /// Values written at target paths when absent after mapping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, Value>,
    /// Closed value sets enforced on output paths.
    #[serde(rename = "enum", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enum_constraints: BTreeMap<String, Vec<Value>>,
    /// Output paths that a complete translation should populate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Source paths declared lossy; excluded from round-trip comparison.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lossy: Vec<String>,
}

impl SftMap {
    /// Identity map for `sft` (accepted when a request maps a format onto
    /// itself).
    #[must_use]
    pub fn identity(sft: &str) -> Self {
        Self {
            from_sft: sft.to_owned(),
            to_sft: sft.to_owned(),
            ..Self::default()
        }
    }

    /// The map's stable id: `{from}__{to}`.
    #[must_use]
    pub fn map_id(&self) -> String {
        format!("{}__{}", self.from_sft, self.to_sft)
    }

    /// Validate structural invariants.
    ///
    /// # Errors
    ///
    /// Returns a [`MapError`] for empty format ids or colliding output
    /// paths.
    pub fn validate(&self) -> Result<(), MapError> {
        if self.from_sft.is_empty() || self.to_sft.is_empty() {
            return Err(MapError::MissingFormats);
        }
        let mut targets = BTreeSet::new();
        let outputs = self
            .fields
            .values()
            .chain(self.const_outputs.keys())
            .chain(self.defaults.keys());
        for path in outputs {
            if !targets.insert(path.clone()) {
                return Err(MapError::DuplicateTarget { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// One field-level operation recorded in the translation receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Value moved from source path to target path.
    Rename,
    /// Constant written at target path.
    Const,
    /// Source value removed.
    Drop,
    /// `intent` rewritten through the lookup table.
    IntentRemap,
    /// Value carried through untouched.
    Passthrough,
    /// Default written at an absent target path.
    Default,
}

/// Field-level provenance entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FieldProvenance {
    /// Path in the source payload, when the operation reads one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Path in the output payload, when the operation writes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// What happened.
    pub operation: Operation,
    /// Value before the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Value after the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    /// Milliseconds since the epoch, uniform across one translation.
    pub timestamp_ms: i64,
}

/// The audit record of one translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TranslationReceipt {
    /// Map id the translation used.
    pub map_id: String,
    /// Source format.
    pub from_sft: String,
    /// Target format.
    pub to_sft: String,
    /// Ordered field-level provenance.
    pub transformations: Vec<FieldProvenance>,
    /// `preserved / source_fields × 100`, one decimal.
    pub coverage_pct: f64,
    /// Required output paths absent after mapping and defaults.
    pub missing_required: Vec<String>,
    /// Whether the round trip through the reverse map reproduced the
    /// input on non-lossy fields. `None` when no reverse map exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_ok: Option<bool>,
    /// Fraction of compared round-trip fields that matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

/// Failures from translation, keyed to the wire error taxonomy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranslateError {
    /// No map is registered for the requested pair.
    #[error("no map registered for {from} -> {to}")]
    MapNotFound {
        /// Requested source format.
        from: String,
        /// Requested target format.
        to: String,
    },
    /// The input payload does not satisfy the map's expectations.
    #[error("input invalid: {violations:?}")]
    InputInvalid {
        /// Violation details.
        violations: Vec<String>,
    },
    /// The mapped output violates the map's enum constraints.
    #[error("output invalid: {violations:?}")]
    OutputInvalid {
        /// Violation details.
        violations: Vec<String>,
    },
    /// Coverage fell below the enforced gate.
    #[error("coverage {coverage_pct}% is below the {required}% gate")]
    CoverageBelowGate {
        /// Achieved coverage.
        coverage_pct: f64,
        /// Gate threshold.
        required: f64,
    },
}

/// Translation knobs.
#[derive(Debug, Clone, Default)]
pub struct TranslateOptions<'a> {
    /// Minimum coverage percentage; `None` disables the gate.
    pub coverage_gate: Option<f64>,
    /// Reverse map used for the round-trip check.
    pub reverse: Option<&'a SftMap>,
    /// Timestamp stamped on every provenance entry.
    pub timestamp_ms: i64,
}

/// A translated payload plus its receipt.
#[derive(Debug, Clone)]
pub struct Translated {
    /// The mapped payload.
    pub output: Value,
    /// The audit record.
    pub receipt: TranslationReceipt,
}

/// Apply `map` to `payload`.
///
/// Operation order is fixed: rename, const, drop, intent remap, default,
/// enum check. The output and receipt are deterministic for a given
/// `(payload, map, timestamp_ms)`.
///
/// # Errors
///
/// Returns a [`TranslateError`] as described on each variant.
pub fn translate(
    payload: &Value,
    map: &SftMap,
    opts: &TranslateOptions<'_>,
) -> Result<Translated, TranslateError> {
    let Value::Object(_) = payload else {
        return Err(TranslateError::InputInvalid {
            violations: vec!["payload must be a JSON object".to_owned()],
        });
    };

    let source_leaves = paths::leaf_paths(payload);
    let mut output = payload.clone();
    let mut transformations = Vec::new();
    let ts = opts.timestamp_ms;

    // Rename.
    for (from_path, to_path) in &map.fields {
        if let Some(value) = paths::remove(&mut output, from_path) {
            paths::set(&mut output, to_path, value.clone());
            transformations.push(FieldProvenance {
                source_path: Some(from_path.clone()),
                target_path: Some(to_path.clone()),
                operation: Operation::Rename,
                old_value: Some(value.clone()),
                new_value: Some(value),
                timestamp_ms: ts,
            });
        }
    }

    // Constants.
    for (path, value) in &map.const_outputs {
        let old = paths::get(&output, path).cloned();
        paths::set(&mut output, path, value.clone());
        transformations.push(FieldProvenance {
            source_path: None,
            target_path: Some(path.clone()),
            operation: Operation::Const,
            old_value: old,
            new_value: Some(value.clone()),
            timestamp_ms: ts,
        });
    }

    // Drops.
    for path in &map.drop_paths {
        if let Some(old) = paths::remove(&mut output, path) {
            transformations.push(FieldProvenance {
                source_path: Some(path.clone()),
                target_path: None,
                operation: Operation::Drop,
                old_value: Some(old),
                new_value: None,
                timestamp_ms: ts,
            });
        }
    }

    // Intent remap.
    let mut intent_remapped = false;
    if let Some(intent) = paths::get(&output, "intent").and_then(Value::as_str) {
        if let Some(mapped) = map.intents.get(intent) {
            intent_remapped = true;
            let old = Value::String(intent.to_owned());
            paths::set(&mut output, "intent", Value::String(mapped.clone()));
            transformations.push(FieldProvenance {
                source_path: Some("intent".to_owned()),
                target_path: Some("intent".to_owned()),
                operation: Operation::IntentRemap,
                old_value: Some(old),
                new_value: Some(Value::String(mapped.clone())),
                timestamp_ms: ts,
            });
        }
    }

    // Defaults.
    for (path, value) in &map.defaults {
        if paths::get(&output, path).is_none() {
            paths::set(&mut output, path, value.clone());
            transformations.push(FieldProvenance {
                source_path: None,
                target_path: Some(path.clone()),
                operation: Operation::Default,
                old_value: None,
                new_value: Some(value.clone()),
                timestamp_ms: ts,
            });
        }
    }

    // Enum checks.
    let mut enum_violations = Vec::new();
    for (path, permitted) in &map.enum_constraints {
        if let Some(value) = paths::get(&output, path) {
            if !permitted.contains(value) {
                enum_violations.push(format!("{path}: value is not in the permitted set"));
            }
        }
    }
    if !enum_violations.is_empty() {
        return Err(TranslateError::OutputInvalid {
            violations: enum_violations,
        });
    }

    // Coverage: a source leaf is preserved when its mapped location (or
    // original location, if untouched) survives into the output.
    let mut preserved = 0usize;
    for leaf in &source_leaves {
        let target = mapped_path(map, leaf);
        let surviving = target
            .as_deref()
            .is_some_and(|t| paths::get(&output, t).is_some());
        if surviving {
            preserved += 1;
            let untouched = target.as_deref() == Some(leaf.as_str())
                && !map.drop_paths.iter().any(|d| covers(d, leaf));
            if untouched && !touched_by_rename(map, leaf) && !(intent_remapped && leaf == "intent")
            {
                transformations.push(FieldProvenance {
                    source_path: Some(leaf.clone()),
                    target_path: Some(leaf.clone()),
                    operation: Operation::Passthrough,
                    old_value: paths::get(payload, leaf).cloned(),
                    new_value: paths::get(&output, leaf).cloned(),
                    timestamp_ms: ts,
                });
            }
        }
    }
    let coverage_pct = if source_leaves.is_empty() {
        100.0
    } else {
        round1(preserved as f64 / source_leaves.len() as f64 * 100.0)
    };

    let missing_required: Vec<String> = map
        .required
        .iter()
        .filter(|path| paths::get(&output, path).is_none())
        .cloned()
        .collect();

    if let Some(required) = opts.coverage_gate {
        if coverage_pct < required {
            return Err(TranslateError::CoverageBelowGate {
                coverage_pct,
                required,
            });
        }
    }

    // Round trip through the reverse map, comparing non-lossy fields.
    let (round_trip_ok, similarity) = match opts.reverse {
        Some(reverse) => {
            let lossy = &map.lossy;
            match translate_bare(&output, reverse) {
                Ok(back) => {
                    let mut compared = 0usize;
                    let mut matched = 0usize;
                    for leaf in &source_leaves {
                        if lossy.iter().any(|l| covers(l, leaf)) {
                            continue;
                        }
                        compared += 1;
                        if paths::get(&back, leaf) == paths::get(payload, leaf) {
                            matched += 1;
                        }
                    }
                    let sim = if compared == 0 {
                        1.0
                    } else {
                        matched as f64 / compared as f64
                    };
                    (Some((sim - 1.0).abs() < f64::EPSILON), Some(sim))
                }
                Err(_) => (Some(false), Some(0.0)),
            }
        }
        None => (None, None),
    };

    Ok(Translated {
        output,
        receipt: TranslationReceipt {
            map_id: map.map_id(),
            from_sft: map.from_sft.clone(),
            to_sft: map.to_sft.clone(),
            transformations,
            coverage_pct,
            missing_required,
            round_trip_ok,
            similarity,
        },
    })
}

/// Apply a map without receipts or gates (round-trip helper).
fn translate_bare(payload: &Value, map: &SftMap) -> Result<Value, TranslateError> {
    let opts = TranslateOptions::default();
    let mut bare = map.clone();
    bare.enum_constraints.clear();
    translate(payload, &bare, &opts).map(|t| t.output)
}

/// The output path a source leaf lands at, or `None` when it is dropped.
fn mapped_path(map: &SftMap, leaf: &str) -> Option<String> {
    for drop_path in &map.drop_paths {
        if covers(drop_path, leaf) {
            // A rename may still have moved it out before the drop.
            if !touched_by_rename(map, leaf) {
                return None;
            }
        }
    }
    for (from_path, to_path) in &map.fields {
        if leaf == from_path {
            return Some(to_path.clone());
        }
        if let Some(rest) = leaf.strip_prefix(&format!("{from_path}.")) {
            return Some(format!("{to_path}.{rest}"));
        }
    }
    Some(leaf.to_owned())
}

fn touched_by_rename(map: &SftMap, leaf: &str) -> bool {
    map.fields
        .keys()
        .any(|from| leaf == from || leaf.starts_with(&format!("{from}.")))
}

/// Whether `prefix` names `leaf` or one of its ancestors.
fn covers(prefix: &str, leaf: &str) -> bool {
    leaf == prefix || leaf.starts_with(&format!("{prefix}."))
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map_ab() -> SftMap {
        serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "fields": {"x": "y"},
            "defaults": {"z": 0},
        }))
        .unwrap()
    }

    #[test]
    fn rename_and_default() {
        let out = translate(&json!({"x": 1}), &map_ab(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.output, json!({"y": 1, "z": 0}));
        assert_eq!(out.receipt.map_id, "a@v1__b@v1");
        assert_eq!(out.receipt.coverage_pct, 100.0);

        let ops: Vec<Operation> = out
            .receipt
            .transformations
            .iter()
            .map(|t| t.operation)
            .collect();
        assert_eq!(ops, vec![Operation::Rename, Operation::Default]);
    }

    #[test]
    fn default_does_not_overwrite() {
        let out = translate(&json!({"x": 1, "z": 9}), &map_ab(), &TranslateOptions::default())
            .unwrap();
        assert_eq!(out.output, json!({"y": 1, "z": 9}));
    }

    #[test]
    fn const_drop_and_intent_remap() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "const": {"meta.version": "b1"},
            "drop": ["secret"],
            "intents": {"a.create": "b.create"},
        }))
        .unwrap();
        let input = json!({"intent": "a.create", "secret": "shh", "keep": true});
        let out = translate(&input, &map, &TranslateOptions::default()).unwrap();
        assert_eq!(
            out.output,
            json!({"intent": "b.create", "keep": true, "meta": {"version": "b1"}})
        );
        let ops: Vec<Operation> = out
            .receipt
            .transformations
            .iter()
            .map(|t| t.operation)
            .collect();
        assert!(ops.contains(&Operation::Const));
        assert!(ops.contains(&Operation::Drop));
        assert!(ops.contains(&Operation::IntentRemap));
        assert!(ops.contains(&Operation::Passthrough));
    }

    #[test]
    fn coverage_counts_dropped_fields() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "drop": ["b"],
        }))
        .unwrap();
        let out = translate(&json!({"a": 1, "b": 2}), &map, &TranslateOptions::default()).unwrap();
        assert_eq!(out.receipt.coverage_pct, 50.0);
    }

    #[test]
    fn coverage_rounds_to_one_decimal() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "drop": ["c"],
        }))
        .unwrap();
        let out = translate(&json!({"a": 1, "b": 2, "c": 3}), &map, &TranslateOptions::default())
            .unwrap();
        // 2/3 = 66.666… -> 66.7
        assert_eq!(out.receipt.coverage_pct, 66.7);
    }

    #[test]
    fn coverage_gate_blocks() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "drop": ["b"],
        }))
        .unwrap();
        let opts = TranslateOptions {
            coverage_gate: Some(90.0),
            ..TranslateOptions::default()
        };
        let err = translate(&json!({"a": 1, "b": 2}), &map, &opts).unwrap_err();
        assert_eq!(
            err,
            TranslateError::CoverageBelowGate {
                coverage_pct: 50.0,
                required: 90.0
            }
        );
    }

    #[test]
    fn missing_required_is_gathered_not_fatal() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "required": ["must_exist", "z"],
            "defaults": {"z": 0},
        }))
        .unwrap();
        let out = translate(&json!({"a": 1}), &map, &TranslateOptions::default()).unwrap();
        assert_eq!(out.receipt.missing_required, vec!["must_exist"]);
    }

    #[test]
    fn enum_violation_is_output_invalid() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "enum": {"status": ["open", "closed"]},
        }))
        .unwrap();
        let err =
            translate(&json!({"status": "weird"}), &map, &TranslateOptions::default()).unwrap_err();
        assert!(matches!(err, TranslateError::OutputInvalid { .. }));
    }

    #[test]
    fn non_object_payload_is_input_invalid() {
        let err = translate(&json!([1, 2]), &map_ab(), &TranslateOptions::default()).unwrap_err();
        assert!(matches!(err, TranslateError::InputInvalid { .. }));
    }

    #[test]
    fn translation_is_deterministic() {
        let input = json!({"x": 1, "extra": {"nested": true}});
        let opts = TranslateOptions {
            timestamp_ms: 1_700_000_000_000,
            ..TranslateOptions::default()
        };
        let first = translate(&input, &map_ab(), &opts).unwrap();
        for _ in 0..5 {
            let again = translate(&input, &map_ab(), &opts).unwrap();
            assert_eq!(again.output, first.output);
            assert_eq!(again.receipt, first.receipt);
        }
    }

    #[test]
    fn round_trip_with_clean_reverse_map() {
        let forward = map_ab();
        let reverse: SftMap = serde_json::from_value(json!({
            "from_sft": "b@v1",
            "to_sft": "a@v1",
            "fields": {"y": "x"},
            "drop": ["z"],
        }))
        .unwrap();
        let opts = TranslateOptions {
            reverse: Some(&reverse),
            ..TranslateOptions::default()
        };
        let out = translate(&json!({"x": 7}), &forward, &opts).unwrap();
        assert_eq!(out.receipt.round_trip_ok, Some(true));
        assert_eq!(out.receipt.similarity, Some(1.0));
    }

    #[test]
    fn round_trip_flags_lossy_mismatch() {
        // Forward drops `unit`; the reverse map cannot restore it.
        let forward: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "drop": ["unit"],
        }))
        .unwrap();
        let reverse = SftMap::identity("b@v1");
        let opts = TranslateOptions {
            reverse: Some(&reverse),
            ..TranslateOptions::default()
        };
        let out = translate(&json!({"amount": 5, "unit": "ms"}), &forward, &opts).unwrap();
        assert_eq!(out.receipt.round_trip_ok, Some(false));
        assert_eq!(out.receipt.similarity, Some(0.5));
    }

    #[test]
    fn declared_lossy_fields_are_excluded_from_comparison() {
        let forward: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "drop": ["unit"],
            "lossy": ["unit"],
        }))
        .unwrap();
        let reverse = SftMap::identity("b@v1");
        let opts = TranslateOptions {
            reverse: Some(&reverse),
            ..TranslateOptions::default()
        };
        let out = translate(&json!({"amount": 5, "unit": "ms"}), &forward, &opts).unwrap();
        assert_eq!(out.receipt.round_trip_ok, Some(true));
    }

    #[test]
    fn identity_map_is_valid_and_total() {
        let map = SftMap::identity("a@v1");
        map.validate().unwrap();
        let input = json!({"anything": [1, {"goes": true}]});
        let out = translate(&input, &map, &TranslateOptions::default()).unwrap();
        assert_eq!(out.output, input);
        assert_eq!(out.receipt.coverage_pct, 100.0);
    }

    #[test]
    fn duplicate_targets_rejected() {
        let map: SftMap = serde_json::from_value(json!({
            "from_sft": "a@v1",
            "to_sft": "b@v1",
            "fields": {"x": "y"},
            "const": {"y": 1},
        }))
        .unwrap();
        assert_eq!(
            map.validate().unwrap_err(),
            MapError::DuplicateTarget { path: "y".into() }
        );
    }
}
