// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transform receipts: signed records binding `(input_cid, map_id,
//! output_cid)` with a linkage hash over the exact bytes involved.

use crate::SftMap;
use odin_keys::SigningIdentity;
use odin_proof::{ProofEnvelope, SignOptions};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between the three hashed segments.
const LINKAGE_SEP: u8 = 0x1f;

/// The signed subject of a transform receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransformSubject {
    /// CID of the canonical input payload.
    pub input_cid: String,
    /// Map id (`{from}__{to}`).
    pub map_id: String,
    /// CID of the canonical output payload.
    pub output_cid: String,
    /// Source format.
    pub from_sft: String,
    /// Target format.
    pub to_sft: String,
    /// `blake3(input_B || 0x1f || map_B || 0x1f || output_B)`, hex.
    pub linkage_hash: String,
}

/// The persisted transform-receipt file: an envelope signing the subject.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransformReceiptFile {
    /// Envelope over the canonical encoding of `subject`.
    pub envelope: ProofEnvelope,
    /// The attested transform.
    pub subject: TransformSubject,
}

impl TransformReceiptFile {
    /// Recompute the subject's CID and check it against the envelope.
    #[must_use]
    pub fn subject_matches_envelope(&self) -> bool {
        serde_json::to_value(&self.subject)
            .ok()
            .and_then(|v| odin_oml::cid_of(&v).ok())
            .is_some_and(|cid| cid == self.envelope.cid)
    }
}

/// Hash the linkage of input, map, and output bytes.
#[must_use]
pub fn linkage_hash(input: &[u8], map_bytes: &[u8], output: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(input);
    hasher.update(&[LINKAGE_SEP]);
    hasher.update(map_bytes);
    hasher.update(&[LINKAGE_SEP]);
    hasher.update(output);
    hex::encode(hasher.finalize().as_bytes())
}

/// Build and sign the transform receipt for one translation.
///
/// # Errors
///
/// Returns an [`odin_oml::EncodeError`] when any of the three values
/// cannot be canonically encoded.
pub fn build_transform_receipt(
    input: &Value,
    map: &SftMap,
    output: &Value,
    identity: &SigningIdentity,
) -> Result<TransformReceiptFile, odin_oml::EncodeError> {
    let input_bytes = odin_oml::encode(input)?;
    let map_bytes = odin_oml::encode(&serde_json::to_value(map).expect("maps serialize"))?;
    let output_bytes = odin_oml::encode(output)?;

    let subject = TransformSubject {
        input_cid: odin_oml::cid(&input_bytes),
        map_id: map.map_id(),
        output_cid: odin_oml::cid(&output_bytes),
        from_sft: map.from_sft.clone(),
        to_sft: map.to_sft.clone(),
        linkage_hash: linkage_hash(&input_bytes, &map_bytes, &output_bytes),
    };

    let subject_value = serde_json::to_value(&subject).expect("subjects serialize");
    let subject_bytes = odin_oml::encode(&subject_value)?;
    let envelope = odin_proof::sign_bytes(&subject_bytes, identity, &SignOptions::default());
    Ok(TransformReceiptFile { envelope, subject })
}
