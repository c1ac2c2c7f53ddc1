// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hop receipts: the per-stage audit record of a forwarded call.

use crate::chain;
use odin_storage::{Storage, StorageError, keys};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which stage of the hop this receipt records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HopStage {
    /// Request arrived at this gateway.
    Ingress,
    /// Request forwarded to a peer.
    Forward,
    /// Reverse translation applied to the peer's response.
    Reverse,
    /// Response returned to the caller.
    Reply,
}

/// Hop outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HopOutcome {
    /// The stage completed.
    Ok,
    /// The stage failed.
    Error {
        /// Stable error kind (see `BridgeError::kind`).
        kind: String,
    },
}

/// One hop receipt.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HopReceipt {
    /// Trace this hop belongs to.
    pub trace_id: String,
    /// Position within the trace, assigned at ingress.
    pub hop_index: u32,
    /// Stage recorded.
    pub stage: HopStage,
    /// Route that handled the request.
    pub route: String,
    /// Tenant the request ran under.
    pub tenant: String,
    /// Kid of the verified inbound envelope, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_kid: Option<String>,
    /// Peer the request was forwarded to, when forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer: Option<String>,
    /// CID of the inbound payload.
    pub input_cid: String,
    /// CID of the outbound payload, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cid: Option<String>,
    /// Stage latency.
    pub latency_ms: u64,
    /// Outcome.
    pub outcome: HopOutcome,
    /// Unix seconds at write time.
    pub created_ts: i64,
}

/// Persist a hop receipt and index it in the trace chain.
///
/// # Errors
///
/// Returns the [`StorageError`] from either write. Callers treat hop
/// receipts as non-critical artifacts: failures are logged and counted
/// but do not fail the request.
pub async fn write_hop_receipt(
    storage: &dyn Storage,
    receipt: &HopReceipt,
) -> Result<(), StorageError> {
    let key = keys::hop(&receipt.trace_id, receipt.hop_index);
    let bytes = serde_json::to_vec_pretty(receipt).map_err(|e| StorageError::Backend {
        key: key.clone(),
        detail: e.to_string(),
    })?;
    storage.put_bytes(&key, &bytes, "application/json").await?;
    chain::append(
        storage,
        &receipt.trace_id,
        receipt.hop_index,
        &key,
        receipt.created_ts,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use odin_storage::MemStore;

    fn sample(hop_index: u32) -> HopReceipt {
        HopReceipt {
            trace_id: "trace-9".into(),
            hop_index,
            stage: HopStage::Forward,
            route: "/v1/bridge/beta".into(),
            tenant: "acme".into(),
            from_kid: Some("agent-1".into()),
            to_peer: Some("https://beta.example".into()),
            input_cid: "cid-in".into(),
            output_cid: Some("cid-out".into()),
            latency_ms: 12,
            outcome: HopOutcome::Ok,
            created_ts: 1_000,
        }
    }

    #[tokio::test]
    async fn receipt_persists_under_padded_key() {
        let store = MemStore::new();
        write_hop_receipt(&store, &sample(3)).await.unwrap();
        let stored = store
            .get_bytes("hops/trace-9/00000003.json")
            .await
            .unwrap()
            .expect("receipt stored");
        let parsed: HopReceipt = serde_json::from_slice(&stored).unwrap();
        assert_eq!(parsed.hop_index, 3);
        assert_eq!(parsed.outcome, HopOutcome::Ok);
    }

    #[tokio::test]
    async fn write_also_indexes_the_chain() {
        let store = MemStore::new();
        write_hop_receipt(&store, &sample(0)).await.unwrap();
        write_hop_receipt(&store, &sample(1)).await.unwrap();
        let entries = chain::read(&store, "trace-9").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn outcome_serializes_with_error_kind() {
        let err = HopOutcome::Error {
            kind: "upstream_5xx".into(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["error"]["kind"], "upstream_5xx");
    }
}
