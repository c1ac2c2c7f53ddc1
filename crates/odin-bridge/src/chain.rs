// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receipt chain index.
//!
//! Receipts for one trace may be written out of order across workers; the
//! NDJSON index imposes total `(hop_index, ts_ns)` order on read. The
//! index is audit infrastructure only — the primary handlers never depend
//! on it.

use odin_storage::{Storage, StorageError, keys};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One line of the per-trace index ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChainEntry {
    /// Write timestamp, nanoseconds since the epoch.
    pub ts_ns: i64,
    /// Ledger entry kind; always `"hop"` here.
    pub kind: String,
    /// Trace the entry belongs to.
    pub trace_id: String,
    /// Hop position.
    pub hop_index: u32,
    /// Storage key of the receipt.
    pub key: String,
}

/// Append an index entry for a receipt write.
///
/// # Errors
///
/// Returns the [`StorageError`] from the ledger append.
pub async fn append(
    storage: &dyn Storage,
    trace_id: &str,
    hop_index: u32,
    key: &str,
    created_ts: i64,
) -> Result<(), StorageError> {
    let entry = ChainEntry {
        ts_ns: created_ts.saturating_mul(1_000_000_000),
        kind: "hop".into(),
        trace_id: trace_id.to_owned(),
        hop_index,
        key: key.to_owned(),
    };
    let index_key = keys::hop_index(trace_id);
    let line = serde_json::to_vec(&entry).map_err(|e| StorageError::Backend {
        key: index_key.clone(),
        detail: e.to_string(),
    })?;
    storage.append_line(&index_key, &line).await
}

/// Read the chain for `trace_id` in `(hop_index, ts_ns)` order.
///
/// A missing chain is an empty list, not an error. Unparseable lines are
/// skipped so one corrupt write cannot hide the rest of the audit trail.
///
/// # Errors
///
/// Returns the [`StorageError`] from the ledger read.
pub async fn read(storage: &dyn Storage, trace_id: &str) -> Result<Vec<ChainEntry>, StorageError> {
    let Some(bytes) = storage.get_bytes(&keys::hop_index(trace_id)).await? else {
        return Ok(Vec::new());
    };
    let mut entries: Vec<ChainEntry> = bytes
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_slice(line).ok())
        .collect();
    entries.sort_by_key(|e| (e.hop_index, e.ts_ns));
    Ok(entries)
}
