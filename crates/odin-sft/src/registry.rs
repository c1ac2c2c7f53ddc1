// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hot-reloadable registry of SFT maps.
//!
//! Maps live as `{from}__{to}.json` files under a configured directory.
//! The registry indexes them by declared `(from_sft, to_sft)` — the
//! filename is a convention, the content is authoritative. Reload swaps
//! an immutable snapshot.

use crate::{MapError, SftMap};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors from loading the map directory.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The configured directory could not be read.
    #[error("failed to read maps dir {dir}: {source}")]
    Unreadable {
        /// The directory.
        dir: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// A map file failed to parse.
    #[error("malformed map {file}: {reason}")]
    Malformed {
        /// Offending file.
        file: String,
        /// Parse or validation detail.
        reason: String,
    },
}

type MapIndex = HashMap<(String, String), Arc<SftMap>>;

/// Registry of maps behind an atomically swappable snapshot.
pub struct MapRegistry {
    dir: Option<PathBuf>,
    index: ArcSwap<MapIndex>,
}

impl MapRegistry {
    /// Load every `*.json` map under `dir`.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] when the directory cannot be read or a
    /// file is malformed.
    pub fn load_dir(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        let index = read_dir_index(&dir)?;
        Ok(Self {
            dir: Some(dir),
            index: ArcSwap::from_pointee(index),
        })
    }

    /// An empty registry with no backing directory (identity maps only).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            dir: None,
            index: ArcSwap::from_pointee(MapIndex::new()),
        }
    }

    /// Build a registry from in-memory maps (tests, embedders).
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] when a map fails validation.
    pub fn from_maps(maps: impl IntoIterator<Item = SftMap>) -> Result<Self, RegistryError> {
        let mut index = MapIndex::new();
        for map in maps {
            map.validate().map_err(|e| RegistryError::Malformed {
                file: map.map_id(),
                reason: e.to_string(),
            })?;
            index.insert((map.from_sft.clone(), map.to_sft.clone()), Arc::new(map));
        }
        Ok(Self {
            dir: None,
            index: ArcSwap::from_pointee(index),
        })
    }

    /// Resolve the map for `from -> to`. `from == to` resolves to the
    /// identity map when no explicit map overrides it.
    #[must_use]
    pub fn resolve(&self, from: &str, to: &str) -> Option<Arc<SftMap>> {
        let index = self.index.load();
        if let Some(map) = index.get(&(from.to_owned(), to.to_owned())) {
            return Some(map.clone());
        }
        (from == to).then(|| Arc::new(SftMap::identity(from)))
    }

    /// The reverse map for a pair, when one is registered.
    #[must_use]
    pub fn resolve_reverse(&self, from: &str, to: &str) -> Option<Arc<SftMap>> {
        if from == to {
            return None;
        }
        self.resolve(to, from)
    }

    /// All registered `(from, to)` pairs, sorted.
    #[must_use]
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> =
            self.index.load().keys().cloned().collect();
        out.sort();
        out
    }

    /// Re-read the backing directory and swap the snapshot. Without a
    /// backing directory this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`]; on failure the previous snapshot stays.
    pub fn reload(&self) -> Result<usize, RegistryError> {
        let Some(dir) = &self.dir else {
            return Ok(self.index.load().len());
        };
        let index = read_dir_index(dir)?;
        let count = index.len();
        self.index.store(Arc::new(index));
        Ok(count)
    }
}

fn read_dir_index(dir: &PathBuf) -> Result<MapIndex, RegistryError> {
    let mut index = MapIndex::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "maps dir does not exist; registry is empty");
            return Ok(index);
        }
        Err(source) => {
            return Err(RegistryError::Unreadable {
                dir: dir.display().to_string(),
                source,
            });
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| RegistryError::Unreadable {
            dir: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let file = path.display().to_string();
        let text = std::fs::read_to_string(&path).map_err(|e| RegistryError::Malformed {
            file: file.clone(),
            reason: e.to_string(),
        })?;
        let map: SftMap = serde_json::from_str(&text).map_err(|e| RegistryError::Malformed {
            file: file.clone(),
            reason: e.to_string(),
        })?;
        map.validate().map_err(|e: MapError| RegistryError::Malformed {
            file: file.clone(),
            reason: e.to_string(),
        })?;
        debug!(file = %file, map = %map.map_id(), "loaded sft map");
        index.insert((map.from_sft.clone(), map.to_sft.clone()), Arc::new(map));
    }
    Ok(index)
}
