// src/core/replay/bookmarks.rs

//! Per-peer replication bookmarks.
//!
//! For each known remote endpoint the peer stores two monotonically
//! non-decreasing journal timestamps: `local` (highest already sent to the
//! peer) and `remote` (highest the peer has acknowledged). They are persisted
//! as `bookmarks.json` alongside the object snapshot.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::core::VigilError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerPositions {
    pub local: f64,
    pub remote: f64,
}

#[derive(Debug, Default)]
pub struct BookmarkStore {
    inner: DashMap<String, PeerPositions>,
}

impl BookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> PeerPositions {
        self.inner
            .get(peer)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    /// Raises `local_log_position[peer]`; lower values are ignored.
    pub fn advance_local(&self, peer: &str, ts: f64) {
        let mut entry = self.inner.entry(peer.to_string()).or_default();
        entry.local = entry.local.max(ts);
    }

    /// Raises `remote_log_position[peer]`; lower values are ignored.
    pub fn advance_remote(&self, peer: &str, ts: f64) {
        let mut entry = self.inner.entry(peer.to_string()).or_default();
        entry.remote = entry.remote.max(ts);
    }

    /// A sorted copy, for persistence and endpoint-state mirroring.
    pub fn snapshot(&self) -> BTreeMap<String, PeerPositions> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Atomically persists the store as `{ endpoint: {local, remote} }`.
    pub fn save(&self, path: &Path) -> Result<(), VigilError> {
        let tmp = path.with_extension("tmp");
        let contents = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(&tmp, contents).map_err(|e| VigilError::StatePersist(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| VigilError::StatePersist(e.to_string()))?;
        Ok(())
    }

    /// Loads persisted positions; merges them monotonically, so loading after
    /// runtime activity can only raise bookmarks.
    pub fn load(&self, path: &Path) -> Result<(), VigilError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No bookmarks at {}; starting fresh.", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let loaded: BTreeMap<String, PeerPositions> = serde_json::from_str(&contents)?;
        for (peer, positions) in loaded {
            self.advance_local(&peer, positions.local);
            self.advance_remote(&peer, positions.remote);
        }
        Ok(())
    }
}
