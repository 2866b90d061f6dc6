//! Content-addressed build cache.
//!
//! Maps a cache key (parent layer, canonical instruction, accumulated
//! environment, RUN isolation) to the layer that instruction produced. Entries live in an
//! in-memory `DashMap` backed by one JSON file per key under `cache_dir`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stratum_core::config::Isolation;
use stratum_core::error::{BuildError, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::build::layer::{sha256_bytes, Layer, LayerId, SCRATCH};
use crate::build::recipe::Instruction;
use crate::fs::{create_dir_all, write_atomic};

/// Deterministic key identifying one unit of reusable build work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(
        parent: Option<&LayerId>,
        instruction: &Instruction,
        env: &BTreeMap<String, String>,
        isolation: Isolation,
    ) -> Self {
        let parent = parent.map(LayerId::as_str).unwrap_or(SCRATCH);
        let mut fingerprint: String = env
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect();
        // Host runs can read the host filesystem; never alias rooted results
        if matches!(instruction, Instruction::Run { .. }) && !isolation.is_rooted() {
            fingerprint.push_str("isolation=host\n");
        }
        CacheKey(sha256_bytes(
            format!("{}\n{}\n{}", parent, instruction.canonical(), fingerprint).as_bytes(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub layer: LayerId,
    pub parent: Option<LayerId>,
    /// Canonical instruction, for inspection
    pub instruction: String,
    /// When this entry was stored (Unix timestamp)
    pub stored_at: i64,
}

type ClaimMap = DashMap<CacheKey, Arc<Mutex<()>>>;

/// Exclusive hold on one cache key, released on drop.
pub struct KeyClaim {
    key: CacheKey,
    claims: Arc<ClaimMap>,
    _guard: OwnedMutexGuard<()>,
}

impl KeyClaim {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for KeyClaim {
    fn drop(&mut self) {
        // One reference in the map, one in our guard; any more are waiters
        self.claims
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

/// Shared layer cache.
///
/// Lookups are lock-free reads. Stores for one key are serialized and the
/// first store wins. [`LayerCache::claim`] lets callers serialize the whole
/// lookup, execute and store sequence for a key across concurrent builds.
pub struct LayerCache {
    /// Directory of `<key>.json` entry files (e.g., ~/.stratum/cache)
    cache_dir: PathBuf,
    index: DashMap<CacheKey, CacheEntry>,
    /// Per-key locks, present only while a claim is held or awaited
    claims: Arc<ClaimMap>,
}

impl LayerCache {
    /// Open the cache at the given directory, loading persisted entries.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        create_dir_all(cache_dir)?;

        let cache = Self {
            cache_dir: cache_dir.to_path_buf(),
            index: DashMap::new(),
            claims: Arc::new(DashMap::new()),
        };

        let read_dir = std::fs::read_dir(cache_dir).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to read cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match read_entry(&path) {
                Some(cached) => {
                    cache.index.insert(cached.key.clone(), cached);
                }
                None => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable cache entry");
                }
            }
        }

        tracing::debug!(
            dir = %cache_dir.display(),
            entries = cache.index.len(),
            "Opened layer cache"
        );
        Ok(cache)
    }

    /// Look up the layer recorded for `key`.
    ///
    /// Falls back to the entry file so that entries written by another
    /// process after open are observed.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<LayerId>> {
        if let Some(entry) = self.index.get(key) {
            return Ok(Some(entry.layer.clone()));
        }

        let path = self.entry_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to read cache entry {}: {}",
                path.display(),
                e
            ))
        })?;
        let entry: CacheEntry = serde_json::from_str(&content)?;
        if &entry.key != key {
            return Err(BuildError::CacheConsistency {
                id: entry.layer.to_string(),
                reason: format!("cache entry {} records key {}", key, entry.key),
            });
        }

        let layer = entry.layer.clone();
        self.index.entry(key.clone()).or_insert(entry);
        Ok(Some(layer))
    }

    /// Record `layer` as the result for `key`.
    ///
    /// The first store for a key is authoritative: storing into an occupied
    /// key is a no-op returning the id already cached.
    pub fn store(&self, key: &CacheKey, layer: &Layer) -> Result<LayerId> {
        match self.index.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let cached = existing.get().layer.clone();
                if cached != layer.id {
                    tracing::debug!(
                        key = %key,
                        cached = %cached.short(),
                        offered = %layer.id.short(),
                        "Cache key already stored, keeping first layer"
                    );
                }
                Ok(cached)
            }
            Entry::Vacant(vacant) => {
                let entry = CacheEntry {
                    key: key.clone(),
                    layer: layer.id.clone(),
                    parent: layer.parent.clone(),
                    instruction: layer.instruction.clone(),
                    stored_at: chrono::Utc::now().timestamp(),
                };
                write_atomic(
                    &self.entry_path(key),
                    serde_json::to_string_pretty(&entry)?.as_bytes(),
                )?;
                tracing::debug!(key = %key, layer = %layer.id.short(), "Stored cache entry");
                let id = entry.layer.clone();
                vacant.insert(entry);
                Ok(id)
            }
        }
    }

    /// Acquire the exclusive claim for `key`, waiting for any current holder.
    pub async fn claim(&self, key: &CacheKey) -> KeyClaim {
        let lock = self
            .claims
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyClaim {
            key: key.clone(),
            claims: self.claims.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Snapshot of all entries, sorted by key.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.index.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key.as_str()))
    }
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let content = std::fs::read_to_string(path).ok()?;
    let entry: CacheEntry = serde_json::from_str(&content).ok()?;
    let stem = path.file_stem()?.to_str()?;
    (entry.key.as_str() == stem).then_some(entry)
}
