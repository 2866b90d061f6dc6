//! Content-addressed arena of immutable layer deltas.
//!
//! Each layer lives under `layers_dir/<id>/` with its delta tree in `delta/`
//! and metadata in `layer.json`. Commits stage into a hidden sibling
//! directory and rename into place, so a layer is either fully visible or
//! absent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};

use crate::build::layer::{Delta, DirSnapshot, Layer, LayerId};
use crate::fs::{copy_paths, create_dir_all, merge_tree, remove_path};

const DELTA_DIR: &str = "delta";
const LAYER_META: &str = "layer.json";
const STAGING_PREFIX: &str = ".staging-";

/// On-disk store of committed layers.
#[derive(Debug)]
pub struct LayerStore {
    /// Root directory for layers (e.g., ~/.stratum/layers)
    layers_dir: PathBuf,
}

impl LayerStore {
    /// Open (creating if needed) a layer store at the given directory.
    pub fn open(layers_dir: &Path) -> Result<Self> {
        create_dir_all(layers_dir)?;
        Ok(Self {
            layers_dir: layers_dir.to_path_buf(),
        })
    }

    pub fn layers_dir(&self) -> &Path {
        &self.layers_dir
    }

    /// Directory holding a layer's delta and metadata.
    pub fn layer_dir(&self, id: &LayerId) -> PathBuf {
        self.layers_dir.join(id.as_str())
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.layer_dir(id).join(LAYER_META).is_file()
    }

    /// Commit the entries named by `delta` (relative to `source_root`) as a
    /// new layer on top of `parent`.
    ///
    /// Committing content that already exists under the same id returns the
    /// stored layer unchanged.
    pub fn commit(
        &self,
        parent: Option<&LayerId>,
        instruction: &str,
        source_root: &Path,
        delta: &Delta,
    ) -> Result<Layer> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.layers_dir)
            .map_err(|e| {
                BuildError::Storage(format!(
                    "Failed to create staging directory in {}: {}",
                    self.layers_dir.display(),
                    e
                ))
            })?;

        let delta_dir = staging.path().join(DELTA_DIR);
        create_dir_all(&delta_dir)?;
        copy_paths(source_root, &delta_dir, &delta.changed)?;

        let snapshot = DirSnapshot::capture(&delta_dir)?;
        let digest = snapshot.output_digest(&delta.removed);
        let id = LayerId::compute(parent, instruction, &digest);

        if self.contains(&id) {
            tracing::debug!(layer = %id.short(), "Layer already committed, reusing");
            return self.load(&id);
        }

        let layer = Layer {
            id: id.clone(),
            parent: parent.cloned(),
            instruction: instruction.to_string(),
            digest,
            removed: delta.removed.clone(),
            size_bytes: snapshot.total_size(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let meta_path = staging.path().join(LAYER_META);
        std::fs::write(&meta_path, serde_json::to_string_pretty(&layer)?).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to write layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;

        let target = self.layer_dir(&id);
        if let Err(e) = std::fs::rename(staging.path(), &target) {
            // Lost a race against an identical commit
            if self.contains(&id) {
                return self.load(&id);
            }
            return Err(BuildError::Storage(format!(
                "Failed to commit layer {}: {}",
                target.display(),
                e
            )));
        }

        tracing::info!(
            layer = %id.short(),
            parent = parent.map(LayerId::short).unwrap_or("scratch"),
            changed = delta.changed.len(),
            removed = delta.removed.len(),
            size_bytes = layer.size_bytes,
            "Committed layer"
        );

        Ok(layer)
    }

    /// Read a layer's metadata.
    pub fn load(&self, id: &LayerId) -> Result<Layer> {
        let meta_path = self.layer_dir(id).join(LAYER_META);
        let content = std::fs::read_to_string(&meta_path).map_err(|e| {
            BuildError::CacheConsistency {
                id: id.to_string(),
                reason: format!("cannot read layer metadata {}: {}", meta_path.display(), e),
            }
        })?;
        let layer: Layer =
            serde_json::from_str(&content).map_err(|e| BuildError::CacheConsistency {
                id: id.to_string(),
                reason: format!("invalid layer metadata: {}", e),
            })?;
        if &layer.id != id {
            return Err(BuildError::CacheConsistency {
                id: id.to_string(),
                reason: format!("metadata names a different layer {}", layer.id),
            });
        }
        Ok(layer)
    }

    /// Recompute a layer's digest and id from its stored delta.
    pub fn verify(&self, id: &LayerId) -> Result<Layer> {
        let layer = self.load(id)?;
        let delta_dir = self.layer_dir(id).join(DELTA_DIR);
        let snapshot = DirSnapshot::capture(&delta_dir).map_err(|e| {
            BuildError::CacheConsistency {
                id: id.to_string(),
                reason: format!("cannot read layer delta: {}", e),
            }
        })?;

        let digest = snapshot.output_digest(&layer.removed);
        if digest != layer.digest {
            return Err(BuildError::CacheConsistency {
                id: id.to_string(),
                reason: format!(
                    "delta digest mismatch (recorded {}, found {})",
                    layer.digest, digest
                ),
            });
        }
        if LayerId::compute(layer.parent.as_ref(), &layer.instruction, &digest) != *id {
            return Err(BuildError::CacheConsistency {
                id: id.to_string(),
                reason: "layer id does not match its recorded inputs".to_string(),
            });
        }

        Ok(layer)
    }

    /// The layer and its ancestors, root first.
    pub fn chain(&self, id: &LayerId) -> Result<Vec<Layer>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(id.clone());

        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                return Err(BuildError::CacheConsistency {
                    id: id.to_string(),
                    reason: format!("parent cycle through layer {}", current),
                });
            }
            let layer = self.load(&current)?;
            next = layer.parent.clone();
            chain.push(layer);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Build the full filesystem view of `id` into `dest`.
    pub fn materialize(&self, id: &LayerId, dest: &Path) -> Result<()> {
        create_dir_all(dest)?;
        for layer in self.chain(id)? {
            for removed in &layer.removed {
                remove_path(&dest.join(removed))?;
            }
            merge_tree(&self.layer_dir(&layer.id).join(DELTA_DIR), dest)?;
        }
        tracing::debug!(layer = %id.short(), dest = %dest.display(), "Materialized layer chain");
        Ok(())
    }

    /// All committed layer ids, sorted.
    pub fn list(&self) -> Result<Vec<LayerId>> {
        let mut ids = Vec::new();
        let read_dir = std::fs::read_dir(&self.layers_dir).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to read layer store {}: {}",
                self.layers_dir.display(),
                e
            ))
        })?;
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) || !entry.path().join(LAYER_META).is_file() {
                continue;
            }
            match self.load_by_name(&name) {
                Some(id) => ids.push(id),
                None => tracing::warn!(entry = %name, "Skipping unreadable layer directory"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_by_name(&self, name: &str) -> Option<LayerId> {
        let content = std::fs::read_to_string(self.layers_dir.join(name).join(LAYER_META)).ok()?;
        let layer: Layer = serde_json::from_str(&content).ok()?;
        (layer.id.as_str() == name).then_some(layer.id)
    }
}
