//! Image manifest produced by a successful build.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stratum_core::error::Result;

use super::layer::{sha256_bytes, LayerId};

/// Manifest schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// One history record per recipe instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Canonical instruction text
    pub created_by: String,
    /// Layer produced, absent for ENV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerId>,
}

impl HistoryEntry {
    pub fn empty_layer(&self) -> bool {
        self.layer.is_none()
    }
}

/// Ordered layer chain plus the final environment.
///
/// Carries no timestamps, so rebuilding from a warm cache reproduces it
/// byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    /// Reference named by `BASE_IMAGE`
    pub base: String,
    /// Layer ids, base first
    pub layers: Vec<LayerId>,
    pub env: BTreeMap<String, String>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Serialize)]
struct DigestedManifest<'a> {
    #[serde(flatten)]
    manifest: &'a ImageManifest,
    digest: String,
}

impl ImageManifest {
    /// Topmost layer of the image.
    pub fn top_layer(&self) -> Option<&LayerId> {
        self.layers.last()
    }

    /// SHA-256 of the canonical (compact) JSON encoding.
    pub fn digest(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", sha256_bytes(&canonical)))
    }

    /// Pretty JSON including the `digest` field, as emitted by the CLI.
    pub fn to_json_pretty(&self) -> Result<String> {
        let document = DigestedManifest {
            manifest: self,
            digest: self.digest()?,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }
}
