//! Base image resolution.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use stratum_core::error::{BuildError, Result};

/// Tag assumed when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Resolves a `BASE_IMAGE` reference to a directory holding its filesystem.
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    /// Return the root directory of the referenced image.
    async fn resolve(&self, reference: &str) -> Result<PathBuf>;
}

/// Serves base images from `<images_dir>/<name>/<tag>/`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    images_dir: PathBuf,
}

impl DirectorySource {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    /// Split `name[:tag]` into its parts. A colon inside the last path
    /// segment separates the tag, so `registry:5000/app` keeps its port.
    fn split_reference(reference: &str) -> (&str, &str) {
        let last_segment = reference.rfind('/').map_or(0, |i| i + 1);
        match reference[last_segment..].rfind(':') {
            Some(i) => {
                let split = last_segment + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        }
    }

    fn image_path(&self, reference: &str) -> Result<PathBuf> {
        let reject = |reason: &str| BuildError::BaseResolution {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name, tag) = Self::split_reference(reference);
        if name.is_empty() || tag.is_empty() {
            return Err(reject("reference must be name[:tag]"));
        }

        let relative = Path::new(name).join(tag);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || tag.contains('/') {
            return Err(reject("reference must not contain absolute or parent paths"));
        }

        Ok(self.images_dir.join(relative))
    }
}

#[async_trait]
impl BaseImageSource for DirectorySource {
    async fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let path = self.image_path(reference)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                tracing::debug!(reference, path = %path.display(), "Resolved base image");
                Ok(path)
            }
            Ok(_) => Err(BuildError::BaseResolution {
                reference: reference.to_string(),
                reason: format!("{} is not a directory", path.display()),
            }),
            Err(e) => Err(BuildError::BaseResolution {
                reference: reference.to_string(),
                reason: format!("image not found at {}: {}", path.display(), e),
            }),
        }
    }
}
