//! Stratum Runtime - layered image build engine.
//!
//! This crate parses recipes, executes their instructions against private
//! working copies, and stores the resulting layers in a content-addressed
//! store fronted by a shared build cache.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub(crate) mod fs;

// Re-export common types
pub use build::{
    BaseImageSource, BuildOptions, BuildResult, Builder, DirectorySource, Executor,
    ExecutorConfig, ImageManifest, Instruction, Layer, LayerId, Recipe, StepOutcome, StepReport,
};
pub use cache::{CacheKey, LayerCache, LayerStore};

/// Stratum Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
