//! Layered image builds.
//!
//! Provides recipe parsing, filesystem snapshotting, instruction execution,
//! and a build engine that assembles image manifests from cached layers.
//!
//! # Usage
//!
//! ```text
//! stratum build ./Recipe
//! ```
//!
//! # Supported Instructions
//!
//! BASE_IMAGE (alias FROM), RUN (including `<<MARKER` blocks), ENV

pub mod engine;
pub mod executor;
pub mod layer;
pub mod manifest;
pub mod recipe;
pub mod source;

pub use engine::{BuildOptions, BuildPhase, BuildResult, Builder, StepReport};
pub use executor::{Executor, ExecutorConfig, StepOutcome};
pub use layer::{Delta, DirSnapshot, Layer, LayerId};
pub use manifest::{HistoryEntry, ImageManifest};
pub use recipe::{Instruction, Recipe, Step};
pub use source::{BaseImageSource, DirectorySource};
