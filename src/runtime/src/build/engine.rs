//! Build engine for producing layered images from recipes.
//!
//! Drives the recipe one step at a time: computes each step's cache key,
//! reuses a verified cached layer when one exists, and otherwise hands the
//! instruction to the [`Executor`] and records the result in the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use stratum_core::config::BuilderConfig;
use stratum_core::error::{BuildError, Result};

use super::executor::{Executor, ExecutorConfig, StepOutcome};
use super::layer::LayerId;
use super::manifest::{HistoryEntry, ImageManifest, SCHEMA_VERSION};
use super::recipe::{Instruction, Recipe, Step};
use super::source::DirectorySource;
use crate::cache::{CacheKey, LayerCache, LayerStore};

/// Per-run build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Skip cache lookups (results are still stored)
    pub no_cache: bool,
    /// Suppress progress output
    pub quiet: bool,
}

/// Where a build run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Start,
    ResolvingBase,
    /// Executing the step at this 0-based index
    Executing(usize),
    Done,
    Failed,
}

impl BuildPhase {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: BuildPhase) -> bool {
        use BuildPhase::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Start, ResolvingBase) => true,
            (ResolvingBase, Executing(1)) | (ResolvingBase, Done) => true,
            (Executing(i), Executing(j)) => j == i + 1,
            (Executing(_), Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildPhase::Start => write!(f, "start"),
            BuildPhase::ResolvingBase => write!(f, "resolving-base"),
            BuildPhase::Executing(i) => write!(f, "executing({})", i),
            BuildPhase::Done => write!(f, "done"),
            BuildPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one recipe step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// 1-based position in the recipe
    pub step: usize,
    /// Canonical instruction text
    pub instruction: String,
    pub cache_hit: bool,
    /// Layer adopted by this step, absent for ENV
    pub layer: Option<LayerId>,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub manifest: ImageManifest,
    pub steps: Vec<StepReport>,
}

impl BuildResult {
    /// Layer-producing steps served from the cache.
    pub fn cached_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.cache_hit).count()
    }

    /// Layer-producing steps that ran the executor.
    pub fn executed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| !s.cache_hit && s.layer.is_some())
            .count()
    }
}

/// Mutable state accumulated during one build.
struct BuildContext {
    phase: BuildPhase,
    parent: Option<LayerId>,
    env: BTreeMap<String, String>,
    layers: Vec<LayerId>,
    history: Vec<HistoryEntry>,
    steps: Vec<StepReport>,
}

impl BuildContext {
    fn new() -> Self {
        Self {
            phase: BuildPhase::Start,
            parent: None,
            env: BTreeMap::new(),
            layers: Vec::new(),
            history: Vec::new(),
            steps: Vec::new(),
        }
    }

    fn advance(&mut self, next: BuildPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid build phase transition {} -> {}",
            self.phase,
            next
        );
        tracing::debug!(from = %self.phase, to = %next, "Build phase");
        self.phase = next;
    }

    fn adopt_layer(
        &mut self,
        step: usize,
        instruction: &Instruction,
        id: LayerId,
        cache_hit: bool,
    ) {
        let canonical = instruction.canonical();
        self.history.push(HistoryEntry {
            created_by: canonical.clone(),
            layer: Some(id.clone()),
        });
        self.steps.push(StepReport {
            step,
            instruction: canonical,
            cache_hit,
            layer: Some(id.clone()),
        });
        self.layers.push(id.clone());
        self.parent = Some(id);
    }

    fn record_env(&mut self, step: usize, instruction: &Instruction, key: String, value: String) {
        let canonical = instruction.canonical();
        self.history.push(HistoryEntry {
            created_by: canonical.clone(),
            layer: None,
        });
        self.steps.push(StepReport {
            step,
            instruction: canonical,
            cache_hit: false,
            layer: None,
        });
        self.env.insert(key, value);
    }

    fn into_result(self, base: &str) -> BuildResult {
        BuildResult {
            manifest: ImageManifest {
                schema_version: SCHEMA_VERSION,
                base: base.to_string(),
                layers: self.layers,
                env: self.env,
                history: self.history,
            },
            steps: self.steps,
        }
    }
}

/// Builds recipes against a shared layer cache.
///
/// Several builders may share one `Arc<LayerCache>`; concurrent builds that
/// reach the same cache key execute it once.
pub struct Builder {
    cache: Arc<LayerCache>,
    store: Arc<LayerStore>,
    executor: Arc<Executor>,
    options: BuildOptions,
}

impl Builder {
    pub fn new(
        cache: Arc<LayerCache>,
        store: Arc<LayerStore>,
        executor: Arc<Executor>,
        options: BuildOptions,
    ) -> Self {
        Self {
            cache,
            store,
            executor,
            options,
        }
    }

    /// Wire a builder from configuration: layer store, cache, a directory
    /// base image source and an executor, all rooted at `config.root_dir`.
    pub fn from_config(config: &BuilderConfig, options: BuildOptions) -> Result<Self> {
        let store = Arc::new(LayerStore::open(&config.layers_dir())?);
        let cache = Arc::new(LayerCache::open(&config.cache_dir())?);
        let source = Arc::new(DirectorySource::new(config.images_dir()));
        let executor_config = ExecutorConfig {
            echo_output: !options.quiet,
            ..ExecutorConfig::from_config(config)
        };
        let executor = Arc::new(Executor::new(store.clone(), source, executor_config));
        Ok(Self::new(cache, store, executor, options))
    }

    pub fn cache(&self) -> &Arc<LayerCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    /// Parse the recipe at `path` and build it.
    pub async fn build_file(&self, path: &Path) -> Result<BuildResult> {
        let recipe = Recipe::from_file(path)?;
        if !self.options.quiet {
            eprintln!("Building from {}", path.display());
        }
        self.build(&recipe).await
    }

    /// Execute a full build of `recipe`.
    ///
    /// Fails with the first step error, wrapped in [`BuildError::StepFailed`];
    /// no later step is attempted and no manifest is produced.
    pub async fn build(&self, recipe: &Recipe) -> Result<BuildResult> {
        let mut ctx = BuildContext::new();
        let total = recipe.steps.len();

        let isolation = self.executor.config().isolation;
        if !isolation.is_rooted() {
            tracing::warn!(
                ?isolation,
                "RUN commands execute unrooted; absolute paths reach the host filesystem"
            );
        }

        for (idx, step) in recipe.steps.iter().enumerate() {
            ctx.advance(if idx == 0 {
                BuildPhase::ResolvingBase
            } else {
                BuildPhase::Executing(idx)
            });

            if !self.options.quiet {
                eprintln!("Step {}/{} : {}", idx + 1, total, step.instruction);
            }

            if let Err(e) = self.run_step(&mut ctx, idx + 1, step).await {
                ctx.advance(BuildPhase::Failed);
                tracing::warn!(step = idx + 1, line = step.line, error = %e, "Build step failed");
                return Err(BuildError::StepFailed {
                    step: idx + 1,
                    line: step.line,
                    source: Box::new(e),
                });
            }
        }

        ctx.advance(BuildPhase::Done);
        let result = ctx.into_result(recipe.base_reference());

        tracing::info!(
            layers = result.manifest.layers.len(),
            cached = result.cached_steps(),
            executed = result.executed_steps(),
            "Build complete"
        );
        if !self.options.quiet {
            if let Some(top) = result.manifest.top_layer() {
                eprintln!("Successfully built {}", top.short());
            }
        }
        Ok(result)
    }

    async fn run_step(&self, ctx: &mut BuildContext, position: usize, step: &Step) -> Result<()> {
        let instruction = &step.instruction;

        if let Instruction::Env { .. } = instruction {
            let outcome = self
                .executor
                .execute(ctx.parent.as_ref(), instruction, &ctx.env)
                .await?;
            if let StepOutcome::Env { key, value } = outcome {
                ctx.record_env(position, instruction, key, value);
            }
            return Ok(());
        }

        let key = CacheKey::compute(
            ctx.parent.as_ref(),
            instruction,
            &ctx.env,
            self.executor.config().isolation,
        );
        let _claim = self.cache.claim(&key).await;

        if !self.options.no_cache {
            if let Some(id) = self.cache.lookup(&key)? {
                let layer = self.store.verify(&id)?;
                if layer.parent != ctx.parent {
                    return Err(BuildError::CacheConsistency {
                        id: id.to_string(),
                        reason: "cached layer has a different parent".to_string(),
                    });
                }
                tracing::debug!(step = position, key = %key, layer = %id.short(), "Cache hit");
                if !self.options.quiet {
                    eprintln!(" ---> Using cache");
                    eprintln!(" ---> {}", id.short());
                }
                ctx.adopt_layer(position, instruction, id, true);
                return Ok(());
            }
            tracing::debug!(step = position, key = %key, "Cache miss");
        }

        let layer = match self
            .executor
            .execute(ctx.parent.as_ref(), instruction, &ctx.env)
            .await?
        {
            StepOutcome::Layer(layer) => layer,
            StepOutcome::Env { .. } => {
                return Err(BuildError::Storage(format!(
                    "{} produced no layer",
                    instruction.keyword()
                )))
            }
        };

        let id = self.cache.store(&key, &layer)?;
        if !self.options.quiet {
            eprintln!(" ---> {}", id.short());
        }
        ctx.adopt_layer(position, instruction, id, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use BuildPhase::*;
        assert!(Start.can_transition_to(ResolvingBase));
        assert!(ResolvingBase.can_transition_to(Executing(1)));
        assert!(Executing(1).can_transition_to(Executing(2)));
        assert!(Executing(3).can_transition_to(Done));
        assert!(ResolvingBase.can_transition_to(Done));
        assert!(Executing(2).can_transition_to(Failed));

        assert!(!Start.can_transition_to(Executing(1)));
        assert!(!Executing(1).can_transition_to(Executing(3)));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(ResolvingBase));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(BuildPhase::Executing(4).to_string(), "executing(4)");
        assert_eq!(BuildPhase::ResolvingBase.to_string(), "resolving-base");
    }

    #[test]
    fn test_context_tracks_parent_and_env() {
        let mut ctx = BuildContext::new();
        let base = LayerId::compute(None, "BASE_IMAGE base:1", "d");
        let base_instruction = Instruction::BaseImage {
            reference: "base:1".to_string(),
        };
        ctx.adopt_layer(1, &base_instruction, base.clone(), false);
        let env_instruction = Instruction::Env {
            key: "X".to_string(),
            value: "1".to_string(),
        };
        ctx.record_env(2, &env_instruction, "X".to_string(), "1".to_string());
        ctx.record_env(3, &env_instruction, "X".to_string(), "2".to_string());

        assert_eq!(ctx.parent, Some(base.clone()));
        assert_eq!(ctx.env.get("X").map(String::as_str), Some("2"));

        let result = ctx.into_result("base:1");
        assert_eq!(result.manifest.layers, vec![base]);
        assert_eq!(result.manifest.history.len(), 3);
        assert_eq!(result.executed_steps(), 1);
        assert_eq!(result.cached_steps(), 0);
    }
}
