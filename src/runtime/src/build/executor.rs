//! Instruction executor.
//!
//! Runs one instruction against the state produced by its parent layer.
//! RUN commands execute in a private working copy materialized from the
//! parent chain; the resulting filesystem delta is committed to the
//! [`LayerStore`]. The executor never reads or writes the build cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use stratum_core::config::{BuilderConfig, Isolation, DEFAULT_PATH};
use stratum_core::error::{BuildError, ExecutionFailure, Result};
use tokio::process::Command;

use super::layer::{DirSnapshot, Layer, LayerId};
use super::recipe::Instruction;
use super::source::BaseImageSource;
use crate::cache::LayerStore;
use crate::fs::create_dir_all;

/// Result of executing a single instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A filesystem layer was committed
    Layer(Layer),
    /// An environment variable was set; no filesystem change
    Env { key: String, value: String },
}

/// Execution settings derived from [`BuilderConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub shell: String,
    pub isolation: Isolation,
    /// PATH exported to commands
    pub path: String,
    pub timeout: Duration,
    pub stderr_excerpt_bytes: usize,
    /// Parent directory for per-RUN working copies
    pub tmp_dir: PathBuf,
    /// Forward command stdout to our stderr
    pub echo_output: bool,
}

impl ExecutorConfig {
    pub fn from_config(config: &BuilderConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            isolation: config.isolation,
            path: config.path.clone(),
            timeout: config.command_timeout(),
            stderr_excerpt_bytes: config.stderr_excerpt_bytes,
            tmp_dir: config.tmp_dir(),
            echo_output: false,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            isolation: Isolation::default(),
            path: DEFAULT_PATH.to_string(),
            timeout: Duration::from_secs(600),
            stderr_excerpt_bytes: 2048,
            tmp_dir: std::env::temp_dir(),
            echo_output: false,
        }
    }
}

/// Executes instructions, committing their effects as layers.
pub struct Executor {
    store: Arc<LayerStore>,
    source: Arc<dyn BaseImageSource>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        store: Arc<LayerStore>,
        source: Arc<dyn BaseImageSource>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `instruction` on top of `parent` with the accumulated `env`.
    pub async fn execute(
        &self,
        parent: Option<&LayerId>,
        instruction: &Instruction,
        env: &BTreeMap<String, String>,
    ) -> Result<StepOutcome> {
        match instruction {
            Instruction::Env { key, value } => Ok(StepOutcome::Env {
                key: key.clone(),
                value: value.clone(),
            }),
            Instruction::BaseImage { reference } => {
                let layer = self.import_base(reference, &instruction.canonical()).await?;
                Ok(StepOutcome::Layer(layer))
            }
            Instruction::Run { commands } => {
                let layer = self
                    .run(parent, &instruction.canonical(), commands, env)
                    .await?;
                Ok(StepOutcome::Layer(layer))
            }
        }
    }

    /// Commit the resolved base image tree as a parentless layer.
    async fn import_base(&self, reference: &str, canonical: &str) -> Result<Layer> {
        let root = self.source.resolve(reference).await?;
        let resolution_error = |e: BuildError| BuildError::BaseResolution {
            reference: reference.to_string(),
            reason: e.to_string(),
        };

        let snapshot = DirSnapshot::capture(&root).map_err(resolution_error)?;
        let delta = DirSnapshot::default().diff(&snapshot);
        self.store
            .commit(None, canonical, &root, &delta)
            .map_err(resolution_error)
    }

    async fn run(
        &self,
        parent: Option<&LayerId>,
        canonical: &str,
        commands: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Layer> {
        create_dir_all(&self.config.tmp_dir)?;
        // Removed on drop, including when this future is cancelled
        let workspace = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.config.tmp_dir)
            .map_err(|e| {
                BuildError::Storage(format!(
                    "Failed to create working copy in {}: {}",
                    self.config.tmp_dir.display(),
                    e
                ))
            })?;
        let rootfs = workspace.path().join("rootfs");
        create_dir_all(&rootfs)?;

        if let Some(parent) = parent {
            self.store.materialize(parent, &rootfs)?;
        }
        let before = DirSnapshot::capture(&rootfs)?;

        let script = commands.join("\n");
        tracing::debug!(
            instruction = canonical,
            rootfs = %rootfs.display(),
            isolation = ?self.config.isolation,
            "Running command"
        );

        let child = self.command(&rootfs, &script, env).spawn().map_err(|e| {
            execution_error(canonical, None, ExecutionFailure::Spawn(e.to_string()), "")
        })?;

        // Dropping the child on timeout or cancellation kills it
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(execution_error(
                    canonical,
                    None,
                    ExecutionFailure::Spawn(e.to_string()),
                    "",
                ))
            }
            Err(_) => {
                tracing::warn!(
                    instruction = canonical,
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "Command timed out, killed"
                );
                return Err(execution_error(
                    canonical,
                    None,
                    ExecutionFailure::TimedOut(self.config.timeout),
                    "",
                ));
            }
        };

        if !output.status.success() {
            let excerpt = stderr_excerpt(&output.stderr, self.config.stderr_excerpt_bytes);
            return Err(execution_error(
                canonical,
                output.status.code(),
                ExecutionFailure::NonZeroExit,
                &excerpt,
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if self.config.echo_output && !stdout.is_empty() {
            eprint!("{}", stdout);
        }
        tracing::debug!(
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Command finished"
        );

        let after = DirSnapshot::capture(&rootfs)?;
        let delta = before.diff(&after);
        self.store.commit(parent, canonical, &rootfs, &delta)
    }

    fn command(&self, rootfs: &Path, script: &str, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = match self.config.isolation {
            Isolation::Host => {
                let mut cmd = Command::new(&self.config.shell);
                cmd.current_dir(rootfs);
                cmd
            }
            Isolation::Chroot => {
                let mut cmd = if is_root() {
                    Command::new("chroot")
                } else {
                    // chroot(2) needs CAP_SYS_CHROOT; a user namespace grants it
                    let mut cmd = Command::new("unshare");
                    cmd.arg("--user").arg("--map-root-user").arg("chroot");
                    cmd
                };
                cmd.arg(rootfs).arg(&self.config.shell).current_dir("/");
                cmd
            }
        };
        cmd.arg("-e").arg("-c").arg(script);

        // Set environment
        cmd.env_clear();
        cmd.env("PATH", &self.config.path);
        cmd.env("HOME", "/root");
        cmd.envs(env);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

fn execution_error(
    instruction: &str,
    exit_code: Option<i32>,
    reason: ExecutionFailure,
    stderr_excerpt: &str,
) -> BuildError {
    BuildError::Execution {
        instruction: instruction.to_string(),
        exit_code,
        reason,
        stderr_excerpt: stderr_excerpt.to_string(),
    }
}

/// Trailing `limit` bytes of stderr, cut on a character boundary.
fn stderr_excerpt(stderr: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    if text.len() <= limit {
        return text.to_string();
    }
    let start = (text.len() - limit..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::source::DirectorySource;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<LayerStore>,
        executor: Executor,
        tmp_dir: PathBuf,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        std::fs::create_dir_all(images.join("base/1/etc")).unwrap();
        std::fs::write(images.join("base/1/etc/os-release"), "ID=base\n").unwrap();

        let store = Arc::new(LayerStore::open(&tmp.path().join("layers")).unwrap());
        let tmp_dir = tmp.path().join("tmp");
        let config = ExecutorConfig {
            timeout,
            tmp_dir: tmp_dir.clone(),
            isolation: Isolation::Host,
            ..Default::default()
        };
        let executor =
            Executor::new(store.clone(), Arc::new(DirectorySource::new(images)), config);
        Fixture {
            _tmp: tmp,
            store,
            executor,
            tmp_dir,
        }
    }

    fn run(cmds: &[&str]) -> Instruction {
        Instruction::Run {
            commands: cmds.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn base() -> Instruction {
        Instruction::BaseImage {
            reference: "base:1".to_string(),
        }
    }

    async fn base_layer(f: &Fixture) -> Layer {
        match f.executor.execute(None, &base(), &BTreeMap::new()).await.unwrap() {
            StepOutcome::Layer(layer) => layer,
            other => panic!("expected layer, got {:?}", other),
        }
    }

    fn working_copies(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_env_has_no_filesystem_effect() {
        let f = fixture(Duration::from_secs(10));
        let outcome = f
            .executor
            .execute(
                None,
                &Instruction::Env {
                    key: "X".to_string(),
                    value: "1".to_string(),
                },
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Env {
                key: "X".to_string(),
                value: "1".to_string()
            }
        );
        assert!(f.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_base_image_becomes_root_layer() {
        let f = fixture(Duration::from_secs(10));
        let layer = base_layer(&f).await;
        assert_eq!(layer.parent, None);
        assert_eq!(layer.instruction, "BASE_IMAGE base:1");
        assert!(f.store.verify(&layer.id).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_base_image() {
        let f = fixture(Duration::from_secs(10));
        let instruction = Instruction::BaseImage {
            reference: "missing:0".to_string(),
        };
        let err = f
            .executor
            .execute(None, &instruction, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::BaseResolution { .. }));
    }

    #[tokio::test]
    async fn test_run_captures_delta_and_env() {
        let f = fixture(Duration::from_secs(10));
        let parent = base_layer(&f).await;
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());

        let outcome = f
            .executor
            .execute(
                Some(&parent.id),
                &run(&[
                    "mkdir -p opt",
                    "echo \"$GREETING\" > opt/greeting",
                    "cat etc/os-release > opt/copy",
                ]),
                &env,
            )
            .await
            .unwrap();
        let StepOutcome::Layer(layer) = outcome else {
            panic!("expected layer");
        };
        assert_eq!(layer.parent, Some(parent.id.clone()));

        let out = f.tmp_dir.join("inspect");
        f.store.materialize(&layer.id, &out).unwrap();
        let read = |rel: &str| std::fs::read_to_string(out.join(rel)).unwrap();
        assert_eq!(read("opt/greeting"), "hello\n");
        assert_eq!(read("opt/copy"), "ID=base\n");
        std::fs::remove_dir_all(&out).unwrap();
        assert_eq!(working_copies(&f.tmp_dir), 0);
    }

    #[tokio::test]
    async fn test_run_environment_is_cleared() {
        let f = fixture(Duration::from_secs(10));
        std::env::set_var("STRATUM_EXECUTOR_LEAK", "leaked");
        let outcome = f
            .executor
            .execute(
                None,
                &run(&["echo \"[$STRATUM_EXECUTOR_LEAK][$HOME]\" > env.txt"]),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        let StepOutcome::Layer(layer) = outcome else {
            panic!("expected layer");
        };
        let content =
            std::fs::read_to_string(f.store.layer_dir(&layer.id).join("delta/env.txt")).unwrap();
        assert_eq!(content, "[][/root]\n");
    }

    #[tokio::test]
    async fn test_run_failure_reports_exit_code_and_stderr() {
        let f = fixture(Duration::from_secs(10));
        let parent = base_layer(&f).await;
        let layers_before = f.store.list().unwrap().len();

        let err = f
            .executor
            .execute(
                Some(&parent.id),
                &run(&["echo partial > partial.txt", "echo boom >&2", "exit 3"]),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();
        match err {
            BuildError::Execution {
                exit_code,
                reason,
                stderr_excerpt,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(reason, ExecutionFailure::NonZeroExit);
                assert_eq!(stderr_excerpt, "boom");
            }
            other => panic!("expected execution error, got {:?}", other),
        }
        assert_eq!(f.store.list().unwrap().len(), layers_before);
        assert_eq!(working_copies(&f.tmp_dir), 0);
    }

    #[tokio::test]
    async fn test_errexit_stops_script() {
        let f = fixture(Duration::from_secs(10));
        let err = f
            .executor
            .execute(None, &run(&["false", "echo unreachable > marker"]), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Execution { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let f = fixture(Duration::from_millis(200));
        let err = f
            .executor
            .execute(None, &run(&["sleep 5"]), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Execution {
                reason: ExecutionFailure::TimedOut(_),
                exit_code: None,
                ..
            }
        ));
        assert_eq!(working_copies(&f.tmp_dir), 0);
    }

    #[tokio::test]
    async fn test_run_is_deterministic() {
        let f = fixture(Duration::from_secs(10));
        let parent = base_layer(&f).await;
        let instruction = run(&["echo same > out.txt"]);

        let first = f
            .executor
            .execute(Some(&parent.id), &instruction, &BTreeMap::new())
            .await
            .unwrap();
        let second = f
            .executor
            .execute(Some(&parent.id), &instruction, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_default_isolation_is_rooted() {
        let f = fixture(Duration::from_secs(10));
        let executor = Executor::new(
            f.store.clone(),
            Arc::new(DirectorySource::new(f.tmp_dir.clone())),
            ExecutorConfig::default(),
        );
        assert_eq!(executor.config().isolation, Isolation::Chroot);

        let rootfs = Path::new("/var/tmp/run-x/rootfs");
        let cmd = executor.command(rootfs, "touch /etc/marker", &BTreeMap::new());
        let cmd = cmd.as_std();
        let program = cmd.get_program().to_string_lossy().to_string();
        assert!(program == "chroot" || program == "unshare", "{}", program);

        let args: Vec<_> = cmd.get_args().collect();
        let root_at = args
            .iter()
            .position(|a| *a == rootfs.as_os_str())
            .expect("rootfs is passed to chroot");
        if program == "unshare" {
            assert_eq!(args[root_at - 1], "chroot");
        } else {
            assert_eq!(root_at, 0);
        }
        assert_eq!(args[root_at + 1], "/bin/sh");
        assert_eq!(args.last().copied(), Some(std::ffi::OsStr::new("touch /etc/marker")));
    }

    #[test]
    fn test_host_isolation_runs_in_working_copy() {
        let f = fixture(Duration::from_secs(10));
        let rootfs = Path::new("/var/tmp/run-x/rootfs");
        let cmd = f.executor.command(rootfs, "true", &BTreeMap::new());
        let cmd = cmd.as_std();
        assert_eq!(cmd.get_program(), "/bin/sh");
        assert_eq!(cmd.get_current_dir(), Some(rootfs));
    }

    #[test]
    fn test_stderr_excerpt_keeps_tail() {
        assert_eq!(stderr_excerpt(b"short\n", 100), "short");
        assert_eq!(stderr_excerpt(b"0123456789", 4), "6789");
        // Multi-byte boundary: never split a character
        let text = "ééé".as_bytes();
        assert_eq!(stderr_excerpt(text, 3), "é");
    }
}
