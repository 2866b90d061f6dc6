use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Environment variable that overrides the default state root.
pub const ROOT_ENV_VAR: &str = "STRATUM_ROOT";

/// Config file looked up under the state root when none is given explicitly.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// PATH handed to RUN commands unless overridden.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// State root holding layers, cache entries, and scratch space
    pub root_dir: PathBuf,

    /// Directory of base images (defaults to `<root_dir>/images`)
    pub images_dir: Option<PathBuf>,

    /// Wall-clock limit for a single RUN command
    pub command_timeout_secs: u64,

    /// Shell used to interpret RUN scripts
    pub shell: String,

    /// How RUN commands see the working copy
    pub isolation: Isolation,

    /// PATH exported to RUN commands
    pub path: String,

    /// Bytes of stderr tail kept in execution errors
    pub stderr_excerpt_bytes: usize,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            root_dir: Self::default_root_dir(),
            images_dir: None,
            command_timeout_secs: 600,
            shell: "/bin/sh".to_string(),
            isolation: Isolation::default(),
            path: DEFAULT_PATH.to_string(),
            stderr_excerpt_bytes: 2048,
            log_level: LogLevel::Warn,
        }
    }
}

impl BuilderConfig {
    /// `$STRATUM_ROOT`, falling back to `~/.stratum`.
    pub fn default_root_dir() -> PathBuf {
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR) {
            if !root.is_empty() {
                return PathBuf::from(root);
            }
        }
        dirs::home_dir()
            .map(|h| h.join(".stratum"))
            .unwrap_or_else(|| PathBuf::from(".stratum"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `<root>/config.yaml` is used
    /// when present, otherwise defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let candidate = Self::default_root_dir().join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content).map_err(|e| {
            BuildError::Config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Parse configuration from YAML text. Missing keys take defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Reject values that cannot drive a build.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(BuildError::Config(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(BuildError::Config("shell must not be empty".to_string()));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(BuildError::Config("root_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn images_dir(&self) -> PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("images"))
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.root_dir.join("layers")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join("cache")
    }

    /// Scratch space for RUN working copies.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root_dir.join("tmp")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// How a RUN command is confined to its working copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Run inside `chroot <working copy>`, so every path resolves within the
    /// parent snapshot. Unprivileged users enter a user namespace first
    /// (`unshare --user --map-root-user`).
    #[default]
    Chroot,
    /// Run on the host with the working copy as the current directory.
    /// Absolute paths reach the host filesystem; opt-in only.
    Host,
}

impl Isolation {
    pub fn is_rooted(&self) -> bool {
        matches!(self, Isolation::Chroot)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
