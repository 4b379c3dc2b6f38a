//! Configuration for hintsh.
//!
//! Settings are read from `~/.hintsh/config.toml`. Every field is optional;
//! a missing file gives the defaults and so does a malformed one (with a
//! warning in the log). Command-line flags are applied on top in `main`.
//!
//! # Configuration File
//!
//! ```toml
//! # Shell to run (default: $SHELL, then /bin/sh)
//! shell = "/bin/zsh"
//!
//! [assist]
//! enabled = true
//! backend = "ollama"            # or "none"
//! endpoint = "http://127.0.0.1:11434"
//! model = "codellama:7b"
//! timeout_ms = 2500
//! context_lines = 20
//! explain_key = "ctrl-]"        # unset by default
//!
//! [overlay]
//! prefix = "💡 "
//! max_width = 100
//!
//! [session]
//! poll_interval_ms = 100
//! kill_grace_ms = 500
//! max_io_errors = 3
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::assist::ollama::{DEFAULT_ENDPOINT, DEFAULT_MODEL};

/// Name of the per-user directory under `$HOME`.
const APP_DIR: &str = ".hintsh";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell to run instead of `$SHELL`
    pub shell: Option<String>,
    pub assist: AssistConfig,
    pub overlay: OverlayConfig,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            assist: AssistConfig::default(),
            overlay: OverlayConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Which completion backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    None,
}

/// Suggestion settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AssistConfig {
    pub enabled: bool,
    pub backend: BackendKind,
    pub endpoint: String,
    pub model: String,
    pub timeout_ms: u64,
    /// Output lines sent along as context
    pub context_lines: usize,
    /// Key that asks for an explanation of the last command, e.g. `ctrl-]`
    pub explain_key: Option<String>,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Ollama,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_ms: 2500,
            context_lines: 20,
            explain_key: None,
        }
    }
}

impl AssistConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Overlay settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub prefix: String,
    pub max_width: Option<u16>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            prefix: "\u{1f4a1} ".to_string(),
            max_width: None,
        }
    }
}

/// Event loop settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub max_io_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            kill_grace_ms: 500,
            max_io_errors: 3,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_path_buf).or_else(config_path) else {
            return Self::default();
        };
        match Self::from_file(&path) {
            Ok(Some(config)) => {
                debug!("loaded config from {}", path.display());
                config
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse the file at `path`. `Ok(None)` if it does not exist.
    fn from_file(path: &Path) -> Result<Option<Self>, String> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        toml::from_str(&content).map(Some).map_err(|e| e.to_string())
    }

    /// The shell to run: config, then `$SHELL`, then `/bin/sh`.
    pub fn resolve_shell(&self) -> PathBuf {
        self.shell
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.trim().is_empty()))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/bin/sh"))
    }

    /// Whether suggestions should be requested at all.
    pub fn assist_active(&self) -> bool {
        self.assist.enabled && self.assist.backend != BackendKind::None
    }
}

/// `~/.hintsh`, if a home directory is known.
pub fn app_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_DIR))
}

fn config_path() -> Option<PathBuf> {
    app_dir().map(|dir| dir.join("config.toml"))
}
