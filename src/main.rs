//! hintsh - run your shell with AI command hints
//!
//! hintsh starts your usual shell inside a pseudo-terminal and relays every
//! keystroke and every byte of output unchanged. Press Tab on a partly typed
//! command and, while the shell's own completion still works as before, a
//! dim one-line hint from a local model appears under the prompt.
//!
//! # Quick Start
//!
//! ```text
//! hintsh                     # $SHELL with hints from Ollama on 127.0.0.1:11434
//! hintsh --shell /bin/zsh    # Pick the shell
//! hintsh --model llama3      # Pick the model
//! hintsh --no-ai             # Plain pass-through
//! ```
//!
//! Settings live in `~/.hintsh/config.toml`, logs in `~/.hintsh/hintsh.log`.
//! The shell sees `HINTSH=1` in its environment.

#![cfg_attr(not(unix), allow(dead_code))]

mod assist;
mod config;
#[cfg(unix)]
mod core;
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use crate::config::Config;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "hintsh")]
#[command(about = "Run your shell with AI command hints on Tab")]
#[command(version)]
struct Cli {
    /// Shell to run (default: config file, then $SHELL, then /bin/sh)
    #[arg(short, long)]
    shell: Option<String>,

    /// Disable suggestions; Tab goes straight to the shell
    #[arg(long)]
    no_ai: bool,

    /// Model name passed to the backend
    #[arg(long)]
    model: Option<String>,

    /// Backend base URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Give up on a suggestion after this many milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Path to the config file (defaults to ~/.hintsh/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `hintsh=trace` (overrides HINTSH_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,

    /// Do not print the start-up banner
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Layer command-line flags over the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(shell) = &self.shell {
            config.shell = Some(shell.clone());
        }
        if self.no_ai {
            config.assist.enabled = false;
        }
        if let Some(model) = &self.model {
            config.assist.model = model.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.assist.endpoint = endpoint.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.assist.timeout_ms = timeout_ms;
        }
    }
}

#[cfg(unix)]
fn main() -> ExitCode {
    use tracing::{error, info};

    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    info!("hintsh {} starting", VERSION);

    match unix::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("hintsh: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    eprintln!("hintsh {} needs a Unix terminal (Linux or macOS).", VERSION);
    ExitCode::FAILURE
}

/// Log to `~/.hintsh/hintsh.log`; the terminal belongs to the shell. If the
/// file cannot be opened there is no logging at all.
#[cfg(unix)]
fn init_logging(level: Option<&str>) {
    use std::fs::OpenOptions;
    use std::sync::Mutex;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let Some(dir) = config::app_dir() else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let Ok(file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("hintsh.log"))
    else {
        return;
    };

    let filter = level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_env("HINTSH_LOG").ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(unix)]
mod unix {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use tracing::{info, warn};

    use super::Cli;
    use crate::assist::{CompletionBackend, DisabledBackend, OllamaBackend, SuggestionClient};
    use crate::config::{BackendKind, Config};
    use crate::core::interceptor::Interceptor;
    use crate::core::session::{Session, SessionOptions, Signals};
    use crate::core::term::{Geometry, TerminalIo};
    use crate::ui::classifier::{parse_control_key, InputClassifier};
    use crate::ui::overlay::Overlay;

    pub(super) fn run(cli: Cli) -> anyhow::Result<()> {
        let mut config = Config::load(cli.config.as_deref());
        cli.apply(&mut config);

        let mut options = SessionOptions::new(config.resolve_shell());
        options.poll_interval = Duration::from_millis(config.session.poll_interval_ms.max(1));
        options.kill_grace = Duration::from_millis(config.session.kill_grace_ms);
        options.max_io_errors = config.session.max_io_errors;
        info!("shell: {}", options.shell.display());

        let io = TerminalIo::stdio().context("Failed to open the terminal")?;
        let signals = Signals::register().context("Failed to install signal handlers")?;

        if !cli.quiet {
            if config.assist_active() {
                println!("hintsh: Tab for AI hints");
            } else {
                println!("hintsh: AI hints off");
            }
        }

        let mut session = Session::start(options, io, build_interceptor(&config), signals)?;
        let status = session.run()?;
        info!("shell finished: {:?}", status);
        Ok(())
    }

    fn build_interceptor(config: &Config) -> Interceptor {
        let explain_key = config.assist.explain_key.as_deref().and_then(|name| {
            let key = parse_control_key(name);
            if key.is_none() {
                warn!("explain key {:?} not usable, explanations are off", name);
            }
            key
        });

        let client = config.assist_active().then(|| {
            let backend: Arc<dyn CompletionBackend> = match config.assist.backend {
                BackendKind::Ollama => Arc::new(OllamaBackend::new(
                    config.assist.endpoint.clone(),
                    config.assist.model.clone(),
                    config.assist.timeout(),
                )),
                BackendKind::None => Arc::new(DisabledBackend),
            };
            info!(
                "suggestions from {:?} model {} at {}",
                config.assist.backend, config.assist.model, config.assist.endpoint
            );
            SuggestionClient::new(backend, config.assist.timeout())
        });

        Interceptor::new(
            InputClassifier::new(explain_key),
            client,
            Overlay::new(config.overlay.prefix.clone(), config.overlay.max_width),
            config.assist.context_lines,
            Geometry::default().cols,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "hintsh",
            "--shell",
            "/bin/zsh",
            "--model",
            "llama3",
            "--timeout-ms",
            "900",
            "--no-ai",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.assist.model, "llama3");
        assert_eq!(config.assist.timeout_ms, 900);
        assert!(!config.assist_active());
    }

    #[test]
    fn no_flags_leave_config_alone() {
        let cli = Cli::parse_from(["hintsh"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config, Config::default());
    }
}
