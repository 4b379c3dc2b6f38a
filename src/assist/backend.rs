//! The completion backend contract.
//!
//! A backend is a black box: the proxy hands it text and gets text back, or
//! nothing. Calls are blocking and may take arbitrarily long; they only ever
//! run on worker threads.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend request failed: {0}")]
    Transport(String),

    #[error("Backend returned HTTP {0}")]
    Status(u16),

    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

pub trait CompletionBackend: Send + Sync {
    /// Complete a partially typed command line.
    fn complete(&self, partial: &str, language: &str, context: &str) -> Result<Option<String>>;

    /// Explain why `command` produced `output`.
    fn explain(&self, command: &str, output: &str) -> Result<Option<String>>;
}

/// Backend used when assistance is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackend;

impl CompletionBackend for DisabledBackend {
    fn complete(&self, _partial: &str, _language: &str, _context: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn explain(&self, _command: &str, _output: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Guess the language a command line is written for.
pub fn detect_language(line: &str) -> &'static str {
    let words = line
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '|' | '&' | '(' | ')'))
        .filter(|w| !w.is_empty());

    for word in words {
        let name = word.rsplit('/').next().unwrap_or(word);
        match name {
            "python" | "python3" | "pip" | "pip3" => return "python",
            "node" | "npm" | "npx" | "yarn" => return "javascript",
            _ => {}
        }
    }
    "bash"
}
