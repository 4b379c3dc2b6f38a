//! AI assistance.
//!
//! - **backend**: The `complete`/`explain` contract and language detection
//! - **ollama**: HTTP backend for a local Ollama server
//! - **client**: Runs backend calls off the event loop and checks freshness
//! - **context**: Recent shell output, ANSI-stripped, used as request context

pub mod backend;
pub mod client;
pub mod context;
pub mod ollama;

pub use backend::{CompletionBackend, DisabledBackend};
pub use client::{RequestKind, Resolved, SuggestionClient};
pub use context::OutputTail;
pub use ollama::OllamaBackend;
