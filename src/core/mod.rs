//! Core proxy components.
//!
//! - **term**: Raw mode and geometry of the user's terminal
//! - **pty**: Pseudo-terminal pair allocation, resize and I/O
//! - **shell**: Spawning, watching and stopping the shell process
//! - **interceptor**: Assistance layered over the relayed byte stream
//! - **session**: The event loop tying all of the above together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── RawMode (user's terminal, restored on teardown)
//! ├── Pty (master owned here, slave handed to the shell)
//! ├── ShellProcess
//! └── Interceptor
//!     ├── InputClassifier (shadow line)
//!     ├── SuggestionClient (worker threads + channel)
//!     └── Overlay
//! ```

pub mod interceptor;
pub mod pty;
pub mod session;
pub mod shell;
pub mod term;
