//! User-facing input and output handling.
//!
//! - **classifier**: Keystroke classification and the shadow input line
//! - **overlay**: Dim one-line hints drawn under the prompt

pub mod classifier;
pub mod overlay;
