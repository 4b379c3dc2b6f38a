//! Keystroke classification
//!
//! Watches the raw bytes the user types and keeps a shadow copy of the line
//! being edited, so a Tab press can be turned into a completion request.
//!
//! The shadow line is a best-effort reconstruction, not a terminal-accurate
//! buffer: printable characters append, an erase key drops the last
//! character and a submit key clears it. Cursor movement, mid-line edits,
//! history recall and shell-side completion are not reflected.
//!
//! Classification never rewrites input. Every byte is forwarded as typed,
//! except the lone Tab of a completion request (held by the caller until the
//! request resolves) and a configured explain key.

use tracing::warn;

pub const TAB: u8 = 0x09;
pub const LF: u8 = 0x0A;
pub const CR: u8 = 0x0D;
pub const ESC: u8 = 0x1B;
pub const BS: u8 = 0x08;
pub const DEL: u8 = 0x7F;

/// Something recognised in the user's keystrokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// Tab on a non-blank line; carries the line at request time.
    CompletionRequested { line: String },
    /// The explain key was pressed.
    ExplainRequested,
    /// Enter; carries the line that was submitted.
    LineSubmitted { line: String },
    /// Backspace or Delete.
    Erase,
    /// A printable character joined the line.
    PrintableAppended(char),
}

/// Result of classifying one read from the user's terminal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classification {
    pub events: Vec<InputEvent>,
    /// Bytes to pass to the shell right away.
    pub forward: Vec<u8>,
}

impl Classification {
    pub fn completion_line(&self) -> Option<&str> {
        self.events.iter().find_map(|event| match event {
            InputEvent::CompletionRequested { line } => Some(line.as_str()),
            _ => None,
        })
    }

    pub fn explain_requested(&self) -> bool {
        self.events.contains(&InputEvent::ExplainRequested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    Ground,
    /// After ESC
    Start,
    /// Inside `ESC [ ...`
    Csi,
    /// After `ESC O`; one more byte ends it
    Ss3,
}

/// Tracks the shadow line across reads.
#[derive(Debug)]
pub struct InputClassifier {
    line: String,
    /// Leading bytes of a UTF-8 character split across reads
    pending: Vec<u8>,
    escape: Escape,
    explain_key: Option<u8>,
}

impl Default for InputClassifier {
    fn default() -> Self {
        Self::new(None)
    }
}

impl InputClassifier {
    pub fn new(explain_key: Option<u8>) -> Self {
        Self {
            line: String::new(),
            pending: Vec::new(),
            escape: Escape::Ground,
            explain_key,
        }
    }

    /// The current shadow line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Classify one read's worth of raw input.
    pub fn consume(&mut self, raw: &[u8]) -> Classification {
        let mut result = Classification::default();

        // Tab and the explain key only count when they arrive on their own;
        // inside a larger read they are pasted text.
        if let [byte] = raw {
            if self.escape == Escape::Ground && self.pending.is_empty() {
                if *byte == TAB && !self.line.trim().is_empty() {
                    result.events.push(InputEvent::CompletionRequested {
                        line: self.line.clone(),
                    });
                    return result;
                }
                if Some(*byte) == self.explain_key {
                    result.events.push(InputEvent::ExplainRequested);
                    return result;
                }
            }
        }

        result.forward.extend_from_slice(raw);
        for &byte in raw {
            if let Some(event) = self.step(byte) {
                result.events.push(event);
            }
        }
        result
    }

    fn step(&mut self, byte: u8) -> Option<InputEvent> {
        match self.escape {
            Escape::Ground => {}
            Escape::Start => {
                self.escape = match byte {
                    b'[' => Escape::Csi,
                    b'O' => Escape::Ss3,
                    ESC => Escape::Start,
                    _ => Escape::Ground,
                };
                return None;
            }
            Escape::Csi => {
                if !(0x20..=0x3F).contains(&byte) {
                    self.escape = Escape::Ground;
                }
                return None;
            }
            Escape::Ss3 => {
                self.escape = Escape::Ground;
                return None;
            }
        }

        if byte >= 0x80 || !self.pending.is_empty() {
            return self.step_utf8(byte);
        }

        match byte {
            ESC => {
                self.escape = Escape::Start;
                None
            }
            CR | LF => Some(InputEvent::LineSubmitted {
                line: std::mem::take(&mut self.line),
            }),
            BS | DEL => {
                self.line.pop();
                Some(InputEvent::Erase)
            }
            0x20..=0x7E => {
                let ch = byte as char;
                self.line.push(ch);
                Some(InputEvent::PrintableAppended(ch))
            }
            _ => None,
        }
    }

    fn step_utf8(&mut self, byte: u8) -> Option<InputEvent> {
        if byte < 0x80 || (byte & 0xC0 == 0xC0 && !self.pending.is_empty()) {
            // A new character interrupted a partial one: drop the partial
            // bytes from the shadow line and classify this byte afresh.
            self.pending.clear();
            return self.step(byte);
        }

        self.pending.push(byte);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let ch = text.chars().next();
                self.pending.clear();
                match ch {
                    Some(ch) if !ch.is_control() => {
                        self.line.push(ch);
                        Some(InputEvent::PrintableAppended(ch))
                    }
                    _ => None,
                }
            }
            Err(e) if e.error_len().is_some() || self.pending.len() >= 4 => {
                // Invalid sequence: forwarded untouched, not classified
                self.pending.clear();
                None
            }
            Err(_) => None,
        }
    }
}

/// Parse a key name such as `ctrl-]` or `ctrl-x` into the control byte the
/// terminal sends for it.
///
/// Keys the shell relies on for line editing (Tab, Enter, Backspace, Esc)
/// cannot be bound.
pub fn parse_control_key(name: &str) -> Option<u8> {
    let lower = name.trim().to_ascii_lowercase();
    let key = lower
        .strip_prefix("ctrl-")
        .or_else(|| lower.strip_prefix("ctrl+"))
        .or_else(|| lower.strip_prefix("c-"))
        .or_else(|| lower.strip_prefix('^'))?;

    let mut chars = key.chars();
    let byte = match (chars.next(), chars.next()) {
        (Some(ch), None) if ch.is_ascii_lowercase() => (ch as u8) - b'a' + 1,
        (Some('@'), None) | (Some('`'), None) => 0x00,
        (Some('\\'), None) => 0x1C,
        (Some(']'), None) => 0x1D,
        (Some('^'), None) | (Some('~'), None) => 0x1E,
        (Some('_'), None) | (Some('?'), None) => 0x1F,
        _ if key == "space" => 0x00,
        _ => return None,
    };

    if matches!(byte, TAB | LF | CR | BS | ESC) {
        warn!("refusing to bind {:?}: the shell needs that key", name);
        return None;
    }
    Some(byte)
}
