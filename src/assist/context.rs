//! Recent shell output, kept as plain text for request context.
//!
//! Raw PTY bytes go to the user untouched; this module only keeps a copy of
//! the last few lines with escape sequences removed, for completion context
//! and error explanations. It also follows whether a full-screen program has
//! switched the terminal to the alternate screen.

use std::collections::VecDeque;

/// Longest partial line kept while waiting for a newline.
const MAX_PARTIAL: usize = 4096;

/// DEC private modes that switch to the alternate screen.
const ALT_SCREEN_MODES: [&[u8]; 3] = [b"47", b"1047", b"1049"];

/// Longest `ESC [ ? ... h` sequence worth following.
const MAX_MODE_SEQUENCE: usize = 24;

/// Strip ANSI escape sequences (CSI, OSC, two-byte escapes) and carriage
/// returns, decoding the rest as lossy UTF-8.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            0x1B => {
                i += 1;
                match input.get(i) {
                    Some(b'[') => {
                        i += 1;
                        while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
                            i += 1;
                        }
                        if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
                            i += 1;
                        }
                    }
                    Some(b']') => {
                        i += 1;
                        while i < input.len() {
                            if input[i] == 0x07 {
                                i += 1;
                                break;
                            }
                            if input[i] == 0x1B && input.get(i + 1) == Some(&b'\\') {
                                i += 2;
                                break;
                            }
                            i += 1;
                        }
                    }
                    Some(_) => i += 1,
                    None => {}
                }
            }
            b'\r' | 0x07 => i += 1,
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Tracks `ESC [ ? Pm h` / `ESC [ ? Pm l` for the alternate-screen modes,
/// including sequences split across reads.
#[derive(Debug, Default)]
struct ScreenMode {
    alternate: bool,
    seq: Vec<u8>,
}

impl ScreenMode {
    fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            if self.seq.is_empty() {
                if byte == 0x1B {
                    self.seq.push(byte);
                }
                continue;
            }
            self.seq.push(byte);
            match (self.seq.len(), byte) {
                (2, b'[') | (3, b'?') => {}
                (n, b'0'..=b'9' | b';') if n > 3 && n < MAX_MODE_SEQUENCE => {}
                (n, b'h' | b'l') if n > 3 => {
                    let params = &self.seq[3..n - 1];
                    if params
                        .split(|&b| b == b';')
                        .any(|p| ALT_SCREEN_MODES.contains(&p))
                    {
                        self.alternate = byte == b'h';
                    }
                    self.seq.clear();
                }
                _ => {
                    self.seq.clear();
                    if byte == 0x1B {
                        self.seq.push(byte);
                    }
                }
            }
        }
    }
}

/// Ring buffer of the most recent output lines.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
    partial: Vec<u8>,
    screen: ScreenMode,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            partial: Vec::new(),
            screen: ScreenMode::default(),
        }
    }

    /// Feed raw output bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.screen.feed(data);
        for &byte in data {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                self.push_line(strip_ansi(&raw));
            } else if self.partial.len() < MAX_PARTIAL {
                self.partial.push(byte);
            }
        }
    }

    fn push_line(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// The most recent `n` complete lines joined with newlines.
    pub fn recent(&self, n: usize) -> String {
        let start = self.lines.len().saturating_sub(n);
        self.lines
            .range(start..)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the output last switched to the alternate screen.
    pub fn in_alternate_screen(&self) -> bool {
        self.screen.alternate
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_osc() {
        assert_eq!(strip_ansi(b"\x1b[1;31merror\x1b[0m: nope"), "error: nope");
        assert_eq!(strip_ansi(b"\x1b]0;title\x07prompt$ "), "prompt$ ");
        assert_eq!(strip_ansi(b"\x1b]2;t\x1b\\x"), "x");
        assert_eq!(strip_ansi(b"a\r\x1b7b\x1b8"), "ab");
    }

    #[test]
    fn keeps_last_lines() {
        let mut tail = OutputTail::new(2);
        tail.feed(b"one\r\ntwo\r\nthr");
        assert_eq!(tail.recent(5), "one\ntwo");
        tail.feed(b"ee\r\n");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.recent(5), "two\nthree");
        assert_eq!(tail.recent(1), "three");
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut tail = OutputTail::new(0);
        tail.feed(b"line\n");
        assert!(tail.is_empty());
        assert_eq!(tail.recent(3), "");
    }

    #[test]
    fn follows_alternate_screen() {
        let mut tail = OutputTail::new(4);
        assert!(!tail.in_alternate_screen());

        tail.feed(b"\x1b[?1049h\x1b[H\x1b[2J~\r\n");
        assert!(tail.in_alternate_screen());
        tail.feed(b"\x1b[?25l\x1b[?1l");
        assert!(tail.in_alternate_screen());
        tail.feed(b"\x1b[?1049l$ ");
        assert!(!tail.in_alternate_screen());

        // Split across reads, combined with other modes
        tail.feed(b"\x1b[?10");
        tail.feed(b"47;1h");
        assert!(tail.in_alternate_screen());
        tail.feed(b"\x1b\x1b[?47l");
        assert!(!tail.in_alternate_screen());
    }

    #[test]
    fn other_private_modes_do_not_count() {
        let mut tail = OutputTail::new(4);
        tail.feed(b"\x1b[?2004h\x1b[?1h\x1b[?104h\x1b[1049h");
        assert!(!tail.in_alternate_screen());
    }

    #[test]
    fn escape_split_across_lines_is_stripped_per_line() {
        let mut tail = OutputTail::new(4);
        tail.feed(b"\x1b[32mok\x1b[0m\n");
        assert_eq!(tail.recent(1), "ok");
    }
}
