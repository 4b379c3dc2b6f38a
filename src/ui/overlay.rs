//! Inline suggestion overlay
//!
//! Draws a dim one-line hint on the row below the cursor and takes it away
//! again, restoring the cursor each time so the shell's prompt and the line
//! being typed are left exactly where they were. Overlay bytes only ever go
//! to the user's terminal, never to the shell.

use std::io::{self, Write};

use crossterm::{
    cursor::{MoveDown, MoveToColumn, MoveUp, RestorePosition, SavePosition},
    queue,
    style::{Attribute, Print, SetAttribute},
    terminal::{Clear, ClearType},
};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const ELLIPSIS: char = '\u{2026}';

/// Overlay state for one terminal.
#[derive(Debug)]
pub struct Overlay {
    prefix: String,
    max_width: Option<u16>,
    visible: bool,
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new("\u{1f4a1} ", None)
    }
}

impl Overlay {
    pub fn new(prefix: impl Into<String>, max_width: Option<u16>) -> Self {
        Self {
            prefix: prefix.into(),
            max_width,
            visible: false,
        }
    }

    #[allow(dead_code)]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Show `text` below the cursor line, fitted to `cols` columns.
    pub fn show<W: Write>(&mut self, out: &mut W, text: &str, cols: u16) -> io::Result<()> {
        if self.visible {
            self.clear(out)?;
        }

        let width = self.max_width.map_or(cols, |w| w.min(cols));
        let budget = usize::from(width)
            .saturating_sub(self.prefix.width())
            .saturating_sub(1);
        let line = fit_line(text, budget);

        // The newline scrolls if the cursor sits on the last row, so there
        // is always a row below to draw on; MoveUp returns to the prompt.
        queue!(
            out,
            Print("\n"),
            MoveUp(1),
            SavePosition,
            MoveDown(1),
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            SetAttribute(Attribute::Dim),
            Print(&self.prefix),
            Print(line),
            SetAttribute(Attribute::Reset),
            RestorePosition,
        )?;
        out.flush()?;
        self.visible = true;
        Ok(())
    }

    /// Erase the overlay if one is showing. Returns whether anything was
    /// erased.
    pub fn clear<W: Write>(&mut self, out: &mut W) -> io::Result<bool> {
        if !self.visible {
            return Ok(false);
        }
        self.visible = false;
        queue!(
            out,
            SavePosition,
            MoveDown(1),
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            RestorePosition,
        )?;
        out.flush()?;
        Ok(true)
    }
}

/// First non-empty line of `text`, control characters dropped, cut to at
/// most `budget` display columns (with an ellipsis when cut).
fn fit_line(text: &str, budget: usize) -> String {
    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();

    let clean: String = first.chars().filter(|c| !c.is_control()).collect();
    if clean.width() <= budget {
        return clean;
    }

    let mut out = String::new();
    let mut used = 0;
    let limit = budget.saturating_sub(1);
    for ch in clean.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > limit {
            break;
        }
        used += w;
        out.push(ch);
    }
    if budget > 0 {
        out.push(ELLIPSIS);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn show_saves_and_restores_cursor() {
        let mut overlay = Overlay::new("> ", None);
        let mut out = Vec::new();
        overlay.show(&mut out, "ls -la", 80).unwrap();
        let text = rendered(&out);

        assert!(overlay.is_visible());
        assert!(text.contains("ls -la"));
        assert!(text.contains("\x1b[2m"), "hint should be dim: {text:?}");
        let save = text.find("\x1b7").expect("save cursor");
        let hint = text.find("ls -la").unwrap();
        let restore = text.rfind("\x1b8").expect("restore cursor");
        assert!(save < hint && hint < restore);
        assert!(text.ends_with("\x1b8"));
    }

    #[test]
    fn clear_only_when_visible() {
        let mut overlay = Overlay::default();
        let mut out = Vec::new();
        assert!(!overlay.clear(&mut out).unwrap());
        assert!(out.is_empty());

        overlay.show(&mut out, "git status", 80).unwrap();
        out.clear();
        assert!(overlay.clear(&mut out).unwrap());
        let text = rendered(&out);
        assert!(text.contains("\x1b[2K"));
        assert!(!text.contains("git status"));
        assert!(!overlay.is_visible());
        assert!(!overlay.clear(&mut out).unwrap());
    }

    #[test]
    fn showing_twice_erases_first() {
        let mut overlay = Overlay::new("", None);
        let mut out = Vec::new();
        overlay.show(&mut out, "one", 80).unwrap();
        out.clear();
        overlay.show(&mut out, "two", 80).unwrap();
        let text = rendered(&out);
        let erase = text.find("\x1b[2K").unwrap();
        let two = text.find("two").unwrap();
        assert!(erase < two);
    }

    #[test]
    fn fit_line_takes_first_line() {
        assert_eq!(fit_line("\n  ls -la \nmore", 40), "ls -la");
        assert_eq!(fit_line("", 40), "");
        assert_eq!(fit_line("a\tb", 40), "ab");
    }

    #[test]
    fn fit_line_truncates_by_display_width() {
        assert_eq!(fit_line("abcdefgh", 5), "abcd\u{2026}");
        // Wide characters take two columns each
        assert_eq!(fit_line("\u{65e5}\u{672c}\u{8a9e}", 5), "\u{65e5}\u{672c}\u{2026}");
        assert_eq!(fit_line("abc", 0), "");
    }

    #[test]
    fn max_width_caps_hint() {
        let mut overlay = Overlay::new("", Some(6));
        let mut out = Vec::new();
        overlay.show(&mut out, "docker compose up", 80).unwrap();
        let text = rendered(&out);
        assert!(text.contains("dock\u{2026}"));
        assert!(!text.contains("docker"));
    }
}
