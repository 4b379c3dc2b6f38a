//! Assistance layered over the byte stream.
//!
//! The interceptor sits between the event loop and the descriptors: it is
//! told what the user typed and what the shell printed, and answers with the
//! bytes that must go to the shell. It owns the shadow line, the held Tab,
//! the overlay and the output tail, and never touches a descriptor itself,
//! so the loop keeps single-writer ownership of the master and the terminal.
//!
//! A completion Tab is held back while its request is in flight. It is
//! dropped only if the suggestion is drawn while the Tab is still held; a
//! failure, a timeout, a stale answer or any further keystroke releases it
//! to the shell in order.
//!
//! Nothing is requested or drawn while a full-screen program has the
//! alternate screen; a Tab there goes straight through.

use std::io::{self, Write};
use std::time::Instant;

use tracing::{debug, warn};

use crate::assist::{OutputTail, RequestKind, Resolved, SuggestionClient};
use crate::ui::classifier::{InputClassifier, InputEvent, TAB};
use crate::ui::overlay::Overlay;

pub struct Interceptor {
    classifier: InputClassifier,
    /// `None` when assistance is switched off.
    client: Option<SuggestionClient>,
    overlay: Overlay,
    tail: OutputTail,
    context_lines: usize,
    /// Request id whose Tab has not been forwarded yet.
    held_tab: Option<u64>,
    last_command: Option<String>,
    cols: u16,
}

impl Interceptor {
    pub fn new(
        classifier: InputClassifier,
        client: Option<SuggestionClient>,
        overlay: Overlay,
        context_lines: usize,
        cols: u16,
    ) -> Self {
        Self {
            classifier,
            client,
            overlay,
            tail: OutputTail::new(context_lines),
            context_lines,
            held_tab: None,
            last_command: None,
            cols,
        }
    }

    pub fn set_cols(&mut self, cols: u16) {
        self.cols = cols;
    }

    /// Whether a suggestion request is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.client.as_ref().is_some_and(SuggestionClient::is_pending)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.client.as_ref().and_then(SuggestionClient::deadline)
    }

    /// Classify one read from the user and return the bytes for the shell.
    pub fn on_input(&mut self, raw: &[u8]) -> Vec<u8> {
        let mut forward = Vec::with_capacity(raw.len() + 1);
        if let Some(id) = self.held_tab.take() {
            debug!("releasing tab held for request {}", id);
            forward.push(TAB);
        }

        let classification = self.classifier.consume(raw);
        forward.extend_from_slice(&classification.forward);

        for event in &classification.events {
            if let InputEvent::LineSubmitted { line } = event {
                if !line.trim().is_empty() {
                    self.last_command = Some(line.clone());
                }
            }
        }

        if let Some(line) = classification.completion_line() {
            match self.client.as_mut() {
                Some(_) if self.tail.in_alternate_screen() => forward.push(TAB),
                Some(client) => {
                    let context = self.tail.recent(self.context_lines);
                    let id = client.request_completion(line, context);
                    debug!("completion request {} for {:?}", id, line);
                    self.held_tab = Some(id);
                }
                None => forward.push(TAB),
            }
        }
        if classification.explain_requested() {
            self.request_explanation();
        }
        forward
    }

    fn request_explanation(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if self.tail.in_alternate_screen() {
            return;
        }
        let Some(command) = self.last_command.clone() else {
            debug!("explain key pressed before any command was run");
            return;
        };
        let output = self.tail.recent(self.context_lines);
        let id = client.request_explanation(self.classifier.line(), command, output);
        debug!("explanation request {}", id);
    }

    /// Write shell output to the user, taking any overlay down first.
    pub fn on_output<W: Write>(&mut self, data: &[u8], out: &mut W) -> io::Result<()> {
        self.overlay.clear(out)?;
        out.write_all(data)?;
        out.flush()?;
        self.tail.feed(data);
        Ok(())
    }

    /// Settle a finished or expired request. Returns bytes for the shell:
    /// a released Tab, or nothing.
    pub fn on_tick<W: Write>(&mut self, now: Instant, out: &mut W) -> Vec<u8> {
        let Some(client) = self.client.as_mut() else {
            return Vec::new();
        };
        let Some(outcome) = client.poll(self.classifier.line(), now) else {
            return Vec::new();
        };

        let held = self.held_tab == Some(outcome.id);
        if held {
            self.held_tab = None;
        }

        match outcome.resolved {
            Resolved::Ready(text) => {
                if outcome.kind == RequestKind::Completion && !held {
                    // Its Tab already reached the shell
                    debug!("request {} answered after its tab was released", outcome.id);
                    return Vec::new();
                }
                if self.tail.in_alternate_screen() {
                    debug!("request {} answered after a full-screen program started", outcome.id);
                    return release(held);
                }
                match self.overlay.show(out, &text, self.cols) {
                    Ok(()) => Vec::new(),
                    Err(e) => {
                        warn!("failed to draw suggestion: {}", e);
                        release(held)
                    }
                }
            }
            resolved @ (Resolved::Failed | Resolved::Stale) => {
                debug!("request {} settled as {:?}", outcome.id, resolved);
                release(held)
            }
        }
    }

    /// Take the overlay down before the terminal is handed back.
    pub fn finish<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.held_tab = None;
        self.overlay.clear(out).map(drop)
    }
}

fn release(held: bool) -> Vec<u8> {
    if held {
        vec![TAB]
    } else {
        Vec::new()
    }
}
