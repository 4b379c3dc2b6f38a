//! Asynchronous suggestion requests
//!
//! The event loop never calls the backend itself. Requests go to a single
//! long-lived worker thread and answers come back over a channel that the
//! loop drains between iterations. At most one request is tracked at a time;
//! a newer request supersedes an older one, whose answer is then ignored.
//! The worker skips queued requests that were superseded before it got to
//! them.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::backend::{detect_language, CompletionBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Completion,
    Explanation,
}

/// What a worker sends back: the answer, tagged with the line it was
/// computed against.
#[derive(Debug)]
struct Suggestion {
    id: u64,
    snapshot: String,
    text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Fresh, non-empty answer for the current line.
    Ready(String),
    /// Backend error, empty answer or timeout.
    Failed,
    /// The line changed while the request was in flight.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub id: u64,
    pub kind: RequestKind,
    pub resolved: Resolved,
}

type BackendCall =
    Box<dyn FnOnce(&dyn CompletionBackend) -> super::backend::Result<Option<String>> + Send>;

/// A request queued for the worker.
struct Job {
    id: u64,
    snapshot: String,
    call: BackendCall,
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    kind: RequestKind,
    deadline: Instant,
}

pub struct SuggestionClient {
    backend: Arc<dyn CompletionBackend>,
    timeout: Duration,
    /// Started on the first request; `None` until then or after it died.
    jobs: Option<Sender<Job>>,
    tx: Sender<Suggestion>,
    rx: Receiver<Suggestion>,
    next_id: u64,
    in_flight: Option<InFlight>,
}

impl SuggestionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            backend,
            timeout,
            jobs: None,
            tx,
            rx,
            next_id: 1,
            in_flight: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// When the in-flight request gives up, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Ask for a completion of `line`. Returns the request id.
    pub fn request_completion(&mut self, line: &str, context: String) -> u64 {
        let partial = line.to_string();
        self.dispatch(RequestKind::Completion, line, move |backend| {
            backend.complete(&partial, detect_language(&partial), &context)
        })
    }

    /// Ask for an explanation of `command`'s output. `snapshot` is the shadow
    /// line at request time, used for the freshness check.
    pub fn request_explanation(&mut self, snapshot: &str, command: String, output: String) -> u64 {
        self.dispatch(RequestKind::Explanation, snapshot, move |backend| {
            backend.explain(&command, &output)
        })
    }

    fn dispatch<F>(&mut self, kind: RequestKind, snapshot: &str, call: F) -> u64
    where
        F: FnOnce(&dyn CompletionBackend) -> super::backend::Result<Option<String>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        if let Some(old) = self.in_flight.take() {
            debug!("request {} superseded by {}", old.id, id);
        }
        self.in_flight = Some(InFlight {
            id,
            kind,
            deadline: Instant::now() + self.timeout,
        });

        let job = Job {
            id,
            snapshot: snapshot.to_string(),
            call: Box::new(call),
        };
        if let Err(e) = self.submit(job) {
            warn!("suggestion worker unavailable: {}", e);
            let _ = self.tx.send(Suggestion {
                id,
                snapshot: String::new(),
                text: None,
            });
        }
        id
    }

    /// Hand `job` to the worker, starting it if needed. A worker that has
    /// died is dropped here and restarted by the next request.
    fn submit(&mut self, job: Job) -> io::Result<()> {
        let jobs = match self.jobs.take() {
            Some(jobs) => jobs,
            None => self.spawn_worker()?,
        };
        jobs.send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "suggestion worker exited"))?;
        self.jobs = Some(jobs);
        Ok(())
    }

    fn spawn_worker(&self) -> io::Result<Sender<Job>> {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let backend = Arc::clone(&self.backend);
        let results = self.tx.clone();
        thread::Builder::new()
            .name("hintsh-suggest".into())
            .spawn(move || run_worker(backend.as_ref(), jobs_rx, results))?;
        Ok(jobs_tx)
    }

    fn take_in_flight(&mut self, id: u64) -> Option<InFlight> {
        if self.in_flight.as_ref().is_some_and(|f| f.id == id) {
            self.in_flight.take()
        } else {
            None
        }
    }

    /// Collect the outcome of the in-flight request, if it is settled.
    ///
    /// `current_line` is the shadow line now; an answer computed against a
    /// different line comes back as `Stale`. A request still unanswered at
    /// its deadline comes back as `Failed` and its late answer is dropped.
    pub fn poll(&mut self, current_line: &str, now: Instant) -> Option<Outcome> {
        loop {
            let suggestion = match self.rx.try_recv() {
                Ok(suggestion) => suggestion,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };

            let Some(flight) = self.take_in_flight(suggestion.id) else {
                debug!("dropping late answer for request {}", suggestion.id);
                continue;
            };

            let resolved = match suggestion.text {
                None => Resolved::Failed,
                Some(_) if suggestion.snapshot != current_line => Resolved::Stale,
                Some(text) => Resolved::Ready(text),
            };
            return Some(Outcome {
                id: flight.id,
                kind: flight.kind,
                resolved,
            });
        }

        if !self.in_flight.as_ref().is_some_and(|f| now >= f.deadline) {
            return None;
        }
        let flight = self.in_flight.take()?;
        debug!("request {} timed out", flight.id);
        Some(Outcome {
            id: flight.id,
            kind: flight.kind,
            resolved: Resolved::Failed,
        })
    }
}

/// Answer jobs one at a time, newest first, until either channel closes.
fn run_worker(backend: &dyn CompletionBackend, jobs: Receiver<Job>, results: Sender<Suggestion>) {
    while let Ok(mut job) = jobs.recv() {
        while let Ok(newer) = jobs.try_recv() {
            debug!("skipping superseded request {}", job.id);
            job = newer;
        }

        let text = match (job.call)(backend) {
            Ok(Some(text)) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                debug!("suggestion request {} failed: {}", job.id, e);
                None
            }
        };
        let answer = Suggestion {
            id: job.id,
            snapshot: job.snapshot,
            text,
        };
        // The client is gone once the session has ended
        if results.send(answer).is_err() {
            break;
        }
    }
    debug!("suggestion worker exiting");
}
