//! Answer relay: hands an operator's y/n answer to a waiting child.
//!
//! The supervisor opens a `PromptWait` when it detects a prompt; any thread
//! (an HTTP handler, the terminal front-end) may then call `supply`. The
//! outstanding-wait check, the stdin write and the resolution all happen under
//! one mutex, so concurrent callers see exactly one winner and the child
//! receives exactly one write per prompt.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only answers a confirmation prompt accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    #[serde(rename = "y")]
    Yes,
    #[serde(rename = "n")]
    No,
}

impl Answer {
    pub fn as_str(self) -> &'static str {
        match self {
            Answer::Yes => "y",
            Answer::No => "n",
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Answer {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "y" => Ok(Answer::Yes),
            "n" => Ok(Answer::No),
            other => Err(RelayError::InvalidAnswer(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no prompt is waiting for an answer")]
    NoPromptOutstanding,
    #[error("the prompt was already answered")]
    AlreadyAnswered,
    #[error("invalid answer {0:?}: expected \"y\" or \"n\"")]
    InvalidAnswer(String),
    #[error("failed to write answer to the child: {0}")]
    Io(#[source] io::Error),
}

/// Successful relay of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub answer: Answer,
    /// Time between detection and the answer.
    pub waited: Duration,
}

/// A detected prompt and its resolution state.
#[derive(Debug, Clone)]
pub struct PromptWait {
    pub text: String,
    pub detected_at: Instant,
    pub expires_at: Instant,
    pub answer: Option<Answer>,
}

impl PromptWait {
    pub fn is_resolved(&self) -> bool {
        self.answer.is_some()
    }
}

/// Something the supervisor loop must narrate on the relay's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotice {
    Sent(Answer),
    Failed(String),
}

#[derive(Default)]
struct RelayState {
    stdin: Option<Box<dyn Write + Send>>,
    wait: Option<PromptWait>,
    notices: Vec<RelayNotice>,
}

/// Shared handle to one managed process's prompt state.
#[derive(Clone, Default)]
pub struct AnswerRelay {
    inner: Arc<Mutex<RelayState>>,
}

impl AnswerRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the relay to a new child's stdin, forgetting any previous run.
    pub fn attach(&self, stdin: impl Write + Send + 'static) {
        let mut state = self.state();
        state.stdin = Some(Box::new(stdin));
        state.wait = None;
        state.notices.clear();
    }

    /// Release stdin and discard an unanswered wait. A resolved wait is kept
    /// so a late duplicate answer still reports `AlreadyAnswered`.
    pub fn detach(&self) {
        let mut state = self.state();
        state.stdin = None;
        if state.wait.as_ref().is_some_and(|w| !w.is_resolved()) {
            state.wait = None;
        }
    }

    /// Open a wait for a freshly detected prompt. Returns false (and leaves the
    /// existing wait alone) when an unanswered wait is already outstanding.
    pub fn open_wait(&self, text: &str, now: Instant, timeout: Duration) -> bool {
        let mut state = self.state();
        if state.wait.as_ref().is_some_and(|w| !w.is_resolved()) {
            return false;
        }
        state.wait = Some(PromptWait {
            text: text.to_string(),
            detected_at: now,
            expires_at: now + timeout,
            answer: None,
        });
        true
    }

    /// Write `answer` to the child if a prompt is waiting for it.
    pub fn supply(&self, answer: Answer) -> Result<Ack, RelayError> {
        let mut state = self.state();
        let RelayState {
            stdin,
            wait,
            notices,
        } = &mut *state;

        let wait = match wait {
            None => return Err(RelayError::NoPromptOutstanding),
            Some(w) if w.is_resolved() => return Err(RelayError::AlreadyAnswered),
            Some(w) => w,
        };
        wait.answer = Some(answer);
        let waited = wait.detected_at.elapsed();

        let written = match stdin.as_mut() {
            Some(pipe) => pipe
                .write_all(format!("{answer}\n").as_bytes())
                .and_then(|()| pipe.flush()),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child stdin is closed",
            )),
        };

        match written {
            Ok(()) => {
                notices.push(RelayNotice::Sent(answer));
                Ok(Ack { answer, waited })
            }
            Err(e) => {
                notices.push(RelayNotice::Failed(format!(
                    "failed to send answer '{answer}': {e}"
                )));
                Err(RelayError::Io(e))
            }
        }
    }

    /// True while a detected prompt has no answer yet.
    pub fn outstanding(&self) -> bool {
        self.state().wait.as_ref().is_some_and(|w| !w.is_resolved())
    }

    /// Remove and return the outstanding wait if it expired by `now`.
    pub fn take_expired(&self, now: Instant) -> Option<PromptWait> {
        let mut state = self.state();
        let expired = state
            .wait
            .as_ref()
            .is_some_and(|w| !w.is_resolved() && now >= w.expires_at);
        if expired { state.wait.take() } else { None }
    }

    /// Drain notices produced by `supply` since the last call.
    pub fn take_notices(&self) -> Vec<RelayNotice> {
        std::mem::take(&mut self.state().notices)
    }

    /// Snapshot of the current wait, resolved or not.
    pub fn current(&self) -> Option<PromptWait> {
        self.state().wait.clone()
    }
}
