//! Narration events and the rolling output tail.
//!
//! Everything a supervised run has to say to its observers is a
//! `NarrationEvent`: output lines, the prompt side channel, relay results,
//! warnings, and the terminal status. Events are serializable so the log sink
//! can write them as JSON lines and the event stream can forward them as-is.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::relay::Answer;
use crate::supervisor::RunOutcome;

/// Default rolling tail size.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// How loudly an event should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One unit of observable output from a supervised run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum NarrationEvent {
    /// The child process was spawned.
    Started { pid: u32, command: String },
    /// One line (or trailing fragment) of merged stdout/stderr.
    Output { line: String },
    /// A confirmation prompt was detected and is waiting for an answer.
    PromptDetected { text: String },
    /// An answer was written to the child's stdin.
    AnswerSent { answer: Answer },
    Warning { message: String },
    Error { message: String },
    /// Terminal status. Always the last event of a run.
    Finished { outcome: RunOutcome },
}

impl NarrationEvent {
    pub fn output(line: impl Into<String>) -> Self {
        NarrationEvent::Output { line: line.into() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        NarrationEvent::Warning {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        NarrationEvent::Error {
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            NarrationEvent::Warning { .. } => Severity::Warn,
            NarrationEvent::Error { .. } => Severity::Error,
            NarrationEvent::Finished { outcome } if !outcome.is_success() => Severity::Error,
            _ => Severity::Info,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, NarrationEvent::Finished { .. })
    }

    /// Human-readable one-line rendering, without color.
    pub fn summary(&self) -> String {
        match self {
            NarrationEvent::Started { pid, command } => format!("started {command} (pid {pid})"),
            NarrationEvent::Output { line } => line.clone(),
            NarrationEvent::PromptDetected { text } => format!("waiting for answer: {text}"),
            NarrationEvent::AnswerSent { answer } => format!("answer sent: {answer}"),
            NarrationEvent::Warning { message } | NarrationEvent::Error { message } => {
                message.clone()
            }
            NarrationEvent::Finished { outcome } => outcome.to_string(),
        }
    }
}

/// Bounded rolling buffer of the most recent output lines.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    max_size: usize,
}

impl TailBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Push a line, evicting the oldest if full.
    pub fn push(&mut self, line: &str) {
        if self.max_size == 0 {
            return;
        }
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}
