//! Execution supervisor: runs one external command at a time and narrates it.
//!
//! Spawns the command with stdin piped and stdout+stderr merged, then drives a
//! read loop on a worker thread that:
//! 1. polls the output reader with a short quantum
//! 2. publishes every line to the run's sinks
//! 3. opens a prompt wait when a confirmation prompt shows up
//! 4. enforces the overall timeout, the prompt timeout and cancellation
//! 5. reports a terminal outcome as the last narration event
//!
//! Answers arrive through `Supervisor::answer` from any thread. Both timers
//! are checked by the same loop; nothing relies on signal-based alarms.

mod child;

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{DEFAULT_TAIL_LINES, NarrationEvent, TailBuffer};
use crate::prompt::PromptPatterns;
use crate::reader::{OutputReader, Poll};
use crate::relay::{Ack, Answer, AnswerRelay, PromptWait, RelayError, RelayNotice};
use crate::sink::Fanout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("another operation is already running (pid {pid})")]
    Busy { pid: u32 },
    #[error("another operation is already starting")]
    Starting,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Which timer ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutCause {
    /// The whole run exceeded its time limit.
    Execution,
    /// A prompt went unanswered past the prompt timeout.
    Prompt,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The child exited on its own.
    Completed { code: i32 },
    TimedOut { cause: TimeoutCause },
    /// Stopped by a cancellation request.
    Terminated,
    Failed { error: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { code: 0 })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Completed { code } => Some(*code),
            _ => None,
        }
    }

    /// Status label used on the event stream.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::TimedOut { .. } => "timed_out",
            RunOutcome::Terminated => "terminated",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed { code } => write!(f, "completed (exit code {code})"),
            RunOutcome::TimedOut {
                cause: TimeoutCause::Execution,
            } => f.write_str("timed out: run exceeded its time limit"),
            RunOutcome::TimedOut {
                cause: TimeoutCause::Prompt,
            } => f.write_str("timed out waiting for an answer"),
            RunOutcome::Terminated => f.write_str("terminated on request"),
            RunOutcome::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Observable supervisor state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Running {
        pid: u32,
        command: String,
        #[serde(skip_serializing)]
        started_at: Instant,
    },
    Finished {
        outcome: RunOutcome,
    },
}

impl SupervisorState {
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorState::Running { .. })
    }
}

/// One command invocation. Always an argument vector, never a shell string.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Variables added to (or overriding) the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub prompt_timeout: Duration,
    /// Answer every detected prompt with this instead of waiting for a caller.
    pub auto_answer: Option<Answer>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            work_dir: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            auto_answer: None,
        }
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn auto_answer(mut self, answer: Option<Answer>) -> Self {
        self.auto_answer = answer;
        self
    }

    /// Shell-like rendering for logs. Never executed.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| quote_for_display(part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_for_display(part: &str) -> String {
    let plain = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

/// Loop tuning shared by every run of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on one output wait; also the timer check granularity.
    pub poll_interval: Duration,
    /// Time between the terminate request and the kill.
    pub grace_period: Duration,
    pub tail_lines: usize,
    pub patterns: PromptPatterns,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            tail_lines: DEFAULT_TAIL_LINES,
            patterns: PromptPatterns::backup(),
        }
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub pid: u32,
    pub elapsed: Duration,
    /// The last `tail_lines` output lines.
    pub tail: Vec<String>,
}

/// Handle to a run in progress.
pub struct RunHandle {
    pid: u32,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block until the run reaches a terminal state.
    pub fn wait(self) -> RunReport {
        let pid = self.pid;
        self.join.join().unwrap_or_else(|_| RunReport {
            outcome: RunOutcome::Failed {
                error: "supervisor worker panicked".to_string(),
            },
            pid,
            elapsed: Duration::ZERO,
            tail: Vec::new(),
        })
    }
}

struct Inner {
    state: SupervisorState,
    /// Set while `start` is spawning outside the lock.
    starting: bool,
    cancel: Option<Arc<AtomicBool>>,
}

struct Shared {
    inner: Mutex<Inner>,
    relay: AnswerRelay,
    config: SupervisorConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, outcome: &RunOutcome) {
        let mut inner = self.lock();
        inner.state = SupervisorState::Finished {
            outcome: outcome.clone(),
        };
        inner.cancel = None;
    }
}

/// Runs at most one managed process at a time. Cloning shares the instance.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SupervisorState::Idle,
                    starting: false,
                    cancel: None,
                }),
                relay: AnswerRelay::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Spawn `spec` and supervise it on a worker thread.
    ///
    /// Fails with `Busy` while another run is active, `Starting` while another
    /// `start` is still spawning, and `Spawn` when the child cannot be
    /// created; in the latter case the supervisor is `Idle`. The lock is not
    /// held while the child is spawned.
    pub fn start(&self, spec: CommandSpec, sinks: Fanout) -> Result<RunHandle, SupervisorError> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.shared.lock();
            if let SupervisorState::Running { pid, .. } = inner.state {
                return Err(SupervisorError::Busy { pid });
            }
            if inner.starting {
                return Err(SupervisorError::Starting);
            }
            inner.starting = true;
            inner.cancel = Some(cancel.clone());
        }

        info!(command = %spec.display(), work_dir = ?spec.work_dir, "spawning");
        let spawned = child::spawn(&spec);

        let mut inner = self.shared.lock();
        inner.starting = false;
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                warn!(program = %spec.program, "spawn failed: {source}");
                inner.state = SupervisorState::Idle;
                inner.cancel = None;
                return Err(SupervisorError::Spawn {
                    program: spec.program.clone(),
                    source,
                });
            }
        };

        let pid = spawned.child.id();
        let started_at = Instant::now();
        inner.state = SupervisorState::Running {
            pid,
            command: spec.display(),
            started_at,
        };
        drop(inner);

        self.shared.relay.attach(spawned.stdin);

        let run = RunLoop {
            tail: TailBuffer::new(self.shared.config.tail_lines),
            reader: OutputReader::new(spawned.output),
            child: spawned.child,
            spec,
            sinks,
            cancel,
            shared: self.shared.clone(),
            started_at,
            pid,
        };
        let shared = self.shared.clone();
        let join = thread::spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| run.run())) {
                Ok(report) => report,
                Err(_) => {
                    let outcome = RunOutcome::Failed {
                        error: "supervisor worker panicked".to_string(),
                    };
                    shared.relay.detach();
                    shared.finish(&outcome);
                    RunReport {
                        outcome,
                        pid,
                        elapsed: started_at.elapsed(),
                        tail: Vec::new(),
                    }
                }
            }
        });

        Ok(RunHandle { pid, join })
    }

    /// Start `spec` and block until it finishes.
    pub fn run(&self, spec: CommandSpec, sinks: Fanout) -> Result<RunReport, SupervisorError> {
        Ok(self.start(spec, sinks)?.wait())
    }

    /// Relay an answer to the outstanding prompt of the current run.
    pub fn answer(&self, answer: Answer) -> Result<Ack, RelayError> {
        self.shared.relay.supply(answer)
    }

    /// The prompt currently waiting for an answer, if any.
    pub fn pending_prompt(&self) -> Option<PromptWait> {
        self.shared.relay.current().filter(|w| !w.is_resolved())
    }

    /// Request termination of the current run. A no-op when nothing runs.
    /// Returns whether a run was signalled.
    pub fn cancel(&self) -> bool {
        let inner = self.shared.lock();
        match (&inner.state, &inner.cancel) {
            (SupervisorState::Running { pid, .. }, Some(flag)) => {
                if !flag.swap(true, Ordering::SeqCst) {
                    info!(pid, "cancellation requested");
                }
                true
            }
            (_, Some(flag)) if inner.starting => {
                if !flag.swap(true, Ordering::SeqCst) {
                    info!("cancellation requested while spawning");
                }
                true
            }
            _ => {
                debug!("cancel requested with nothing running");
                false
            }
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.lock().state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().state.is_running()
    }
}

/// State owned by the worker thread for one run.
struct RunLoop {
    spec: CommandSpec,
    child: Child,
    reader: OutputReader,
    sinks: Fanout,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
    tail: TailBuffer,
    started_at: Instant,
    pid: u32,
}

impl RunLoop {
    fn relay(&self) -> &AnswerRelay {
        &self.shared.relay
    }

    fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    fn run(mut self) -> RunReport {
        self.sinks.publish(&NarrationEvent::Started {
            pid: self.pid,
            command: self.spec.display(),
        });

        let quantum = self.config().poll_interval;
        let mut exited: Option<(ExitStatus, Instant)> = None;

        let outcome = loop {
            match self.reader.poll(quantum) {
                Poll::Lines(lines) => {
                    for line in lines {
                        self.narrate(line, true);
                    }
                }
                Poll::Idle => self.scan_partial(),
                Poll::Pending => {}
                Poll::Closed => thread::sleep(quantum),
            }
            self.flush_relay_notices();

            if self.cancel.load(Ordering::SeqCst) {
                break self.stop(RunOutcome::Terminated);
            }

            if let Some(wait) = self.relay().take_expired(Instant::now()) {
                self.sinks.publish(&NarrationEvent::error(format!(
                    "no answer to \"{}\" within {}s",
                    wait.text,
                    self.spec.prompt_timeout.as_secs()
                )));
                break self.stop(RunOutcome::TimedOut {
                    cause: TimeoutCause::Prompt,
                });
            }

            if self.started_at.elapsed() >= self.spec.timeout {
                self.sinks.publish(&NarrationEvent::error(format!(
                    "run exceeded its time limit of {}s",
                    self.spec.timeout.as_secs()
                )));
                break self.stop(RunOutcome::TimedOut {
                    cause: TimeoutCause::Execution,
                });
            }

            if exited.is_none() {
                match self.child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid = self.pid, ?status, "child exited");
                        exited = Some((status, Instant::now()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let error = format!("failed to poll child: {e}");
                        self.sinks.publish(&NarrationEvent::error(&error));
                        break self.stop(RunOutcome::Failed { error });
                    }
                }
            }

            if let Some((status, at)) = exited {
                // An unanswered prompt keeps the run open until it is answered
                // or expires, even after the child is gone.
                if self.relay().outstanding() {
                    continue;
                }
                if self.reader.is_closed() {
                    break RunOutcome::Completed {
                        code: child::exit_code(status),
                    };
                }
                if at.elapsed() >= self.config().grace_period {
                    self.sinks.publish(&NarrationEvent::warning(
                        "output pipe still open after exit (background process?); stopped reading",
                    ));
                    break RunOutcome::Completed {
                        code: child::exit_code(status),
                    };
                }
            }
        };

        self.finish(outcome)
    }

    fn narrate(&mut self, line: String, detect: bool) {
        self.tail.push(&line);
        let detected = if detect {
            self.config().patterns.detect(&line)
        } else {
            None
        };
        self.sinks.publish(&NarrationEvent::Output { line });

        let Some(prompt) = detected else {
            return;
        };
        let opened = self
            .relay()
            .open_wait(&prompt.line, Instant::now(), self.spec.prompt_timeout);
        if !opened {
            debug!(text = %prompt.line, "prompt repeated while one is outstanding");
            return;
        }

        info!(text = %prompt.line, "prompt detected");
        self.sinks.publish(&NarrationEvent::PromptDetected {
            text: prompt.line.clone(),
        });

        if let Some(answer) = self.spec.auto_answer {
            debug!(%answer, "auto-answering prompt");
            if let Err(e) = self.relay().supply(answer) {
                debug!("auto-answer not relayed: {e}");
            }
            self.flush_relay_notices();
        }
    }

    /// Prompts are usually printed without a trailing newline while the
    /// script blocks on stdin, so an idle partial line is scanned too.
    fn scan_partial(&mut self) {
        let is_prompt = self
            .reader
            .partial()
            .is_some_and(|partial| self.config().patterns.scan(&partial));
        if !is_prompt {
            return;
        }
        if let Some(partial) = self.reader.take_partial() {
            self.narrate(partial, true);
        }
    }

    fn flush_relay_notices(&mut self) {
        for notice in self.relay().take_notices() {
            match notice {
                RelayNotice::Sent(answer) => {
                    info!(%answer, "answer relayed");
                    self.sinks.publish(&NarrationEvent::AnswerSent { answer });
                }
                RelayNotice::Failed(message) => {
                    warn!("{message}");
                    self.sinks.publish(&NarrationEvent::error(message));
                }
            }
        }
    }

    /// Terminate/kill escalation, then drain what the pipe still holds.
    fn stop(&mut self, outcome: RunOutcome) -> RunOutcome {
        warn!(pid = self.pid, %outcome, "stopping child");
        let grace = self.config().grace_period;
        if let Err(e) = child::terminate(&mut self.child, grace) {
            warn!(pid = self.pid, "failed to stop child: {e}");
        }

        let quantum = self.config().poll_interval;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.reader.poll(quantum) {
                Poll::Lines(lines) => {
                    for line in lines {
                        self.narrate(line, false);
                    }
                }
                Poll::Pending => {}
                Poll::Idle | Poll::Closed => break,
            }
        }
        outcome
    }

    fn finish(mut self, outcome: RunOutcome) -> RunReport {
        self.flush_relay_notices();
        self.relay().detach();
        self.shared.finish(&outcome);

        let elapsed = self.started_at.elapsed();
        if outcome.is_success() {
            info!(pid = self.pid, elapsed_ms = elapsed.as_millis() as u64, "run completed");
        } else {
            warn!(pid = self.pid, %outcome, "run did not succeed");
        }
        self.sinks.publish(&NarrationEvent::Finished {
            outcome: outcome.clone(),
        });

        RunReport {
            outcome,
            pid: self.pid,
            elapsed,
            tail: std::mem::take(&mut self.tail).into_lines(),
        }
    }
}
