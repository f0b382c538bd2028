#![cfg(unix)]

use std::time::{Duration, Instant};

use saturn_relay::events::NarrationEvent;
use saturn_relay::reader::MAX_LINE_BYTES;
use saturn_relay::relay::{Answer, RelayError};
use saturn_relay::sink::{self, Delivery, Fanout, MemorySink, Sink, SinkError};
use saturn_relay::supervisor::{
    CommandSpec, RunOutcome, Supervisor, SupervisorConfig, SupervisorError, SupervisorState,
    TimeoutCause,
};
use serial_test::serial;

const PROMPT_SCRIPT: &str = r#"printf "a\nb\nBackup? Y/n: ""#;

fn supervisor() -> Supervisor {
    Supervisor::new(SupervisorConfig {
        poll_interval: Duration::from_millis(20),
        grace_period: Duration::from_millis(500),
        ..SupervisorConfig::default()
    })
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

fn process_exists(pid: u32) -> bool {
    // SAFETY: kill(2) with signal 0 sends nothing and only reports whether
    // the pid exists; it has no memory-safety preconditions.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn prompt_count(events: &[NarrationEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, NarrationEvent::PromptDetected { .. }))
        .count()
}

/// Block until the run announces a prompt.
fn wait_for_prompt(receiver: &sink::EventReceiver) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(NarrationEvent::PromptDetected { text }) =
            receiver.recv_timeout(Duration::from_millis(100))
        {
            return text;
        }
    }
    panic!("no prompt detected");
}

struct Failing;

impl Sink for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn publish(&mut self, _event: &NarrationEvent) -> Result<Delivery, SinkError> {
        Err(SinkError::Other("disk full".into()))
    }
}

#[test]
#[serial]
fn unanswered_prompt_times_out() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let spec = sh(PROMPT_SCRIPT)
        .timeout(Duration::from_secs(5))
        .prompt_timeout(Duration::from_secs(2));

    let started = Instant::now();
    let report = supervisor
        .run(spec, Fanout::default().with(memory.clone()))
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        report.outcome,
        RunOutcome::TimedOut {
            cause: TimeoutCause::Prompt
        }
    );
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    let lines = memory.lines();
    assert_eq!(&lines[..2], ["a", "b"]);
    let events = memory.events();
    assert_eq!(prompt_count(&events), 1);
    assert!(events.last().is_some_and(NarrationEvent::is_finished));
    assert!(!process_exists(report.pid));
    assert!(supervisor.pending_prompt().is_none());
}

#[test]
#[serial]
fn answered_prompt_reaches_child() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let (channel, receiver) = sink::channel("test", 256);
    let spec = sh(&format!("{PROMPT_SCRIPT}; read ans; echo \"got $ans\""))
        .timeout(Duration::from_secs(10))
        .prompt_timeout(Duration::from_secs(5));

    let handle = supervisor
        .start(spec, Fanout::default().with(memory.clone()).with(channel))
        .unwrap();

    let text = wait_for_prompt(&receiver);
    assert!(text.contains("Backup?"));
    assert!(supervisor.pending_prompt().is_some());

    std::thread::sleep(Duration::from_millis(500));
    let ack = supervisor.answer(Answer::Yes).unwrap();
    assert_eq!(ack.answer, Answer::Yes);
    assert!(ack.waited >= Duration::from_millis(500));

    assert!(matches!(
        supervisor.answer(Answer::No),
        Err(RelayError::AlreadyAnswered)
    ));

    let report = handle.wait();
    assert_eq!(report.outcome, RunOutcome::Completed { code: 0 });
    assert!(memory.lines().contains(&"got y".to_string()));
    assert!(
        memory
            .events()
            .contains(&NarrationEvent::AnswerSent { answer: Answer::Yes })
    );
    assert_eq!(
        supervisor.state(),
        SupervisorState::Finished {
            outcome: RunOutcome::Completed { code: 0 }
        }
    );
}

#[test]
fn missing_command_is_a_spawn_error() {
    let supervisor = supervisor();
    let err = supervisor
        .start(
            CommandSpec::new("saturn-relay-definitely-missing", Vec::<String>::new()),
            Fanout::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn bad_work_dir_is_a_spawn_error() {
    let supervisor = supervisor();
    let spec = CommandSpec::new("true", Vec::<String>::new()).work_dir("/nonexistent/saturn");
    assert!(matches!(
        supervisor.start(spec, Fanout::default()),
        Err(SupervisorError::Spawn { .. })
    ));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn failing_sink_is_reported_once() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let fanout = Fanout::default().with(Failing).with(memory.clone());

    let report = supervisor
        .run(sh("for i in 1 2 3 4 5; do echo line$i; done"), fanout)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed { code: 0 });

    assert_eq!(
        memory.lines(),
        vec!["line1", "line2", "line3", "line4", "line5"]
    );
    let warnings: Vec<_> = memory
        .events()
        .into_iter()
        .filter(|e| matches!(e, NarrationEvent::Warning { .. }))
        .collect();
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert!(matches!(
        &warnings[0],
        NarrationEvent::Warning { message } if message.contains("failing")
    ));
}

#[test]
fn repeated_prompt_lines_open_one_wait() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let (channel, receiver) = sink::channel("test", 256);
    let spec = sh("printf 'Backup? [Y/n]\\nBackup? [Y/n]\\n'; read ans; echo \"got $ans\"");

    let handle = supervisor
        .start(spec, Fanout::default().with(memory.clone()).with(channel))
        .unwrap();
    wait_for_prompt(&receiver);
    std::thread::sleep(Duration::from_millis(200));
    supervisor.answer(Answer::No).unwrap();

    let report = handle.wait();
    assert_eq!(report.outcome, RunOutcome::Completed { code: 0 });
    assert_eq!(prompt_count(&memory.events()), 1);
    assert!(memory.lines().contains(&"got n".to_string()));
}

#[test]
fn auto_answer_needs_no_caller() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let spec = sh(&format!("{PROMPT_SCRIPT}; read ans; echo \"got $ans\""))
        .auto_answer(Some(Answer::Yes));

    let report = supervisor
        .run(spec, Fanout::default().with(memory.clone()))
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed { code: 0 });
    assert!(memory.lines().contains(&"got y".to_string()));
}

#[test]
fn answer_without_prompt_is_rejected() {
    let supervisor = supervisor();
    let handle = supervisor
        .start(CommandSpec::new("sleep", ["10"]), Fanout::default())
        .unwrap();

    assert!(matches!(
        supervisor.answer(Answer::Yes),
        Err(RelayError::NoPromptOutstanding)
    ));

    assert!(supervisor.cancel());
    handle.wait();
}

#[test]
fn cancel_is_idempotent() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let handle = supervisor
        .start(
            sh("echo started; sleep 30"),
            Fanout::default().with(memory.clone()),
        )
        .unwrap();
    let pid = handle.pid();

    assert!(supervisor.cancel());
    assert!(supervisor.cancel());
    let report = handle.wait();

    assert_eq!(report.outcome, RunOutcome::Terminated);
    assert!(!process_exists(pid));
    assert!(!supervisor.cancel());

    let finished = memory.events().into_iter().filter(|e| e.is_finished()).count();
    assert_eq!(finished, 1);
}

#[test]
fn supervisor_is_reusable_after_a_run() {
    let supervisor = supervisor();
    let first = supervisor
        .run(sh("exit 4"), Fanout::default())
        .unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed { code: 4 });

    let second = supervisor
        .run(CommandSpec::new("true", Vec::<String>::new()), Fanout::default())
        .unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed { code: 0 });
}

#[test]
fn external_signal_reports_shell_style_code() {
    let supervisor = supervisor();
    let report = supervisor
        .run(sh("kill -9 $$"), Fanout::default())
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed { code: 137 });
}

#[test]
fn background_process_holding_output_does_not_hang() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    let started = Instant::now();

    let report = supervisor
        .run(
            sh("sleep 5 & echo done"),
            Fanout::default().with(memory.clone()),
        )
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed { code: 0 });
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(memory.lines().contains(&"done".to_string()));
}

#[test]
fn stderr_is_merged_into_the_stream() {
    let supervisor = supervisor();
    let memory = MemorySink::new();
    supervisor
        .run(
            sh("echo out; echo err 1>&2; echo out2"),
            Fanout::default().with(memory.clone()),
        )
        .unwrap();

    let lines = memory.lines();
    assert_eq!(lines.len(), 3);
    assert!(lines.contains(&"err".to_string()));
}

#[test]
fn tail_keeps_last_lines() {
    let supervisor = Supervisor::new(SupervisorConfig {
        poll_interval: Duration::from_millis(20),
        grace_period: Duration::from_millis(500),
        tail_lines: 3,
        ..SupervisorConfig::default()
    });
    let report = supervisor
        .run(sh("for i in 1 2 3 4 5 6; do echo $i; done"), Fanout::default())
        .unwrap();
    assert_eq!(report.tail, vec!["4", "5", "6"]);
}

#[test]
fn output_without_newlines_is_narrated_in_bounded_pieces() {
    let memory = MemorySink::new();
    let total = 300_000;
    let report = supervisor()
        .run(
            sh(&format!("head -c {total} /dev/zero | tr '\\0' x")),
            Fanout::default().with(memory.clone()),
        )
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed { code: 0 });

    let lines = memory.lines();
    assert!(lines.len() > 1);
    assert!(lines.iter().all(|l| l.len() <= MAX_LINE_BYTES));
    assert_eq!(lines.iter().map(String::len).sum::<usize>(), total);
    assert!(report.tail.iter().all(|l| l.len() <= MAX_LINE_BYTES));
}
