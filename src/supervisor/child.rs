//! Child process plumbing: spawn with merged output, stop with escalation.

use std::io::{self, PipeReader};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::CommandSpec;

const STOP_POLL: Duration = Duration::from_millis(50);

pub(crate) struct Spawned {
    pub child: Child,
    pub stdin: ChildStdin,
    pub output: PipeReader,
}

/// Spawn `spec` with a stdin pipe and stdout+stderr merged into one pipe.
///
/// On unix the child leads its own process group so a stop request reaches
/// everything the script started.
pub(crate) fn spawn(spec: &CommandSpec) -> io::Result<Spawned> {
    let (output, writer) = io::pipe()?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(writer.try_clone()?)
        .stderr(writer);
    if let Some(dir) = &spec.work_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    // `cmd` still owns our copies of the write end; dropping it lets the
    // reader see EOF once the child's side closes.
    drop(cmd);

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin unavailable"))?;

    Ok(Spawned {
        child,
        stdin,
        output,
    })
}

/// Ask the child to stop, wait up to `grace`, then kill it. Always reaps.
pub(crate) fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    send_terminate(child);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            debug!(pid = child.id(), "child stopped after terminate");
            return Ok(status);
        }
        thread::sleep(STOP_POLL);
    }

    debug!(pid = child.id(), "grace period elapsed; killing child");
    send_kill(child)?;
    child.wait()
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if !signal_group(child, libc::SIGTERM) {
        debug!(pid = child.id(), "SIGTERM not delivered");
    }
}

#[cfg(unix)]
fn send_kill(child: &mut Child) -> io::Result<()> {
    if signal_group(child, libc::SIGKILL) {
        return Ok(());
    }
    match child.kill() {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

/// Exit code, or `128 + signal` for a signal death (shell convention).
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
