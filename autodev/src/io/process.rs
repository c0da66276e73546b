//! Helpers for running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported for a run that was killed after timing out.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Limits applied to one child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL once the timeout fires.
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub pid: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Exit code, with timeouts reported as [`TIMEOUT_EXIT_CODE`].
    pub fn exit_code(&self) -> Option<i32> {
        if self.timed_out {
            return Some(TIMEOUT_EXIT_CODE);
        }
        self.status.code()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout followed by stderr, with truncation notices.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        let stderr = self.stderr_text();
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group. On timeout the whole group gets
/// SIGTERM, then SIGKILL if it is still alive after `kill_grace`.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_with_timeout(mut cmd: Command, limits: &RunLimits) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()));
        }
    };
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                pid,
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, terminating process group"
            );
            timed_out = true;
            terminate(&mut child, limits.kill_grace)?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        pid,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed: started.elapsed(),
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(i32::try_from(child.id()).context("pid out of range")?);
    if let Err(err) = killpg(pgid, Signal::SIGTERM) {
        warn!(err = %err, "SIGTERM to process group failed");
    }
    let exited = child
        .wait_timeout(grace)
        .context("wait for command after SIGTERM")?;
    if exited.is_none() {
        warn!(grace_secs = grace.as_secs(), "process group ignored SIGTERM, sending SIGKILL");
    }

    // Descendants may outlive the child and keep the output pipes open.
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(err = %err, "SIGKILL to process group failed, killing child only");
            if exited.is_none() {
                child.kill().context("kill command")?;
            }
        }
    }
    match exited {
        Some(status) => Ok(status),
        None => child.wait().context("wait command after kill"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits(timeout: Duration) -> RunLimits {
        RunLimits {
            timeout,
            kill_grace: Duration::from_secs(1),
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let out = run_command_with_timeout(cmd, &limits(Duration::from_secs(10))).expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.exit_code(), Some(3));
        assert_eq!(out.stdout_text(), "hello\n");
        assert!(out.combined_text().contains("oops"));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "head -c 4000 /dev/zero"]);
        let out = run_command_with_timeout(cmd, &limits(Duration::from_secs(10))).expect("run");
        assert_eq!(out.stdout.len(), 1024);
        assert_eq!(out.stdout_truncated, 4000 - 1024);
    }

    #[test]
    fn timeout_kills_process_group() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let out = run_command_with_timeout(cmd, &limits(Duration::from_millis(200))).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert_eq!(out.exit_code(), Some(TIMEOUT_EXIT_CODE));
        assert!(out.elapsed < Duration::from_secs(10));

        let pid = nix::unistd::Pid::from_raw(i32::try_from(out.pid).expect("pid"));
        assert!(
            nix::sys::signal::kill(pid, None).is_err(),
            "child should no longer exist"
        );
    }

    #[test]
    fn timeout_kills_descendants_that_ignore_sigterm() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("grandchild.pid");
        let script = format!(
            "(trap '' TERM; exec sleep 20) & echo $! > '{}'; sleep 20",
            marker.display()
        );
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script.as_str()]);
        let out = run_command_with_timeout(cmd, &limits(Duration::from_secs(1))).expect("run");
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(10), "took {:?}", out.elapsed);

        let raw = std::fs::read_to_string(&marker).expect("grandchild pid");
        let pid: i32 = raw.trim().parse().expect("pid");
        let pid = nix::unistd::Pid::from_raw(pid);
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!is_running(pid), "grandchild should no longer exist");
    }

    /// Alive and not a zombie waiting for its new parent to reap it.
    fn is_running(pid: nix::unistd::Pid) -> bool {
        if nix::sys::signal::kill(pid, None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_none_or(|(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-binary-autodev");
        let err = run_command_with_timeout(cmd, &limits(Duration::from_secs(1)))
            .expect_err("spawn should fail");
        assert!(format!("{err:#}").contains("spawn"));
    }
}
