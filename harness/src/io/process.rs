//! Helpers for running child processes with timeouts and bounded output.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

type SharedLog = Arc<Option<Mutex<File>>>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout followed by stderr, lossily decoded. This is what failure
    /// classification looks at.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
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

/// Limits applied to a single child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLimits {
    /// Interrupt the child after this long.
    pub timeout: Duration,
    /// Bytes of stdout and of stderr kept in memory (the rest is drained and counted).
    pub output_limit_bytes: usize,
    /// Time an interrupted child gets to exit on its own before it is killed.
    pub interrupt_grace: Duration,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. When `log_path` is `Some`,
/// every line of stdout and stderr is also appended to that file as it arrives.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), logging = log_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    limits: CommandLimits,
    log_path: Option<&Path>,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let log: SharedLog = Arc::new(match log_path {
        Some(path) => Some(Mutex::new(open_log(path)?)),
        None => None,
    });

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_log = Arc::clone(&log);
    let stderr_log = Arc::clone(&log);
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, &stdout_log));
    let stderr_handle = thread::spawn(move || read_lines_limited(stderr, limit, &stderr_log));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(limits.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                grace_secs = limits.interrupt_grace.as_secs(),
                "command timed out, interrupting"
            );
            timed_out = true;
            terminate(&mut child, limits.interrupt_grace)?
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
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Stop a child that overran its timeout.
///
/// Sends SIGINT first so a provisioning tool can persist its state, then kills
/// the child if it is still running after `grace`.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    if interrupt(child) {
        if let Some(status) = child
            .wait_timeout(grace)
            .context("wait for interrupted command")?
        {
            return Ok(status);
        }
        warn!(grace_secs = grace.as_secs(), "command ignored interrupt, killing");
    }
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn interrupt(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => true,
        Err(err) => {
            warn!(err = %err, "failed to interrupt command");
            false
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> bool {
    false
}

/// Append a header line to a command log (creating it if needed).
pub fn append_log_line(path: &Path, line: &str) -> Result<()> {
    let mut file = open_log(path)?;
    writeln!(file, "{line}").with_context(|| format!("write log {}", path.display()))
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing each line to the log.
fn read_lines_limited<R: Read>(reader: R, limit: usize, log: &SharedLog) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = &**log
            && let Ok(mut writer) = mutex.lock()
            && let Err(e) = writer.write_all(&line)
        {
            warn!(err = %e, "failed to write command log");
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits() -> CommandLimits {
        CommandLimits {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000,
            interrupt_grace: Duration::from_secs(5),
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let output = run_command(sh("echo out; echo err >&2"), limits(), None).expect("run");
        assert!(output.success());
        let text = output.combined_text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command(
            sh("printf '%0200d\\n' 0"),
            CommandLimits {
                timeout: Duration::from_secs(10),
                output_limit_bytes: 50,
                ..limits()
            },
            None,
        )
        .expect("run");
        assert_eq!(output.stdout.len(), 50);
        assert_eq!(output.stdout_truncated, 151);
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_command(
            sh("exec sleep 5"),
            CommandLimits {
                timeout: Duration::from_millis(100),
                output_limit_bytes: 100,
                ..limits()
            },
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn interrupted_child_may_exit_on_its_own() {
        let output = run_command(
            sh("trap 'echo saved state; exit 3' INT; sleep 5 >/dev/null 2>&1 & wait"),
            CommandLimits {
                timeout: Duration::from_millis(300),
                ..limits()
            },
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.status.code(), Some(3));
        assert!(output.combined_text().contains("saved state"));
    }

    #[test]
    fn child_ignoring_interrupt_is_killed_after_grace() {
        let started = std::time::Instant::now();
        let output = run_command(
            sh("trap '' INT; sleep 5 >/dev/null 2>&1 & wait"),
            CommandLimits {
                timeout: Duration::from_millis(200),
                output_limit_bytes: 100,
                interrupt_grace: Duration::from_millis(200),
            },
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.status.code(), None);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn tees_output_to_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/case.log");
        append_log_line(&log, "$ example").expect("header");
        run_command(sh("echo hello"), limits(), Some(&log)).expect("run");
        let contents = fs::read_to_string(&log).expect("log");
        assert_eq!(contents, "$ example\nhello\n");
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_command(
            Command::new("definitely-not-a-real-binary-4242"),
            limits(),
            None,
        )
        .expect_err("spawn");
        assert!(err.to_string().contains("spawn"));
    }
}
