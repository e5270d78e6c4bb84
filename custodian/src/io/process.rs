//! Child process execution with bounded capture and operator echo.
//!
//! Verification and repair commands need their output twice: streamed live so
//! the operator can follow along, and captured for classification and
//! prompting. Reader threads drain each pipe once, fanning out to the
//! process-wide stdout/stderr and an in-memory buffer, instead of re-reading
//! process output.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// What to run and how to bound it.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Executable and arguments. Spawned directly, no shell interpretation.
    pub argv: Vec<String>,
    /// Working directory; `None` inherits the parent's.
    pub cwd: Option<PathBuf>,
    /// Bytes fed to the child's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Cancellable deadline. `None` waits for the child indefinitely.
    pub timeout: Option<Duration>,
    /// Bound on captured stdout/stderr; bytes beyond this are discarded while
    /// still draining the pipe.
    pub output_limit_bytes: usize,
    /// Mirror child output to the operator's stdout/stderr as it streams.
    pub echo: bool,
}

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
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

enum EchoSink {
    Stdout,
    Stderr,
    None,
}

impl EchoSink {
    fn write(&self, chunk: &[u8]) {
        let result = match self {
            Self::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(chunk).and_then(|()| out.flush())
            }
            Self::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(chunk).and_then(|()| err.flush())
            }
            Self::None => Ok(()),
        };
        if let Err(err) = result {
            warn!(err = %err, "failed to echo child output");
        }
    }
}

/// Spawn `spec.argv` and wait for it, capturing bounded output.
///
/// Pipes are read concurrently while the child runs so large output cannot
/// deadlock. On deadline expiry the child is killed and `timed_out` is set;
/// the partial output captured so far is still returned.
pub fn run_argv(spec: &ExecSpec) -> Result<CommandOutput> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| anyhow!("empty argv"))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(program, "spawning child process");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {program}"))?;

    if let Some(input) = &spec.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = spec.output_limit_bytes;
    let stdout_sink = if spec.echo { EchoSink::Stdout } else { EchoSink::None };
    let stderr_sink = if spec.echo { EchoSink::Stderr } else { EchoSink::None };
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit, &stdout_sink));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit, &stderr_sink));

    let mut timed_out = false;
    let status = match spec.timeout {
        Some(timeout) => match child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
        None => child.wait().context("wait for command")?,
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

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    sink: &EchoSink,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        sink.write(&chunk[..n]);
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
