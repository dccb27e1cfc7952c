//! Capture engine and popen-style entry points
//!
//! `capture*` feed a fixed input to a child and collect its output in memory.
//! `popen*` hand the live streams to the caller, either directly or scoped
//! to a closure after which every stream is closed and the child reaped.

use std::borrow::Cow;

use tracing::{debug, warn};

use crate::config::{CaptureOptions, Command};
use crate::error::{PopenError, Result};
use crate::guard::ProcessGuard;
use crate::pipeline::Pipeline;
use crate::process::{ExitStatus, ProcessHandle};
use crate::pump::StreamPump;
use crate::redirect::{Redirect, StreamKind, StreamPolicy};
use crate::spawn::spawn;

/// Output collected from a finished child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    /// Captured stdout (stdout and stderr combined for `capture2e`)
    pub stdout: Vec<u8>,
    /// Captured stderr (empty unless captured separately)
    pub stderr: Vec<u8>,
    /// Exit status of the child
    pub status: ExitStatus,
    /// Input bytes the child never read because it closed stdin early
    pub unsent_input: usize,
}

impl Captured {
    /// Stdout as text, with invalid UTF-8 replaced
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr as text, with invalid UTF-8 replaced
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Whether the child exited with code 0
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Which streams a capture collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureMode {
    Separate,
    StdoutOnly,
    Merged,
}

impl CaptureMode {
    fn policy(self) -> StreamPolicy {
        match self {
            CaptureMode::Separate => StreamPolicy::piped(),
            CaptureMode::StdoutOnly => StreamPolicy::piped().stderr(Redirect::Null),
            CaptureMode::Merged => StreamPolicy::piped().stderr(Redirect::Merge),
        }
    }
}

fn text_mode(buf: Vec<u8>) -> Vec<u8> {
    match String::from_utf8(buf) {
        Ok(s) => s.into_bytes(),
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned().into_bytes(),
    }
}

fn capture(cmd: &Command, opts: &CaptureOptions, mode: CaptureMode) -> Result<Captured> {
    let mut guard = ProcessGuard::new(Pipeline::from(spawn(cmd, mode.policy())?));
    let child = guard.process_mut(0);

    let mut pump = StreamPump::new().watch(child.killer());
    match child.take_stdin() {
        Some(stdin) => pump = pump.feed(stdin, &opts.stdin_data),
        None if !opts.stdin_data.is_empty() => {
            warn!(pid = %child.pid(), "stdin is redirected; input data is ignored");
        }
        None => {}
    }
    if let Some(stdout) = child.take_stdout() {
        pump = pump.drain(stdout, StreamKind::Stdout, 0);
    }
    if let Some(stderr) = child.take_stderr() {
        pump = pump.drain(stderr, StreamKind::Stderr, 1);
    }
    let report = pump.run()?;

    let status = guard.finish()?[0];
    debug!(command = %cmd, %status, "Capture finished");

    if opts.strict_input && report.unsent_input > 0 {
        return Err(PopenError::BrokenPipe {
            unsent: report.unsent_input,
        });
    }

    let mut buffers = report.buffers.into_iter();
    let mut stdout = buffers.next().unwrap_or_default();
    let mut stderr = buffers.next().unwrap_or_default();
    if !opts.binary {
        stdout = text_mode(stdout);
        stderr = text_mode(stderr);
    }
    Ok(Captured {
        stdout,
        stderr,
        status,
        unsent_input: report.unsent_input,
    })
}

/// Run `cmd`, feeding `opts.stdin_data`, and capture stdout and stderr separately
///
/// # Examples
/// ```no_run
/// use ricecoder_popen::{capture3, CaptureOptions, Command};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let out = capture3(&Command::shell("echo out; echo err 1>&2"), &CaptureOptions::new())?;
/// assert_eq!(out.stdout, b"out\n");
/// assert_eq!(out.stderr, b"err\n");
/// # Ok(())
/// # }
/// ```
pub fn capture3(cmd: &Command, opts: &CaptureOptions) -> Result<Captured> {
    capture(cmd, opts, CaptureMode::Separate)
}

/// Run `cmd` and capture stdout; stderr is discarded
pub fn capture2(cmd: &Command, opts: &CaptureOptions) -> Result<Captured> {
    capture(cmd, opts, CaptureMode::StdoutOnly)
}

/// Run `cmd` and capture stdout and stderr together in `Captured::stdout`
///
/// Both streams share one pipe, so the interleaving is the order in which
/// the child wrote them.
pub fn capture2e(cmd: &Command, opts: &CaptureOptions) -> Result<Captured> {
    capture(cmd, opts, CaptureMode::Merged)
}

/// Spawn `cmd` with stdin, stdout and stderr piped
pub fn popen3(cmd: &Command) -> Result<ProcessHandle> {
    spawn(cmd, StreamPolicy::piped())
}

/// Spawn `cmd` with stdin and stdout piped; stderr is inherited
pub fn popen2(cmd: &Command) -> Result<ProcessHandle> {
    spawn(cmd, StreamPolicy::piped().stderr(Redirect::Inherit))
}

/// Spawn `cmd` with stdin piped and stderr merged into the stdout pipe
pub fn popen2e(cmd: &Command) -> Result<ProcessHandle> {
    spawn(cmd, StreamPolicy::piped().stderr(Redirect::Merge))
}

/// Run `f` with a process spawned by `popen3`, then close its streams and reap it
///
/// Cleanup runs whether `f` returns, fails or panics. If `f` fails, its
/// error is returned once cleanup finished; cleanup errors are only logged.
///
/// # Examples
/// ```no_run
/// use std::io::{Read, Write};
/// use ricecoder_popen::{popen3_with, Command, PopenError};
///
/// # fn main() -> Result<(), PopenError> {
/// let (line, status) = popen3_with(&Command::new("cat"), |child| {
///     child.take_stdin().unwrap().write_all(b"ping")?;
///     let mut out = String::new();
///     child.take_stdout().unwrap().read_to_string(&mut out)?;
///     Ok::<_, PopenError>(out)
/// })?;
/// assert_eq!(line, "ping");
/// assert!(status.success());
/// # Ok(())
/// # }
/// ```
pub fn popen3_with<F, R, E>(cmd: &Command, f: F) -> std::result::Result<(R, ExitStatus), E>
where
    F: FnOnce(&mut ProcessHandle) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(popen3(cmd)?, f)
}

/// Block form of [`popen2`]
pub fn popen2_with<F, R, E>(cmd: &Command, f: F) -> std::result::Result<(R, ExitStatus), E>
where
    F: FnOnce(&mut ProcessHandle) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(popen2(cmd)?, f)
}

/// Block form of [`popen2e`]
pub fn popen2e_with<F, R, E>(cmd: &Command, f: F) -> std::result::Result<(R, ExitStatus), E>
where
    F: FnOnce(&mut ProcessHandle) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(popen2e(cmd)?, f)
}

fn scoped<F, R, E>(child: ProcessHandle, f: F) -> std::result::Result<(R, ExitStatus), E>
where
    F: FnOnce(&mut ProcessHandle) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    let mut guard = ProcessGuard::new(Pipeline::from(child));
    // On error the guard is dropped here, reaping before the error escapes.
    let value = f(guard.process_mut(0))?;
    let status = guard.finish()?[0];
    Ok((value, status))
}
