//! Pipeline builder - chains processes stdout-to-stdin through OS pipes
//!
//! Stage `i`'s stdout is the write end of a pipe whose read end becomes
//! stage `i + 1`'s stdin. The parent never relays data between stages: its
//! copies of every intermediate pipe end are closed as soon as the stage on
//! each side has been spawned. Only the first stage's stdin and the last
//! stage's stdout can be exposed to the caller.
//!
//! Explicit redirects on a stage's [`Command`] take precedence over this
//! automatic wiring. A stage whose upstream neighbour redirected its stdout
//! elsewhere reads from the null device.

use tracing::{debug, info, warn};

use crate::config::Command;
use crate::error::{PopenError, Result};
use crate::guard::ProcessGuard;
use crate::process::{ExitStatus, ProcessHandle};
use crate::redirect::{Redirect, StreamPolicy};
use crate::spawn::spawn;
use crate::stream::{PipeReader, PipeWriter};

/// Processes of a running pipeline, in stage order
///
/// The first stage's `stdin` and the last stage's `stdout` are the
/// pipeline's outer ends; every other stage holds no streams.
#[derive(Debug, Default)]
pub struct Pipeline {
    processes: Vec<ProcessHandle>,
}

impl Pipeline {
    /// Number of stages
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Process handles in stage order
    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    /// Process handles in stage order, mutably
    pub fn processes_mut(&mut self) -> &mut [ProcessHandle] {
        &mut self.processes
    }

    /// Process of stage `index`
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn process_mut(&mut self, index: usize) -> &mut ProcessHandle {
        &mut self.processes[index]
    }

    /// Give up the pipeline, keeping its process handles
    pub fn into_processes(self) -> Vec<ProcessHandle> {
        self.processes
    }

    /// Process IDs in stage order
    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(ProcessHandle::pid).collect()
    }

    /// Writable end feeding the first stage, if exposed
    pub fn stdin_mut(&mut self) -> Option<&mut PipeWriter> {
        self.processes.first_mut()?.stdin.as_mut()
    }

    /// Readable end of the last stage's output, if exposed
    pub fn stdout_mut(&mut self) -> Option<&mut PipeReader> {
        self.processes.last_mut()?.stdout.as_mut()
    }

    /// Take the first stage's stdin; dropping it signals EOF to the pipeline
    pub fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.processes.first_mut()?.take_stdin()
    }

    /// Take the last stage's stdout
    pub fn take_stdout(&mut self) -> Option<PipeReader> {
        self.processes.last_mut()?.take_stdout()
    }

    /// Wait on every stage in order
    ///
    /// Outer streams are left as they are; close them first if the
    /// pipeline depends on them reaching EOF.
    pub fn wait_all(&self) -> Result<Vec<ExitStatus>> {
        self.processes.iter().map(ProcessHandle::wait).collect()
    }
}

impl From<ProcessHandle> for Pipeline {
    fn from(process: ProcessHandle) -> Self {
        Self {
            processes: vec![process],
        }
    }
}

impl From<Vec<ProcessHandle>> for Pipeline {
    fn from(processes: Vec<ProcessHandle>) -> Self {
        Self { processes }
    }
}

/// Which outer ends get a pipe
#[derive(Debug, Clone, Copy)]
struct OuterEnds {
    stdin: bool,
    stdout: bool,
}

fn outer(piped: bool) -> Redirect {
    if piped {
        Redirect::Pipe
    } else {
        Redirect::Inherit
    }
}

fn build(stages: &[Command], ends: OuterEnds) -> Result<Pipeline> {
    if stages.is_empty() {
        return Err(PopenError::InvalidConfig(
            "pipeline needs at least one stage".to_string(),
        ));
    }
    debug!(stages = stages.len(), "Starting pipeline");

    let last = stages.len() - 1;
    let mut processes: Vec<ProcessHandle> = Vec::with_capacity(stages.len());
    let mut upstream: Option<PipeReader> = None;

    for (index, stage) in stages.iter().enumerate() {
        let stdin = if index == 0 {
            outer(ends.stdin)
        } else {
            match upstream.take() {
                Some(reader) => Redirect::fd(reader),
                None => Redirect::Null,
            }
        };
        let stdout = if index == last {
            outer(ends.stdout)
        } else {
            Redirect::Pipe
        };
        let policy = StreamPolicy::inherit().stdin(stdin).stdout(stdout);

        // The policy holds the only parent copy of the upstream read end;
        // it is closed when spawn returns.
        let mut process = match spawn(stage, policy) {
            Ok(process) => process,
            Err(e) => {
                warn!(stage = index, error = %e, "Pipeline stage failed to spawn");
                abort(processes);
                return Err(e);
            }
        };
        if index != last {
            upstream = process.take_stdout();
        }
        processes.push(process);
    }

    let pipeline = Pipeline::from(processes);
    info!(pids = ?pipeline.pids(), "Pipeline started");
    Ok(pipeline)
}

/// Tear down stages spawned before a later stage failed
fn abort(processes: Vec<ProcessHandle>) {
    for process in &processes {
        if let Err(e) = process.kill() {
            warn!(pid = %process.pid(), error = %e, "Failed to kill pipeline stage");
        }
    }
    drop(ProcessGuard::new(Pipeline::from(processes)));
}

/// Start a pipeline exposing the first stage's stdin and the last stage's stdout
///
/// # Examples
/// ```no_run
/// use std::io::{Read, Write};
/// use ricecoder_popen::{pipeline_rw, Command};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut pipeline = pipeline_rw(&[Command::new("tr").args(["a-z", "A-Z"]), Command::new("sort")])?;
/// pipeline.take_stdin().unwrap().write_all(b"b\na\n")?;
/// let mut out = String::new();
/// pipeline.take_stdout().unwrap().read_to_string(&mut out)?;
/// assert_eq!(out, "A\nB\n");
/// pipeline.wait_all()?;
/// # Ok(())
/// # }
/// ```
pub fn pipeline_rw(stages: &[Command]) -> Result<Pipeline> {
    build(
        stages,
        OuterEnds {
            stdin: true,
            stdout: true,
        },
    )
}

/// Start a pipeline exposing only the last stage's stdout
///
/// The first stage's stdin pipe is closed immediately, so it reads EOF
/// unless its command redirects stdin explicitly.
pub fn pipeline_r(stages: &[Command]) -> Result<Pipeline> {
    let mut pipeline = pipeline_rw(stages)?;
    drop(pipeline.take_stdin());
    Ok(pipeline)
}

/// Start a pipeline exposing only the first stage's stdin
///
/// The last stage's stdout pipe is closed immediately, so its output is
/// refused unless its command redirects stdout explicitly.
pub fn pipeline_w(stages: &[Command]) -> Result<Pipeline> {
    let mut pipeline = pipeline_rw(stages)?;
    drop(pipeline.take_stdout());
    Ok(pipeline)
}

/// Start a pipeline whose outer ends are inherited from the parent
pub fn pipeline_start(stages: &[Command]) -> Result<Pipeline> {
    build(
        stages,
        OuterEnds {
            stdin: false,
            stdout: false,
        },
    )
}

/// Run a pipeline to completion and return every stage's status in order
///
/// No stream is exposed; outer ends are inherited unless the first and
/// last commands redirect them.
pub fn pipeline(stages: &[Command]) -> Result<Vec<ExitStatus>> {
    ProcessGuard::new(pipeline_start(stages)?).finish()
}

fn scoped<F, R, E>(pipeline: Pipeline, f: F) -> std::result::Result<(R, Vec<ExitStatus>), E>
where
    F: FnOnce(&mut Pipeline) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    let mut guard = ProcessGuard::new(pipeline);
    let value = f(guard.pipeline_mut())?;
    let statuses = guard.finish()?;
    Ok((value, statuses))
}

/// Block form of [`pipeline_rw`]: run `f`, then close outer streams and reap every stage
pub fn pipeline_rw_with<F, R, E>(
    stages: &[Command],
    f: F,
) -> std::result::Result<(R, Vec<ExitStatus>), E>
where
    F: FnOnce(&mut Pipeline) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(pipeline_rw(stages)?, f)
}

/// Block form of [`pipeline_r`]
pub fn pipeline_r_with<F, R, E>(
    stages: &[Command],
    f: F,
) -> std::result::Result<(R, Vec<ExitStatus>), E>
where
    F: FnOnce(&mut Pipeline) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(pipeline_r(stages)?, f)
}

/// Block form of [`pipeline_w`]
pub fn pipeline_w_with<F, R, E>(
    stages: &[Command],
    f: F,
) -> std::result::Result<(R, Vec<ExitStatus>), E>
where
    F: FnOnce(&mut Pipeline) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(pipeline_w(stages)?, f)
}

/// Block form of [`pipeline_start`]
pub fn pipeline_start_with<F, R, E>(
    stages: &[Command],
    f: F,
) -> std::result::Result<(R, Vec<ExitStatus>), E>
where
    F: FnOnce(&mut Pipeline) -> std::result::Result<R, E>,
    E: From<PopenError>,
{
    scoped(pipeline_start(stages)?, f)
}
