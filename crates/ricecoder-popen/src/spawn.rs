//! Spawner - turns a [`Command`] and a [`StreamPolicy`] into a live process

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::process::Stdio;

use tracing::{debug, info};

use crate::config::Command;
use crate::error::{PopenError, Result};
use crate::process::ProcessHandle;
use crate::redirect::{Redirect, StreamKind, StreamPolicy};
use crate::stream::{cloexec_pipe, PipeReader, PipeWriter};

/// Child-side target of one standard stream
#[derive(Debug)]
enum ChildEnd {
    Inherit(StreamKind),
    Null,
    Fd(OwnedFd),
    Merge,
}

impl ChildEnd {
    fn duplicate(&self) -> io::Result<ChildEnd> {
        Ok(match self {
            ChildEnd::Inherit(StreamKind::Stdout) => {
                ChildEnd::Fd(io::stdout().as_fd().try_clone_to_owned()?)
            }
            ChildEnd::Inherit(StreamKind::Stderr) => {
                ChildEnd::Fd(io::stderr().as_fd().try_clone_to_owned()?)
            }
            ChildEnd::Inherit(StreamKind::Stdin) => {
                ChildEnd::Fd(io::stdin().as_fd().try_clone_to_owned()?)
            }
            ChildEnd::Null => ChildEnd::Null,
            ChildEnd::Fd(fd) => ChildEnd::Fd(fd.try_clone()?),
            ChildEnd::Merge => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot merge a stream into a merged stream",
                ))
            }
        })
    }

    fn into_stdio(self) -> Stdio {
        match self {
            ChildEnd::Inherit(_) | ChildEnd::Merge => Stdio::inherit(),
            ChildEnd::Null => Stdio::null(),
            ChildEnd::Fd(fd) => Stdio::from(fd),
        }
    }
}

fn validate(policy: &StreamPolicy) -> Result<()> {
    if matches!(policy.stdin, Redirect::Merge) {
        return Err(PopenError::InvalidConfig(
            "stdin cannot be merged into an output stream".to_string(),
        ));
    }
    if matches!(policy.stdout, Redirect::Merge) && matches!(policy.stderr, Redirect::Merge) {
        return Err(PopenError::InvalidConfig(
            "stdout and stderr cannot both be merged into each other".to_string(),
        ));
    }
    Ok(())
}

fn input_end(redirect: &Redirect) -> io::Result<(ChildEnd, Option<PipeWriter>)> {
    Ok(match redirect {
        Redirect::Pipe => {
            let (read, write) = cloexec_pipe()?;
            (ChildEnd::Fd(read), Some(PipeWriter::new(write)))
        }
        Redirect::Inherit => (ChildEnd::Inherit(StreamKind::Stdin), None),
        Redirect::Null => (ChildEnd::Null, None),
        Redirect::Path(path) | Redirect::Append(path) => {
            (ChildEnd::Fd(File::open(path)?.into()), None)
        }
        Redirect::Fd(fd) => (ChildEnd::Fd(fd.try_clone()?), None),
        Redirect::Merge => (ChildEnd::Merge, None),
    })
}

fn output_end(redirect: &Redirect, kind: StreamKind) -> io::Result<(ChildEnd, Option<PipeReader>)> {
    Ok(match redirect {
        Redirect::Pipe => {
            let (read, write) = cloexec_pipe()?;
            (ChildEnd::Fd(write), Some(PipeReader::new(read)))
        }
        Redirect::Inherit => (ChildEnd::Inherit(kind), None),
        Redirect::Null => (ChildEnd::Null, None),
        Redirect::Path(path) => (ChildEnd::Fd(File::create(path)?.into()), None),
        Redirect::Append(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (ChildEnd::Fd(file.into()), None)
        }
        Redirect::Fd(fd) => (ChildEnd::Fd(fd.try_clone()?), None),
        Redirect::Merge => (ChildEnd::Merge, None),
    })
}

/// Spawn a single process
///
/// The command's own redirects take precedence over `policy`. Only streams
/// that end up as [`Redirect::Pipe`] are exposed on the returned handle;
/// every other stream is already wired to its target.
///
/// # Examples
/// ```no_run
/// use ricecoder_popen::{spawn, Command, StreamPolicy, Redirect};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = StreamPolicy::inherit().stdout(Redirect::Pipe);
/// let mut child = spawn(&Command::new("ls"), policy)?;
/// let listing = child.take_stdout().unwrap().read_all()?;
/// child.wait()?;
/// # Ok(())
/// # }
/// ```
pub fn spawn(command: &Command, policy: StreamPolicy) -> Result<ProcessHandle> {
    let policy = policy.overlay(
        command.stdin.as_ref(),
        command.stdout.as_ref(),
        command.stderr.as_ref(),
    );
    validate(&policy)?;

    let argv = command.to_argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PopenError::InvalidConfig("empty argument vector".to_string()))?;

    debug!(
        command = %command,
        args = ?args,
        "Spawning process"
    );

    let mut cmd = std::process::Command::new(program);
    cmd.args(args);

    if command.env_clear {
        cmd.env_clear();
    }
    for (key, value) in &command.env {
        match value {
            Some(value) => cmd.env(key, value),
            None => cmd.env_remove(key),
        };
    }

    if let Some(ref dir) = command.working_dir {
        cmd.current_dir(dir);
    }

    let (stdin_end, stdin) = input_end(&policy.stdin)?;
    let (mut stdout_end, stdout) = output_end(&policy.stdout, StreamKind::Stdout)?;
    let (mut stderr_end, stderr) = output_end(&policy.stderr, StreamKind::Stderr)?;
    if matches!(stderr_end, ChildEnd::Merge) {
        stderr_end = stdout_end.duplicate()?;
    } else if matches!(stdout_end, ChildEnd::Merge) {
        stdout_end = stderr_end.duplicate()?;
    }

    cmd.stdin(stdin_end.into_stdio());
    cmd.stdout(stdout_end.into_stdio());
    cmd.stderr(stderr_end.into_stdio());

    let child = cmd.spawn().map_err(|source| PopenError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    let pid = child.id();

    // Close the parent's copies of the child-side descriptors now so that
    // EOF on our pipe ends depends only on the child.
    drop(cmd);
    drop(child);

    info!(pid = %pid, command = %command, "Process spawned");

    Ok(ProcessHandle::new(pid, command.to_string(), stdin, stdout, stderr))
}
