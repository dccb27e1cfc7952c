//! Stream pump - single-threaded multiplexed stdin/stdout/stderr driver
//!
//! One process's streams are serviced from one execution context: each
//! iteration attempts a non-blocking write of pending input and a
//! non-blocking read of every open output, and only when nothing made
//! progress does the pump block in `poll(2)` across all open streams.
//!
//! A pump that watches its process settles input left over when an output
//! closes by checking whether the process is still alive, so a stdin read
//! end briefly duplicated into some other forked child cannot turn a dead
//! child's refused input into a spurious [`PopenError::PrematureEof`].

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{trace, warn};

use crate::error::{PopenError, Result};
use crate::process::ProcessKiller;
use crate::redirect::StreamKind;
use crate::stream::{PipeReader, PipeWriter};

/// Bytes moved per read or write attempt
const CHUNK_SIZE: usize = 64 * 1024;

/// How long a live process may leave input blocked after closing an output
const SETTLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Poll timeout while settling, in milliseconds
const SETTLE_POLL_MS: u16 = 10;

struct PumpInput<'a> {
    pipe: Option<PipeWriter>,
    data: &'a [u8],
    pos: usize,
    broken: bool,
}

impl PumpInput<'_> {
    fn pending(&self) -> bool {
        self.pipe.is_some()
    }

    fn unsent(&self) -> usize {
        self.data.len() - self.pos
    }

    /// One write attempt; returns whether anything happened
    fn step(&mut self) -> Result<bool> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(false);
        };
        if self.pos == self.data.len() {
            self.pipe = None;
            return Ok(true);
        }
        let end = (self.pos + CHUNK_SIZE).min(self.data.len());
        match pipe.write(&self.data[self.pos..end]) {
            Ok(n) => {
                self.pos += n;
                if self.pos == self.data.len() {
                    trace!(bytes = self.pos, "Input fully written");
                    self.pipe = None;
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.abandon("Child closed stdin before all input was written");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give up on the remaining input
    fn abandon(&mut self, reason: &str) {
        warn!(unsent = self.unsent(), "{}", reason);
        self.broken = true;
        self.pipe = None;
    }
}

struct PumpOutput {
    pipe: Option<PipeReader>,
    kind: StreamKind,
    sink: usize,
}

/// Result of a completed pump run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// One buffer per sink, in sink order
    pub buffers: Vec<Vec<u8>>,
    /// Input bytes not delivered because the child closed its stdin
    pub unsent_input: usize,
}

/// Drives one optional input and any number of outputs to completion
///
/// Several outputs may share a sink, in which case their data is appended
/// to the same buffer in the order the reads complete.
///
/// # Examples
/// ```no_run
/// use ricecoder_popen::{spawn, Command, StreamPolicy, StreamKind, StreamPump};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut child = spawn(&Command::new("cat"), StreamPolicy::piped())?;
/// let report = StreamPump::new()
///     .feed(child.take_stdin().unwrap(), b"data")
///     .drain(child.take_stdout().unwrap(), StreamKind::Stdout, 0)
///     .drain(child.take_stderr().unwrap(), StreamKind::Stderr, 1)
///     .run()?;
/// assert_eq!(report.buffers[0], b"data");
/// child.wait()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct StreamPump<'a> {
    input: Option<PumpInput<'a>>,
    outputs: Vec<PumpOutput>,
    sinks: usize,
    process: Option<ProcessKiller>,
}

impl<'a> StreamPump<'a> {
    /// Create an empty pump
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `data` to `pipe`, closing it once everything is written
    pub fn feed(mut self, pipe: PipeWriter, data: &'a [u8]) -> Self {
        self.input = Some(PumpInput {
            pipe: Some(pipe),
            data,
            pos: 0,
            broken: false,
        });
        self
    }

    /// Watch the process owning the streams
    ///
    /// When an output closes while input is still pending, the pump then
    /// keeps offering input until the process either refuses it (broken
    /// pipe), exits (the rest is reported as unsent), or stays alive
    /// without reading for a settling period ([`PopenError::PrematureEof`]).
    /// Unwatched pumps decide on the first blocked write instead.
    pub fn watch(mut self, process: ProcessKiller) -> Self {
        self.process = Some(process);
        self
    }

    /// Read `pipe` until EOF into buffer number `sink`
    pub fn drain(mut self, pipe: PipeReader, kind: StreamKind, sink: usize) -> Self {
        self.sinks = self.sinks.max(sink + 1);
        self.outputs.push(PumpOutput {
            pipe: Some(pipe),
            kind,
            sink,
        });
        self
    }

    /// Run until input is delivered (or refused) and every output hit EOF
    ///
    /// Fails with [`PopenError::PrematureEof`] if an output reaches EOF
    /// while input is still pending and the child has not closed its stdin.
    /// See [`watch`](Self::watch) for how a watched process changes that.
    pub fn run(mut self) -> Result<PumpReport> {
        if let Some(pipe) = self.input.as_ref().and_then(|i| i.pipe.as_ref()) {
            pipe.set_nonblocking(true)?;
        }
        for pipe in self.outputs.iter().filter_map(|o| o.pipe.as_ref()) {
            pipe.set_nonblocking(true)?;
        }

        let mut buffers = vec![Vec::new(); self.sinks];
        let mut chunk = vec![0u8; CHUNK_SIZE];
        // Set once an output closed while input was pending (watched pumps)
        let mut stalled: Option<(Instant, StreamKind)> = None;

        loop {
            let input_pending = self.input.as_ref().is_some_and(PumpInput::pending);
            if !input_pending && self.outputs.iter().all(|o| o.pipe.is_none()) {
                break;
            }

            let mut progressed = match self.input.as_mut() {
                Some(input) => input.step()?,
                None => false,
            };
            if progressed {
                if let Some((since, _)) = stalled.as_mut() {
                    *since = Instant::now();
                }
            }

            for output in &mut self.outputs {
                let Some(pipe) = output.pipe.as_mut() else {
                    continue;
                };
                match pipe.read(&mut chunk) {
                    Ok(0) => {
                        trace!(stream = %output.kind, "End of stream");
                        output.pipe = None;
                        progressed = true;
                        match (self.input.as_mut(), self.process.is_some()) {
                            (Some(input), true) if input.pending() => {
                                stalled.get_or_insert((Instant::now(), output.kind));
                            }
                            (Some(input), false) => check_input_after_eof(input, output.kind)?,
                            _ => {}
                        }
                    }
                    Ok(n) => {
                        buffers[output.sink].extend_from_slice(&chunk[..n]);
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => progressed = true,
                    Err(e) => return Err(e.into()),
                }
            }

            if progressed {
                continue;
            }
            let input_pending = self.input.as_ref().is_some_and(PumpInput::pending);
            match (stalled, &self.process) {
                (Some((since, stream)), Some(process)) if input_pending => {
                    if process.try_wait()?.is_some() {
                        if let Some(input) = self.input.as_mut() {
                            input.abandon("Child exited before all input was written");
                        }
                        continue;
                    }
                    if since.elapsed() >= SETTLE_TIMEOUT {
                        return Err(PopenError::PrematureEof { stream });
                    }
                    self.wait_ready(PollTimeout::from(SETTLE_POLL_MS))?;
                }
                _ => self.wait_ready(PollTimeout::NONE)?,
            }
        }

        let unsent_input = self
            .input
            .as_ref()
            .filter(|i| i.broken)
            .map_or(0, PumpInput::unsent);
        Ok(PumpReport {
            buffers,
            unsent_input,
        })
    }

    /// Block until at least one open stream is ready or `timeout` passes
    fn wait_ready(&self, timeout: PollTimeout) -> Result<()> {
        let mut fds = Vec::with_capacity(self.outputs.len() + 1);
        if let Some(pipe) = self.input.as_ref().and_then(|i| i.pipe.as_ref()) {
            fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLOUT));
        }
        for pipe in self.outputs.iter().filter_map(|o| o.pipe.as_ref()) {
            fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLIN));
        }
        loop {
            match poll(&mut fds, timeout) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// EOF on an output while input remains is only tolerated once the child
/// has also closed its stdin, which one more write attempt reveals.
fn check_input_after_eof(input: &mut PumpInput<'_>, stream: StreamKind) -> Result<()> {
    if !input.pending() {
        return Ok(());
    }
    loop {
        match input.step() {
            Ok(true) if input.pending() => continue,
            Ok(true) => return Ok(()),
            Ok(false) => return Err(PopenError::PrematureEof { stream }),
            Err(e) => return Err(e),
        }
    }
}
