//! Live child process handle and exit-status join

use std::fmt;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::{PopenError, Result};
use crate::stream::{PipeReader, PipeWriter};

/// How a child process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    /// Normal termination with `code`
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Termination by signal number `signal`
    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit code, if the process terminated normally
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Terminating signal, if the process was killed by one
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// True iff the process exited normally with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(s) => write!(f, "signal {} ({})", sig, s.as_str()),
                Err(_) => write!(f, "signal {}", sig),
            },
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// Where a process is in its reaping lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Running,
    /// A waiter is blocked until the process exits, without reaping it
    Reaping,
    Exited(ExitStatus),
}

/// Reaps one process exactly once and caches the result
///
/// Shared between a process handle and any killers handed out for it.
/// Reaping only ever happens with `state` locked, and the lock is never
/// held across a blocking call: a waiter first blocks until the process
/// is a zombie, then relocks and collects it. While the pid is unreaped
/// it cannot be recycled, so signalling under the lock is always safe.
#[derive(Debug)]
struct ExitJoin {
    pid: Pid,
    state: Mutex<JoinState>,
    reaped: Condvar,
}

impl ExitJoin {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: Mutex::new(JoinState::Running),
            reaped: Condvar::new(),
        }
    }

    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn wait(&self) -> Result<ExitStatus> {
        let mut state = self.state.lock();
        loop {
            match *state {
                JoinState::Exited(status) => return Ok(status),
                JoinState::Reaping => self.reaped.wait(&mut state),
                JoinState::Running => {
                    *state = JoinState::Reaping;
                    let exited = MutexGuard::unlocked(&mut state, || block_until_exited(self.pid));

                    // A concurrent try_wait may have collected it meanwhile
                    if let JoinState::Exited(status) = *state {
                        return Ok(status);
                    }
                    let outcome = match exited {
                        Ok(()) => self.reap_nohang(),
                        Err(source) => Err(PopenError::ExitWait {
                            pid: self.pid(),
                            source,
                        }),
                    };
                    match outcome {
                        Ok(Some(status)) => {
                            self.store(&mut state, status);
                            return Ok(status);
                        }
                        Ok(None) => *state = JoinState::Running,
                        Err(e) => {
                            *state = JoinState::Running;
                            self.reaped.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let mut state = self.state.lock();
        if let JoinState::Exited(status) = *state {
            return Ok(Some(status));
        }
        let status = self.reap_nohang()?;
        if let Some(status) = status {
            self.store(&mut state, status);
        }
        Ok(status)
    }

    fn is_reaped(&self) -> bool {
        matches!(*self.state.lock(), JoinState::Exited(_))
    }

    fn store(&self, state: &mut MutexGuard<'_, JoinState>, status: ExitStatus) {
        debug!(pid = %self.pid, %status, "Process reaped");
        **state = JoinState::Exited(status);
        self.reaped.notify_all();
    }

    /// Collect the process if it has exited; callers hold the state lock
    fn reap_nohang(&self) -> Result<Option<ExitStatus>> {
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(ws) => return Ok(decode(ws)),
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(PopenError::ExitWait {
                        pid: self.pid(),
                        source,
                    })
                }
            }
        }
    }

    fn signal(&self, sig: Signal) -> Result<bool> {
        let state = self.state.lock();
        if let JoinState::Exited(_) = *state {
            return Ok(false);
        }
        trace!(pid = %self.pid, signal = sig.as_str(), "Sending signal");
        let sent = signal::kill(self.pid, sig);
        drop(state);
        match sent {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(PopenError::Signal {
                pid: self.pid(),
                source,
            }),
        }
    }
}

/// Block until `pid` has exited, leaving it unreaped
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn block_until_exited(pid: Pid) -> nix::Result<()> {
    use nix::sys::wait::{waitid, Id};

    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Without a non-reaping wait, back off and let the caller poll
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn block_until_exited(_pid: Pid) -> nix::Result<()> {
    std::thread::sleep(std::time::Duration::from_millis(5));
    Ok(())
}

fn decode(ws: WaitStatus) -> Option<ExitStatus> {
    match ws {
        WaitStatus::Exited(_, code) => Some(ExitStatus::from_code(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ExitStatus::from_signal(sig as i32)),
        _ => None,
    }
}

/// Cloneable handle for signalling a process from another thread
///
/// Signalling a process whose exit status has already been collected is a
/// no-op returning `Ok(false)`, so a recycled pid is never targeted.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    join: Arc<ExitJoin>,
}

impl ProcessKiller {
    /// Process ID of the target
    pub fn pid(&self) -> u32 {
        self.join.pid()
    }

    /// Send `sig`; returns whether the signal was delivered
    pub fn signal(&self, sig: Signal) -> Result<bool> {
        self.join.signal(sig)
    }

    /// Send SIGTERM
    pub fn terminate(&self) -> Result<bool> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL
    pub fn kill(&self) -> Result<bool> {
        self.signal(Signal::SIGKILL)
    }

    /// Whether the exit status has been collected
    pub fn is_reaped(&self) -> bool {
        self.join.is_reaped()
    }

    /// Non-blocking status query sharing the handle's cache
    ///
    /// Does not block behind another thread suspended in [`wait`](Self::wait).
    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        self.join.try_wait()
    }

    /// Block until the process exits, sharing the handle's cache
    pub fn wait(&self) -> Result<ExitStatus> {
        self.join.wait()
    }
}

/// A spawned child process
///
/// Streams are present only for those configured as [`Redirect::Pipe`]
/// at spawn time. Dropping the handle closes any streams still held but
/// does not wait for the process; use [`ProcessGuard`] or call
/// [`ProcessHandle::wait`] to reap it.
///
/// [`Redirect::Pipe`]: crate::Redirect::Pipe
/// [`ProcessGuard`]: crate::ProcessGuard
#[derive(Debug)]
pub struct ProcessHandle {
    /// Parent end of the child's stdin
    pub stdin: Option<PipeWriter>,
    /// Parent end of the child's stdout
    pub stdout: Option<PipeReader>,
    /// Parent end of the child's stderr
    pub stderr: Option<PipeReader>,
    command: String,
    join: Arc<ExitJoin>,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        command: String,
        stdin: Option<PipeWriter>,
        stdout: Option<PipeReader>,
        stderr: Option<PipeReader>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            command,
            join: Arc::new(ExitJoin::new(Pid::from_raw(pid as i32))),
        }
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.join.pid()
    }

    /// Command line this process was spawned from
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for process to exit
    ///
    /// The first call reaps the process; later calls return the cached
    /// status without touching the OS again. Safe to call after the process
    /// has already exited and after its streams were closed.
    pub fn wait(&self) -> Result<ExitStatus> {
        self.join.wait()
    }

    /// Return the exit status if the process has exited, without blocking
    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        self.join.try_wait()
    }

    /// Check if process is still running
    pub fn is_running(&self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Handle for signalling this process from elsewhere
    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            join: Arc::clone(&self.join),
        }
    }

    /// Send SIGTERM
    pub fn terminate(&self) -> Result<bool> {
        self.join.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL
    pub fn kill(&self) -> Result<bool> {
        self.join.signal(Signal::SIGKILL)
    }

    /// Take stdin handle
    pub fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.stdin.take()
    }

    /// Take stdout handle
    pub fn take_stdout(&mut self) -> Option<PipeReader> {
        self.stdout.take()
    }

    /// Take stderr handle
    pub fn take_stderr(&mut self) -> Option<PipeReader> {
        self.stderr.take()
    }

    /// Close every stream still held by this handle
    pub fn close_streams(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_success() {
        assert!(ExitStatus::from_code(0).success());
        assert!(!ExitStatus::from_code(1).success());
        assert!(!ExitStatus::from_signal(9).success());
        assert_eq!(ExitStatus::from_signal(9).signal(), Some(9));
        assert_eq!(ExitStatus::from_signal(9).code(), None);
    }

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::from_code(3).to_string(), "exit code 3");
        assert!(ExitStatus::from_signal(15).to_string().contains("SIGTERM"));
    }

    #[test]
    fn test_decode_ignores_non_terminal_states() {
        let pid = Pid::from_raw(1);
        assert_eq!(decode(WaitStatus::StillAlive), None);
        assert_eq!(
            decode(WaitStatus::Exited(pid, 2)),
            Some(ExitStatus::from_code(2))
        );
        assert_eq!(
            decode(WaitStatus::Signaled(pid, Signal::SIGPIPE, false)),
            Some(ExitStatus::from_signal(libc::SIGPIPE))
        );
    }

    fn sleeper(secs: &str) -> ProcessHandle {
        crate::spawn::spawn(
            &crate::config::Command::new("sleep").arg(secs),
            crate::redirect::StreamPolicy::inherit(),
        )
        .unwrap()
    }

    #[test]
    fn test_try_wait_does_not_block_behind_waiter() {
        use std::time::{Duration, Instant};

        let child = sleeper("10");
        let killer = child.killer();
        let waiter = std::thread::spawn(move || killer.wait().unwrap());
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert_eq!(child.try_wait().unwrap(), None);
        assert!(child.is_running());
        assert!(!child.killer().is_reaped());
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(child.terminate().unwrap());
        let status = waiter.join().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert_eq!(child.try_wait().unwrap(), Some(status));
        assert!(!child.kill().unwrap());
    }

    #[test]
    fn test_waiter_and_poller_agree_on_status() {
        use std::time::Duration;

        let child = sleeper("0.2");
        let killer = child.killer();
        let waiter = std::thread::spawn(move || killer.wait().unwrap());

        let polled = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(waiter.join().unwrap(), polled);
        assert!(polled.success());
        assert_eq!(child.wait().unwrap(), polled);
    }
}
