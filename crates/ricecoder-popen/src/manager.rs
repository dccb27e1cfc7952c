//! Process manager - caller-owned registry of spawned children
//!
//! Nothing here is global: each manager tracks only what was spawned
//! through it, so independent managers never interfere.

use std::thread::sleep;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Command;
use crate::error::Result;
use crate::process::{ExitStatus, ProcessHandle, ProcessKiller};
use crate::redirect::StreamPolicy;
use crate::spawn::spawn;

/// SIGKILL escalation timeout
pub const SIGKILL_TIMEOUT: Duration = Duration::from_millis(200);

/// Interval between exit checks during graceful shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tracks children spawned through it
#[derive(Debug, Default)]
pub struct ProcessManager {
    children: Mutex<Vec<ProcessKiller>>,
}

impl ProcessManager {
    /// Create new process manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked process
    ///
    /// # Examples
    /// ```no_run
    /// use ricecoder_popen::{Command, ProcessManager, StreamPolicy};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let child = manager.spawn(&Command::new("sleep").arg("1000"), StreamPolicy::inherit())?;
    /// manager.shutdown(&child)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(&self, command: &Command, policy: StreamPolicy) -> Result<ProcessHandle> {
        let child = spawn(command, policy)?;
        let mut children = self.children.lock();
        prune(&mut children);
        children.push(child.killer());
        Ok(child)
    }

    /// PIDs of tracked children that have not been reaped
    ///
    /// Children that exited are reaped and forgotten.
    pub fn running(&self) -> Vec<u32> {
        let mut children = self.children.lock();
        prune(&mut children);
        children.iter().map(ProcessKiller::pid).collect()
    }

    /// Gracefully shutdown a process
    ///
    /// Sends SIGTERM, waits up to [`SIGKILL_TIMEOUT`] for the process to
    /// exit, then sends SIGKILL and reaps it.
    pub fn shutdown(&self, child: &ProcessHandle) -> Result<ExitStatus> {
        let status = terminate_gracefully(&child.killer(), SIGKILL_TIMEOUT)?;
        self.forget(child.pid());
        Ok(status)
    }

    /// Gracefully shutdown every tracked process
    pub fn shutdown_all(&self) -> Vec<(u32, Result<ExitStatus>)> {
        let children = std::mem::take(&mut *self.children.lock());
        children
            .iter()
            .map(|killer| (killer.pid(), terminate_gracefully(killer, SIGKILL_TIMEOUT)))
            .collect()
    }

    fn forget(&self, pid: u32) {
        self.children.lock().retain(|killer| killer.pid() != pid);
    }
}

/// Drop children that have exited, reaping them if nobody has yet
fn prune(children: &mut Vec<ProcessKiller>) {
    children.retain(|killer| matches!(killer.try_wait(), Ok(None)));
}

/// SIGTERM, poll for `grace`, then SIGKILL; always reaps
pub fn terminate_gracefully(killer: &ProcessKiller, grace: Duration) -> Result<ExitStatus> {
    if let Some(status) = killer.try_wait()? {
        return Ok(status);
    }

    debug!(pid = %killer.pid(), "Shutting down process");
    killer.terminate()?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = killer.try_wait()? {
            debug!(pid = %killer.pid(), %status, "Process shut down gracefully");
            return Ok(status);
        }
        sleep(POLL_INTERVAL);
    }

    warn!(pid = %killer.pid(), "Process ignored SIGTERM, sending SIGKILL");
    killer.kill()?;
    killer.wait()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_tracks_child() {
        let manager = ProcessManager::new();
        let child = manager
            .spawn(&Command::new("sleep").arg("10"), StreamPolicy::inherit())
            .unwrap();
        assert_eq!(manager.running(), vec![child.pid()]);

        let status = manager.shutdown(&child).unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert!(manager.running().is_empty());
    }

    #[test]
    fn test_escalates_to_sigkill() {
        let child = spawn(
            &Command::shell("trap '' TERM; sleep 10"),
            StreamPolicy::inherit(),
        )
        .unwrap();
        // Give the shell time to install the trap
        sleep(Duration::from_millis(100));
        let status = terminate_gracefully(&child.killer(), Duration::from_millis(50)).unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_exited_children_are_forgotten() {
        let manager = ProcessManager::new();
        let child = manager
            .spawn(&Command::new("true"), StreamPolicy::inherit())
            .unwrap();
        child.wait().unwrap();
        assert!(manager.running().is_empty());
    }

    #[test]
    fn test_spawn_prunes_exited_children() {
        let manager = ProcessManager::new();
        for _ in 0..5 {
            let child = manager
                .spawn(&Command::new("true"), StreamPolicy::inherit())
                .unwrap();
            child.wait().unwrap();
        }
        let child = manager
            .spawn(&Command::new("sleep").arg("10"), StreamPolicy::inherit())
            .unwrap();
        assert_eq!(manager.children.lock().len(), 1);
        manager.shutdown(&child).unwrap();
    }

    #[test]
    fn test_shutdown_while_another_thread_waits() {
        let manager = ProcessManager::new();
        let child = manager
            .spawn(&Command::new("sleep").arg("30"), StreamPolicy::inherit())
            .unwrap();
        let killer = child.killer();
        let waiter = std::thread::spawn(move || killer.wait().unwrap());
        sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert_eq!(manager.running(), vec![child.pid()]);
        let results = manager.shutdown_all();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 1);
        let status = results[0].1.as_ref().copied().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert_eq!(waiter.join().unwrap(), status);
    }

    #[test]
    fn test_managers_are_independent() {
        let a = ProcessManager::new();
        let b = ProcessManager::new();
        let child = a
            .spawn(&Command::new("sleep").arg("10"), StreamPolicy::inherit())
            .unwrap();
        assert!(b.running().is_empty());
        assert_eq!(b.shutdown_all().len(), 0);
        assert_eq!(a.shutdown_all().len(), 1);
        assert!(child.wait().unwrap().signal().is_some());
    }
}
