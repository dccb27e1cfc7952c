//! Per-stream wiring of a child's standard streams

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

/// One of the three standard streams of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

/// Where a child's standard stream is connected
#[derive(Debug, Clone)]
pub enum Redirect {
    /// A new pipe; the parent end is exposed on the process handle
    Pipe,
    /// Share the parent's corresponding stream
    Inherit,
    /// The null device
    Null,
    /// Open a file: read-only for stdin, created and truncated for outputs
    Path(PathBuf),
    /// Open a file for appending (outputs only; opened read-only for stdin)
    Append(PathBuf),
    /// An already open descriptor, duplicated into the child at spawn time
    Fd(Arc<OwnedFd>),
    /// Point stdout at stderr's target or stderr at stdout's (`1>&2` / `2>&1`)
    Merge,
}

impl Redirect {
    /// Redirect to an existing descriptor, taking ownership of it
    pub fn fd(fd: impl Into<OwnedFd>) -> Self {
        Redirect::Fd(Arc::new(fd.into()))
    }

    /// Redirect to a file path (truncating for outputs)
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Redirect::Path(path.into())
    }

    /// Whether the parent gets a pipe end for this stream
    pub fn is_pipe(&self) -> bool {
        matches!(self, Redirect::Pipe)
    }
}

impl From<std::fs::File> for Redirect {
    fn from(file: std::fs::File) -> Self {
        Redirect::fd(file)
    }
}

/// Wiring for all three standard streams of one spawn
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

impl StreamPolicy {
    /// Every stream inherited from the parent
    pub fn inherit() -> Self {
        Self {
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
        }
    }

    /// Every stream connected to a new pipe
    pub fn piped() -> Self {
        Self {
            stdin: Redirect::Pipe,
            stdout: Redirect::Pipe,
            stderr: Redirect::Pipe,
        }
    }

    /// Set stdin redirect
    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    /// Set stdout redirect
    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    /// Set stderr redirect
    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Redirect for stream `kind`
    pub fn get(&self, kind: StreamKind) -> &Redirect {
        match kind {
            StreamKind::Stdin => &self.stdin,
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Replace each stream with the explicit override, where one is given
    pub fn overlay(
        mut self,
        stdin: Option<&Redirect>,
        stdout: Option<&Redirect>,
        stderr: Option<&Redirect>,
    ) -> Self {
        if let Some(r) = stdin {
            self.stdin = r.clone();
        }
        if let Some(r) = stdout {
            self.stdout = r.clone();
        }
        if let Some(r) = stderr {
            self.stderr = r.clone();
        }
        self
    }
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self::inherit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_takes_precedence() {
        let policy = StreamPolicy::piped().overlay(None, Some(&Redirect::Null), None);
        assert!(policy.stdin.is_pipe());
        assert!(matches!(policy.stdout, Redirect::Null));
        assert!(policy.stderr.is_pipe());
    }

    #[test]
    fn test_stream_kind_display() {
        assert_eq!(StreamKind::Stderr.to_string(), "stderr");
    }
}
