//! Error types for process spawning, capture and pipelines

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::redirect::StreamKind;

/// Errors surfaced by spawning, pumping and reaping child processes
#[derive(Debug, Error)]
pub enum PopenError {
    /// The executable could not be located or the OS refused to create the process
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// An output stream reached end-of-stream while input was still unsent
    #[error("Child closed {stream} while input was still pending")]
    PrematureEof { stream: StreamKind },

    /// The child closed its stdin before all input was delivered
    #[error("Broken pipe: {unsent} bytes of input were not delivered")]
    BrokenPipe { unsent: usize },

    /// Waiting on a process identifier that was already reaped
    #[error("Failed to wait for process (PID: {pid}): {source}")]
    ExitWait {
        pid: u32,
        #[source]
        source: Errno,
    },

    /// Delivering a signal failed
    #[error("Failed to signal process (PID: {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },

    /// Invalid command or redirect configuration
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),

    /// Any other I/O failure on a child stream
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PopenError {
    /// Whether this error is the broken-pipe condition on a child's stdin
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            PopenError::BrokenPipe { .. } => true,
            PopenError::Io(e) => e.kind() == io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }
}

impl From<Errno> for PopenError {
    fn from(errno: Errno) -> Self {
        PopenError::Io(io::Error::from(errno))
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, PopenError>;
