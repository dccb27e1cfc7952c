//! # ricecoder-popen
//!
//! **Purpose**: Child process spawning with full control over stdin, stdout and stderr
//!
//! Provides popen-style spawning, in-memory capture of a child's output while
//! feeding it input, and pipelines of processes connected through OS pipes.
//!
//! ## Features
//!
//! - **Spawning**: Per-stream wiring (pipe, inherit, null, file, descriptor, merge)
//! - **Capture**: Feed input and collect stdout/stderr without deadlocking
//! - **Stream Pump**: Single-threaded `poll(2)` multiplexing of one child's streams
//! - **Pipelines**: `a | b | c` wired at the OS level, outer ends optionally exposed
//! - **Exit Status**: Reaped exactly once, cached, safe to query from several places
//! - **Cleanup**: Scoped forms close every stream and reap every child on all exit paths
//! - **Cancellation**: Signal a child from another thread while its owner is blocked
//!
//! Unix only. No call imposes a timeout; wrap calls with your own deadline
//! and use [`ProcessKiller`] to cancel.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ricecoder_popen::{capture2, pipeline_r, CaptureOptions, Command};
//! use std::io::Read;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Capture output while feeding input
//! let out = capture2(&Command::new("sort"), &CaptureOptions::new().stdin_data("b\na\n"))?;
//! assert_eq!(out.stdout_str(), "a\nb\n");
//!
//! // Read the end of a pipeline
//! let mut pipeline = pipeline_r(&[Command::shell("ls"), Command::new("wc").arg("-l")])?;
//! let mut count = String::new();
//! pipeline.take_stdout().unwrap().read_to_string(&mut count)?;
//! pipeline.wait_all()?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod guard;
pub mod manager;
pub mod pipeline;
pub mod process;
pub mod pump;
pub mod redirect;
pub mod spawn;
pub mod stream;

pub use capture::{
    capture2, capture2e, capture3, popen2, popen2_with, popen2e, popen2e_with, popen3,
    popen3_with, Captured,
};
pub use config::{CaptureOptions, Command, Program};
pub use error::{PopenError, Result};
pub use guard::ProcessGuard;
pub use manager::ProcessManager;
pub use nix::sys::signal::Signal;
pub use pipeline::{
    pipeline, pipeline_r, pipeline_r_with, pipeline_rw, pipeline_rw_with, pipeline_start,
    pipeline_start_with, pipeline_w, pipeline_w_with, Pipeline,
};
pub use process::{ExitStatus, ProcessHandle, ProcessKiller};
pub use pump::{PumpReport, StreamPump};
pub use redirect::{Redirect, StreamKind, StreamPolicy};
pub use spawn::spawn;
pub use stream::{PipeReader, PipeWriter};
