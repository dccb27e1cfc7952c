//! Lifecycle guard - closes streams and reaps processes on every exit path

use tracing::warn;

use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::process::{ExitStatus, ProcessHandle};

/// Owns a set of processes until they are reaped
///
/// [`ProcessGuard::finish`] closes every stream still held and waits on
/// every process in stage order. If the guard is dropped without being
/// finished (early return, `?`, panic), the same cleanup runs in `Drop`
/// and any errors are logged instead of returned.
#[derive(Debug)]
pub struct ProcessGuard {
    pipeline: Pipeline,
    finished: bool,
}

impl ProcessGuard {
    /// Take ownership of every process in `pipeline`
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            finished: false,
        }
    }

    /// Guarded processes
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Guarded processes, mutably
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Process of stage `index`
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn process_mut(&mut self, index: usize) -> &mut ProcessHandle {
        self.pipeline.process_mut(index)
    }

    /// Close all streams and wait on every process
    ///
    /// Every process is waited on even if an earlier wait fails; the first
    /// failure is returned.
    pub fn finish(mut self) -> Result<Vec<ExitStatus>> {
        self.finished = true;
        reap(&mut self.pipeline)
    }
}

fn reap(pipeline: &mut Pipeline) -> Result<Vec<ExitStatus>> {
    // All streams first: an upstream stage may only exit once its stdin
    // reaches EOF.
    for process in pipeline.processes_mut() {
        process.close_streams();
    }

    let mut statuses = Vec::with_capacity(pipeline.len());
    let mut first_error = None;
    for process in pipeline.processes() {
        match process.wait() {
            Ok(status) => statuses.push(status),
            Err(e) => {
                warn!(pid = %process.pid(), error = %e, "Failed to reap process");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(statuses),
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = reap(&mut self.pipeline) {
            warn!(error = %e, "Suppressed error during process cleanup");
        }
    }
}
