use thiserror::Error;

use crate::job::JobDescription;
use crate::state::StateSnapshot;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Init(String),
    #[error("job rejected: {0}")]
    InvalidJob(String),
}

/// Process-wide entry points of a transcoding engine.
///
/// `global_init` runs once before any handle is opened and `global_close`
/// once after the last handle is closed.
pub trait EngineLibrary {
    type Handle: Engine;

    fn global_init(&mut self) -> Result<(), EngineError>;
    fn open(&mut self, verbosity: u8) -> Result<Self::Handle, EngineError>;
    fn global_close(&mut self);
}

/// One engine instance running a single job.
pub trait Engine {
    fn add_job(&mut self, job: &JobDescription) -> Result<(), EngineError>;
    fn start(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    /// Cancels the running job. The engine reports `WorkDone` afterwards.
    fn stop(&mut self);
    fn state(&mut self) -> StateSnapshot;
    fn close(self);
}
