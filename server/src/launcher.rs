use std::io;
use std::iter;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use common::{SOCKET_ENV, VERBOSE_FLAG, WORKER_FLAG};

pub struct LaunchRequest<'a> {
    pub socket_path: &'a Path,
    pub verbosity: u8,
}

/// A started worker. `child` is absent when the worker does not run as a
/// child process of ours.
pub struct WorkerProcess {
    pub pid: u32,
    pub child: Option<Child>,
}

/// Starts worker processes for the supervisor.
pub trait Launcher {
    fn launch(&mut self, request: &LaunchRequest<'_>) -> io::Result<WorkerProcess>;
}

/// `--worker` followed by one `--verbose` per verbosity level.
pub fn worker_args(verbosity: u8) -> Vec<&'static str> {
    iter::once(WORKER_FLAG)
        .chain(iter::repeat(VERBOSE_FLAG).take(usize::from(verbosity)))
        .collect()
}

/// Re-invokes an executable (by default the running one) in worker mode,
/// sharing our stdout and stderr.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: Some(program.into()) }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, request: &LaunchRequest<'_>) -> io::Result<WorkerProcess> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        let child = Command::new(&program)
            .args(worker_args(request.verbosity))
            .env(SOCKET_ENV, request.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        Ok(WorkerProcess { pid: child.id(), child: Some(child) })
    }
}
