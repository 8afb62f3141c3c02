//! The isolated encode process.
//!
//! A worker is the host executable re-invoked with `--worker`. It connects
//! back to the supervisor's socket, waits for exactly one job, drives the
//! engine and streams its state until the job completes, a stop command
//! arrives, or the supervisor goes away.

pub mod engine;

use common::ipc;
use common::{Channel, Command, Engine, EngineError, EngineLibrary, JobDescription, StateSnapshot};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};

pub use engine::{SimulatedEngine, SimulatedLibrary};

/// Upper bound on delivering the last report before the worker exits.
const FINAL_SEND_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
    #[serde(default = "default_comm_interval")]
    pub comm_interval_ms: u64,
    #[serde(default = "default_job_wait")]
    pub job_wait_ms: u64,
}

fn default_status_interval() -> u64 { 100 }
fn default_comm_interval() -> u64 { 100 }
fn default_job_wait() -> u64 { 1000 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: default_status_interval(),
            comm_interval_ms: default_comm_interval(),
            job_wait_ms: default_job_wait(),
        }
    }
}

impl WorkerConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }

    pub fn comm_interval(&self) -> Duration {
        Duration::from_millis(self.comm_interval_ms.max(1))
    }

    pub fn job_wait(&self) -> Duration {
        Duration::from_millis(self.job_wait_ms)
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("could not build event loop: {0}")]
    Runtime(#[source] std::io::Error),
}

/// How a worker run ended. Every variant is a clean exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No usable job arrived; the engine never started.
    NoJob,
    /// The engine rejected the job.
    Rejected,
    Completed,
    Stopped,
    /// The supervisor closed the connection.
    Disconnected,
    /// A state report could not be delivered.
    SendFailed,
}

pub struct Worker<L: EngineLibrary> {
    channel: Option<Channel>,
    library: L,
    engine: Option<L::Handle>,
    globally_initialized: bool,
    state: StateSnapshot,
}

impl<L: EngineLibrary> Worker<L> {
    /// Connects to the supervisor, then brings up the engine. Nothing of the
    /// engine is touched if the connection fails.
    pub fn connect(path: &Path, mut library: L, verbosity: u8) -> Result<Self, WorkerError> {
        let channel = Channel::connect(path).map_err(|source| WorkerError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Connected to {}", path.display());

        library.global_init()?;
        let engine = match library.open(verbosity) {
            Ok(engine) => engine,
            Err(e) => {
                library.global_close();
                return Err(e.into());
            }
        };

        Ok(Self {
            channel: Some(channel),
            library,
            engine: Some(engine),
            globally_initialized: true,
            state: StateSnapshot::default(),
        })
    }

    pub fn last_state(&self) -> &StateSnapshot {
        &self.state
    }

    /// Blocks for at most `wait` for the job frame.
    pub fn receive_job(&mut self, wait: Duration) -> Option<JobDescription> {
        let channel = self.channel.as_mut()?;
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match channel.wait_readable(remaining) {
                Ok(true) => {}
                Ok(false) if channel.buffered() == 0 => {
                    log::info!("no data received");
                    return None;
                }
                Ok(false) => {
                    log::warn!("Job frame incomplete after {:?} ({} bytes)", wait, channel.buffered());
                    return None;
                }
                Err(e) => {
                    log::warn!("Socket not readable: {}", e);
                    return None;
                }
            }

            match channel.fill() {
                Ok(n) => log::debug!("Reading data from socket ({} bytes)", n),
                Err(e) => {
                    log::warn!("Socket read error: {}", e);
                    return None;
                }
            }

            match channel.take_job() {
                Some(Ok(job)) => {
                    log::debug!("Data received ({} bytes)", job.len() + 1);
                    if channel.buffered() > 0 {
                        log::debug!("{} bytes queued behind the job", channel.buffered());
                    }
                    return Some(job);
                }
                Some(Err(e)) => {
                    log::warn!("Receive data failed: {}", e);
                    return None;
                }
                None if channel.is_closed() => {
                    log::info!("Supervisor closed the connection before sending a job");
                    return None;
                }
                None => continue,
            }
        }
    }

    /// Hands the job to the engine and starts encoding.
    pub fn begin(&mut self, job: &JobDescription) -> Result<(), EngineError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(EngineError::Init("engine is closed".to_string()));
        };
        engine.add_job(job)?;
        log::info!("Starting job");
        engine.start();
        Ok(())
    }

    /// Polls the engine and ends the loop once it reports completion.
    /// The completed state is reported here before the loop ends, since the
    /// communication tick never runs again.
    pub fn status_tick(&mut self) -> ControlFlow<Outcome> {
        let (Some(channel), Some(engine)) = (self.channel.as_mut(), self.engine.as_mut()) else {
            return ControlFlow::Break(Outcome::Disconnected);
        };
        if channel.is_closed() {
            return ControlFlow::Break(Outcome::Disconnected);
        }

        self.state = engine.state();
        if !self.state.is_done() {
            return ControlFlow::Continue(());
        }
        if let Err(e) = channel.send_within(&ipc::encode_state(&self.state), FINAL_SEND_WAIT) {
            log::warn!("Could not send final state: {}", e);
            return ControlFlow::Break(Outcome::SendFailed);
        }
        ControlFlow::Break(Outcome::Completed)
    }

    /// Applies queued commands, then reports the resulting state.
    pub fn communication_tick(&mut self) -> ControlFlow<Outcome> {
        let (Some(channel), Some(engine)) = (self.channel.as_mut(), self.engine.as_mut()) else {
            return ControlFlow::Break(Outcome::Disconnected);
        };

        let mut stopped = false;
        for command in receive_commands(channel) {
            log::debug!("Received command {}", command);
            match command {
                Command::Stop => {
                    engine.stop();
                    stopped = true;
                    break;
                }
                Command::Pause => engine.pause(),
                Command::Resume => engine.resume(),
                Command::Start => {
                    log::info!("Starting job");
                    engine.start();
                }
                Command::None => {}
            }
        }

        if channel.is_closed() && !stopped {
            log::info!("Supervisor closed the connection, stopping job");
            engine.stop();
            self.state = engine.state();
            return ControlFlow::Break(Outcome::Disconnected);
        }

        self.state = engine.state();
        if let Err(e) = channel.send(&ipc::encode_state(&self.state)) {
            log::warn!("Could not send state: {}", e);
            engine.stop();
            return ControlFlow::Break(Outcome::SendFailed);
        }

        if stopped {
            ControlFlow::Break(Outcome::Stopped)
        } else if self.state.is_done() {
            ControlFlow::Break(Outcome::Completed)
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Runs the status and communication ticks on their own intervals until
    /// one of them ends the loop. Both share the caller's thread, so they
    /// never overlap.
    pub async fn run_loop(&mut self, config: &WorkerConfig) -> Outcome {
        let mut status = time::interval(config.status_interval());
        let mut communicate = time::interval(config.comm_interval());
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        communicate.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                _ = status.tick() => self.status_tick(),
                _ = communicate.tick() => self.communication_tick(),
            };
            if let ControlFlow::Break(outcome) = flow {
                return outcome;
            }
        }
    }

    /// Closes the socket and the engine. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.shutdown() {
                log::debug!("Socket shutdown failed: {}", e);
            }
        }
        if let Some(engine) = self.engine.take() {
            engine.close();
        }
        if self.globally_initialized {
            self.library.global_close();
            self.globally_initialized = false;
        }
    }
}

impl<L: EngineLibrary> Drop for Worker<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_commands(channel: &mut Channel) -> Vec<Command> {
    if let Err(e) = channel.fill() {
        log::warn!("Command receive error: {}", e);
        return Vec::new();
    }
    let mut commands = Vec::new();
    while let Some(frame) = channel.take_command() {
        match frame {
            Ok(Command::None) => {}
            Ok(command) => commands.push(command),
            Err(e) => log::warn!("Receive command failed: {}", e),
        }
    }
    commands
}

/// One complete worker lifetime against the socket at `path`. Only a failure
/// to connect or to bring up the engine is an error.
pub fn run<L: EngineLibrary>(
    path: &Path,
    config: &WorkerConfig,
    library: L,
    verbosity: u8,
) -> Result<Outcome, WorkerError> {
    let mut worker = Worker::connect(path, library, verbosity)?;

    log::info!("Waiting for job...");
    let Some(job) = worker.receive_job(config.job_wait()) else {
        log::info!("No JSON data received, shutting down");
        worker.shutdown();
        return Ok(Outcome::NoJob);
    };

    if let Err(e) = worker.begin(&job) {
        log::error!("Could not start job: {}", e);
        worker.shutdown();
        return Ok(Outcome::Rejected);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(WorkerError::Runtime)?;
    let outcome = runtime.block_on(worker.run_loop(config));
    log::info!("Job finished ({:?}), shutting down", outcome);

    worker.shutdown();
    Ok(outcome)
}

/// Entry point of the worker process.
pub fn worker_main(config: &WorkerConfig, verbosity: u8) -> ExitCode {
    set_process_name(common::WORKER_PROCESS_NAME);

    let path = common::paths::socket_path();
    match run(&path, config, SimulatedLibrary::default(), verbosity) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Initialization failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Name shown by process viewers such as top. At most 15 bytes on Linux.
#[cfg(target_os = "linux")]
fn set_process_name(name: &str) {
    match std::ffi::CString::new(name) {
        Ok(name) => {
            if let Err(e) = nix::sys::prctl::set_name(&name) {
                log::debug!("Could not set process name: {}", e);
            }
        }
        Err(e) => log::debug!("Invalid process name: {}", e),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_name(_name: &str) {}
