//! Supervisor side of the worker protocol.
//!
//! The supervisor owns the rendezvous socket. It spawns a worker, hands it
//! the pending job as soon as the worker connects, forwards pause, resume
//! and stop commands, and keeps the last state the worker reported. None of
//! its operations block for longer than the configured send wait, and no
//! failure talking to a worker is fatal to the host.

pub mod config;
pub mod launcher;

use common::ipc;
use common::{Channel, ChannelError, Command, JobDescription, StateSnapshot};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::time::Duration;
use thiserror::Error;

pub use config::ServerConfig;
pub use launcher::{LaunchRequest, Launcher, ProcessLauncher, WorkerProcess};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not listen on {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("server socket is not listening")]
    NotListening,
    #[error("could not start worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker {0} is still running")]
    Busy(u32),
    #[error("no worker with pid {0}")]
    UnknownWorker(u32),
    #[error("worker {0} has not connected yet")]
    NotConnected(u32),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Supervisor-side record of the one worker.
struct WorkerHandle {
    pid: u32,
    child: Option<Child>,
    channel: Option<Channel>,
    state: Option<StateSnapshot>,
    hangup_logged: bool,
}

impl WorkerHandle {
    fn new(process: WorkerProcess) -> Self {
        Self {
            pid: process.pid,
            child: process.child,
            channel: None,
            state: None,
            hangup_logged: false,
        }
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Could not query worker {}: {}", self.pid, e);
                None
            }
        }
    }

    fn has_finished(&mut self) -> bool {
        self.exit_status().is_some() || self.channel.as_ref().map_or(false, Channel::is_closed)
    }

    fn release(mut self) {
        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.shutdown() {
                log::debug!("Worker {} socket shutdown failed: {}", self.pid, e);
            }
        }
        // Reap the child if it is already gone; a live one exits on its own
        // once it sees the closed socket.
        self.exit_status();
    }
}

pub struct Supervisor<L: Launcher = ProcessLauncher> {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    worker: Option<WorkerHandle>,
    pending_job: Option<JobDescription>,
    launcher: L,
    send_wait: Duration,
    verbosity: u8,
}

impl Supervisor<ProcessLauncher> {
    /// Binds the socket and spawns workers by re-running this executable.
    pub fn init(config: &ServerConfig) -> Result<Self, ServerError> {
        Self::with_launcher(config, ProcessLauncher::new())
    }
}

impl<L: Launcher> Supervisor<L> {
    /// Binds a fresh listening socket at the configured path, replacing any
    /// stale socket file left by an earlier run.
    pub fn with_launcher(config: &ServerConfig, launcher: L) -> Result<Self, ServerError> {
        let path = config.socket_path.clone();
        remove_socket_file(&path);
        log::debug!("Opening local socket {}", path.display());

        let listener = UnixListener::bind(&path).map_err(|source| {
            log::error!("Could not listen on {}: {}", path.display(), source);
            ServerError::Bind { path: path.clone(), source }
        })?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(Self {
            socket_path: path,
            listener: Some(listener),
            worker: None,
            pending_job: None,
            launcher,
            send_wait: config.send_wait(),
            verbosity: config.worker_verbosity,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|worker| worker.pid)
    }

    pub fn is_connected(&self, pid: u32) -> bool {
        self.worker
            .as_ref()
            .filter(|worker| worker.pid == pid)
            .and_then(|worker| worker.channel.as_ref())
            .map_or(false, |channel| !channel.is_closed())
    }

    /// Accept tick. Takes at most one pending connection and sends it the
    /// cached job. Returns whether a worker was attached.
    pub fn accept_pending(&mut self) -> bool {
        let Some(listener) = &self.listener else {
            return false;
        };
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                log::warn!("Could not accept connection: {}", e);
                return false;
            }
        };

        let Some(worker) = self.worker.as_mut().filter(|worker| worker.channel.is_none()) else {
            log::warn!("Dropping connection: no worker is waiting for a job");
            return false;
        };
        let Some(job) = self.pending_job.take() else {
            log::warn!("Dropping connection from worker {}: no pending job", worker.pid);
            return false;
        };
        let mut channel = match Channel::new(stream) {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("Could not set up worker connection: {}", e);
                return false;
            }
        };

        log::debug!("Accepted connection from worker {}", worker.pid);
        match channel.send_within(&ipc::encode_job(&job), self.send_wait) {
            Ok(()) => log::debug!("Sent JSON ({} bytes)", job.len() + 1),
            Err(e) => log::warn!("Could not send JSON to worker {}: {}", worker.pid, e),
        }
        worker.channel = Some(channel);
        true
    }

    /// Caches the job for the worker's connection, then starts the worker.
    /// Returns the worker's pid.
    pub fn start_worker(&mut self, job: &JobDescription) -> Result<u32, ServerError> {
        if self.listener.is_none() {
            return Err(ServerError::NotListening);
        }
        if let Some(worker) = self.worker.as_mut() {
            if !worker.has_finished() {
                return Err(ServerError::Busy(worker.pid));
            }
        }
        if let Some(previous) = self.worker.take() {
            previous.release();
        }

        self.pending_job = Some(job.clone());
        let request = LaunchRequest {
            socket_path: &self.socket_path,
            verbosity: self.verbosity,
        };
        let process = match self.launcher.launch(&request) {
            Ok(process) => process,
            Err(e) => {
                log::error!("Could not start worker: {}", e);
                self.pending_job = None;
                return Err(ServerError::Spawn(e));
            }
        };

        let pid = process.pid;
        log::info!("Started worker with pid {}", pid);
        self.worker = Some(WorkerHandle::new(process));
        Ok(pid)
    }

    fn channel_mut(&mut self, pid: u32) -> Result<&mut Channel, ServerError> {
        let worker = self
            .worker
            .as_mut()
            .filter(|worker| worker.pid == pid)
            .ok_or(ServerError::UnknownWorker(pid))?;
        worker.channel.as_mut().ok_or(ServerError::NotConnected(pid))
    }

    /// Writes a command frame if the socket is writable right now. A command
    /// that cannot be written is dropped, not queued.
    fn send_command(&mut self, pid: u32, command: Command) -> Result<(), ServerError> {
        let channel = self.channel_mut(pid)?;
        log::debug!("sending command {}...", command);
        channel.send(&ipc::encode_command(command)).map_err(|e| {
            log::warn!("Could not send command {} to worker {}: {}", command, pid, e);
            ServerError::from(e)
        })
    }

    pub fn pause_job(&mut self, pid: u32) -> Result<(), ServerError> {
        self.send_command(pid, Command::Pause)
    }

    pub fn resume_job(&mut self, pid: u32) -> Result<(), ServerError> {
        self.send_command(pid, Command::Resume)
    }

    pub fn stop_job(&mut self, pid: u32) -> Result<(), ServerError> {
        self.send_command(pid, Command::Stop)
    }

    /// Drains every state report buffered on the worker's socket and returns
    /// the newest one, or the last one seen before. `None` until a worker
    /// has connected.
    pub fn worker_state(&mut self, pid: u32) -> Option<StateSnapshot> {
        self.listener.as_ref()?;
        let worker = self.worker.as_mut().filter(|worker| worker.pid == pid)?;
        let channel = worker.channel.as_mut()?;

        if let Err(e) = channel.fill() {
            log::warn!("Could not get response: {}", e);
        }
        let mut received = 0;
        while let Some(frame) = channel.take_state() {
            match frame {
                Ok(state) => {
                    worker.state = Some(state);
                    received += 1;
                }
                Err(e) => log::warn!("Discarding response from worker {}: {}", pid, e),
            }
        }
        if received > 0 {
            log::trace!("Got {} state reports from worker {}", received, pid);
        }

        let leftover = channel.discard_buffered();
        if leftover > 0 {
            log::warn!("Clearing unread data ({} bytes)", leftover);
        }
        if channel.is_closed() && !worker.hangup_logged {
            log::info!("Worker {} closed its connection", pid);
            worker.hangup_logged = true;
        }

        Some(worker.state.unwrap_or_default())
    }

    /// Reaps the worker process if it has exited, without blocking.
    pub fn worker_exit_status(&mut self, pid: u32) -> Option<ExitStatus> {
        self.worker
            .as_mut()
            .filter(|worker| worker.pid == pid)?
            .exit_status()
    }

    /// Closes the listening socket and any worker connection and removes
    /// the socket file. Safe to call repeatedly, with or without a worker.
    pub fn shutdown(&mut self) {
        if self.listener.is_none() && self.worker.is_none() {
            return;
        }
        log::debug!("Shutting down socket");
        self.listener = None;
        self.pending_job = None;
        if let Some(worker) = self.worker.take() {
            worker.release();
        }
        remove_socket_file(&self.socket_path);
    }
}

impl<L: Launcher> Drop for Supervisor<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ipc::{decode_command, encode_state, COMMAND_LEN, HEADER_LEN};
    use common::Stage;
    use std::io::{Read, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Instant;
    use tempfile::TempDir;
    use transcoder_worker::{engine::ERROR_CANCELED, Outcome, SimulatedLibrary, WorkerConfig, WorkerError};

    const FAKE_PID: u32 = 4242;

    /// Hands out a pid without starting anything; the test plays the worker.
    struct FakeLauncher;

    impl Launcher for FakeLauncher {
        fn launch(&mut self, _request: &LaunchRequest<'_>) -> io::Result<WorkerProcess> {
            Ok(WorkerProcess { pid: FAKE_PID, child: None })
        }
    }

    type WorkerThreads = Arc<Mutex<Vec<JoinHandle<Result<Outcome, WorkerError>>>>>;

    /// Runs a real worker with the simulated engine on a thread.
    struct ThreadLauncher {
        config: WorkerConfig,
        threads: WorkerThreads,
        next_pid: u32,
    }

    impl Launcher for ThreadLauncher {
        fn launch(&mut self, request: &LaunchRequest<'_>) -> io::Result<WorkerProcess> {
            let path = request.socket_path.to_path_buf();
            let config = self.config.clone();
            let verbosity = request.verbosity;
            let handle = thread::spawn(move || {
                transcoder_worker::run(&path, &config, SimulatedLibrary::with_step(0.001), verbosity)
            });
            self.threads.lock().unwrap().push(handle);
            self.next_pid += 1;
            Ok(WorkerProcess { pid: self.next_pid, child: None })
        }
    }

    fn socket_config(dir: &TempDir) -> ServerConfig {
        ServerConfig::with_socket_path(dir.path().join("test.socket"))
    }

    fn job() -> JobDescription {
        JobDescription::from_value(&serde_json::json!({ "Job": { "SequenceID": 1 } }))
    }

    fn state(progress: f32) -> StateSnapshot {
        StateSnapshot { stage: Stage::Working, pass: 1, pass_count: 1, progress, ..Default::default() }
    }

    fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Starts a fake worker and returns the supervisor plus the worker's end
    /// of the connection, with the job frame already read off it.
    fn connected(dir: &TempDir) -> (Supervisor<FakeLauncher>, UnixStream) {
        let config = socket_config(dir);
        let mut supervisor = Supervisor::with_launcher(&config, FakeLauncher).unwrap();
        assert_eq!(supervisor.start_worker(&job()).unwrap(), FAKE_PID);

        let mut peer = UnixStream::connect(&config.socket_path).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        eventually(|| supervisor.accept_pending());

        let expected = ipc::encode_job(&job());
        let mut frame = vec![0u8; expected.len()];
        peer.read_exact(&mut frame).unwrap();
        assert_eq!(frame, expected);
        (supervisor, peer)
    }

    #[test]
    fn test_init_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        fs::write(&config.socket_path, b"stale").unwrap();

        let supervisor = Supervisor::init(&config).unwrap();
        assert!(supervisor.is_listening());
        let mode = fs::metadata(&config.socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_init_fails_without_directory() {
        let config = ServerConfig::with_socket_path("/nonexistent/dir/test.socket");
        assert!(matches!(Supervisor::init(&config), Err(ServerError::Bind { .. })));
    }

    #[test]
    fn test_shutdown_without_worker() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let mut supervisor = Supervisor::init(&config).unwrap();

        assert!(!supervisor.accept_pending());
        assert_eq!(supervisor.worker_state(0), None);
        supervisor.shutdown();
        supervisor.shutdown();
        assert!(!supervisor.is_listening());
        assert!(!config.socket_path.exists());
    }

    #[test]
    fn test_spawn_failure_leaves_no_worker() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let launcher = ProcessLauncher::with_program("/nonexistent/transcoder");
        let mut supervisor = Supervisor::with_launcher(&config, launcher).unwrap();

        assert!(matches!(supervisor.start_worker(&job()), Err(ServerError::Spawn(_))));
        assert_eq!(supervisor.worker_pid(), None);

        // A stray connection finds nobody to hand a job to.
        let _stray = UnixStream::connect(&config.socket_path).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!supervisor.accept_pending());
        assert_eq!(supervisor.worker_state(0), None);
    }

    #[test]
    fn test_job_is_sent_once_on_accept() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _peer) = connected(&dir);
        assert!(supervisor.is_connected(FAKE_PID));

        let _second = UnixStream::connect(supervisor.socket_path()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!supervisor.accept_pending());
    }

    #[test]
    fn test_accept_with_stalled_worker_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let mut supervisor = Supervisor::with_launcher(&config, FakeLauncher).unwrap();
        let padding = "x".repeat(4 * 1024 * 1024);
        let big = JobDescription::from_value(&serde_json::json!({ "Job": { "SequenceID": 1 }, "Padding": padding }));
        supervisor.start_worker(&big).unwrap();

        // Connects but never reads its job.
        let _peer = UnixStream::connect(&config.socket_path).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(supervisor.accept_pending());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(supervisor.is_connected(FAKE_PID));
    }

    #[test]
    fn test_commands_reach_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, mut peer) = connected(&dir);

        supervisor.pause_job(FAKE_PID).unwrap();
        supervisor.resume_job(FAKE_PID).unwrap();
        supervisor.stop_job(FAKE_PID).unwrap();
        for expected in [Command::Pause, Command::Resume, Command::Stop] {
            let mut frame = [0u8; COMMAND_LEN];
            peer.read_exact(&mut frame).unwrap();
            assert_eq!(decode_command(&frame), Ok(expected));
        }

        assert!(matches!(supervisor.pause_job(FAKE_PID + 1), Err(ServerError::UnknownWorker(_))));
    }

    #[test]
    fn test_command_before_connect_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::with_launcher(&socket_config(&dir), FakeLauncher).unwrap();
        let pid = supervisor.start_worker(&job()).unwrap();
        assert!(matches!(supervisor.stop_job(pid), Err(ServerError::NotConnected(_))));
        assert_eq!(supervisor.worker_state(pid), None);
    }

    #[test]
    fn test_second_worker_is_refused_while_first_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _peer) = connected(&dir);
        assert!(matches!(supervisor.start_worker(&job()), Err(ServerError::Busy(FAKE_PID))));
    }

    #[test]
    fn test_state_drain_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, mut peer) = connected(&dir);

        assert_eq!(supervisor.worker_state(FAKE_PID), Some(StateSnapshot::default()));

        let mut burst = Vec::new();
        for progress in [0.1, 0.2, 0.3] {
            burst.extend(encode_state(&state(progress)));
        }
        // A response-sized frame with a foreign magic, then a torn tail.
        let mut bogus = encode_state(&state(0.9));
        bogus[..4].copy_from_slice(&ipc::JSON_MAGIC.to_ne_bytes());
        burst.extend(bogus);
        burst.extend(&encode_state(&state(0.95))[..HEADER_LEN + 3]);
        peer.write_all(&burst).unwrap();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(supervisor.worker_state(FAKE_PID), Some(state(0.3)));
        // Nothing left over: the next report parses cleanly on its own.
        assert_eq!(supervisor.worker_state(FAKE_PID), Some(state(0.3)));
        peer.write_all(&encode_state(&state(0.4))).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(supervisor.worker_state(FAKE_PID), Some(state(0.4)));
    }

    #[test]
    fn test_last_state_survives_worker_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, mut peer) = connected(&dir);
        peer.write_all(&encode_state(&state(0.5))).unwrap();
        drop(peer);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(supervisor.worker_state(FAKE_PID), Some(state(0.5)));
        assert_eq!(supervisor.worker_state(FAKE_PID), Some(state(0.5)));
        assert!(!supervisor.is_connected(FAKE_PID));

        // A finished worker makes room for the next one.
        assert!(supervisor.start_worker(&job()).is_ok());
    }

    #[test]
    fn test_end_to_end_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let threads = WorkerThreads::default();
        let launcher = ThreadLauncher {
            config: WorkerConfig { status_interval_ms: 10, comm_interval_ms: 10, job_wait_ms: 1000 },
            threads: threads.clone(),
            next_pid: 100,
        };
        let mut supervisor = Supervisor::with_launcher(&config, launcher).unwrap();

        let pid = supervisor.start_worker(&job()).unwrap();
        eventually(|| supervisor.accept_pending());
        eventually(|| supervisor.worker_state(pid).map_or(false, |state| state.stage == Stage::Working));

        supervisor.stop_job(pid).unwrap();
        let handle = threads.lock().unwrap().pop().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Outcome::Stopped);

        let last = supervisor.worker_state(pid).unwrap();
        assert_eq!(last.stage, Stage::WorkDone);
        assert_eq!(last.error, ERROR_CANCELED);
        assert_eq!(supervisor.worker_state(pid), Some(last));

        supervisor.shutdown();
        assert_eq!(supervisor.worker_state(pid), None);
        assert!(!config.socket_path.exists());
    }

    #[test]
    fn test_end_to_end_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let threads = WorkerThreads::default();
        let launcher = ThreadLauncher {
            config: WorkerConfig { job_wait_ms: 100, ..Default::default() },
            threads: threads.clone(),
            next_pid: 200,
        };
        let mut supervisor = Supervisor::with_launcher(&config, launcher).unwrap();

        // The accept tick never runs, so the job is never sent.
        supervisor.start_worker(&job()).unwrap();
        let handle = threads.lock().unwrap().pop().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Outcome::NoJob);
    }
}
