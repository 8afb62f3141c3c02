use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_accept_interval")]
    pub accept_interval_ms: u64,
    #[serde(default = "default_send_wait")]
    pub send_wait_ms: u64,
    #[serde(default = "default_state_interval")]
    pub state_interval_ms: u64,
    /// Number of `--verbose` flags passed to a spawned worker.
    #[serde(default = "default_worker_verbosity")]
    pub worker_verbosity: u8,
}

fn default_socket_path() -> PathBuf { common::paths::socket_path() }
fn default_accept_interval() -> u64 { 100 }
fn default_send_wait() -> u64 { 100 }
fn default_state_interval() -> u64 { 200 }
fn default_worker_verbosity() -> u8 { 1 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            accept_interval_ms: default_accept_interval(),
            send_wait_ms: default_send_wait(),
            state_interval_ms: default_state_interval(),
            worker_verbosity: default_worker_verbosity(),
        }
    }
}

impl ServerConfig {
    pub fn with_socket_path(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..Self::default()
        }
    }

    pub fn accept_interval(&self) -> Duration {
        Duration::from_millis(self.accept_interval_ms.max(1))
    }

    pub fn send_wait(&self) -> Duration {
        Duration::from_millis(self.send_wait_ms)
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.state_interval_ms.max(1))
    }
}
