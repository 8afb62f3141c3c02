pub mod engine;
pub mod ipc;
pub mod job;
pub mod paths;
pub mod state;

pub use engine::{Engine, EngineError, EngineLibrary};
pub use ipc::{Channel, ChannelError, FrameKind, ProtocolError};
pub use job::{Command, JobDescription};
pub use state::{Stage, StateSnapshot};

// Process invocation. The worker flag must be the first argument.
pub const WORKER_FLAG: &str = "--worker";
pub const VERBOSE_FLAG: &str = "--verbose";
pub const WORKER_PROCESS_NAME: &str = "transcoder-work";

// Rendezvous socket
pub const SOCKET_NAME: &str = "transcoder.socket";
pub const SOCKET_ENV: &str = "TRANSCODER_SOCKET";
