//! Framing for the supervisor/worker socket.
//!
//! Every frame is `magic (u32) | length (isize) | payload`, integers in host
//! byte order. Both ends are always the same build on the same host, so no
//! byte-order normalisation is done. The command and response payloads have
//! a fixed size and are framed on that size alone; the length field is only
//! meaningful for job frames.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::fmt;
use std::io::{self, Read, Write};
use std::mem::size_of;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::job::{Command, JobDescription};
use crate::state::{StateSnapshot, STATE_LEN};

pub const JSON_MAGIC: u32 = 0x4842_314A; // HB1J
pub const COMMAND_MAGIC: u32 = 0x4842_3143; // HB1C
pub const RESPONSE_MAGIC: u32 = 0x4842_3152; // HB1R

const MAGIC_LEN: usize = size_of::<u32>();
const LENGTH_LEN: usize = size_of::<isize>();

pub const HEADER_LEN: usize = MAGIC_LEN + LENGTH_LEN;
pub const COMMAND_LEN: usize = HEADER_LEN + size_of::<i32>();
pub const RESPONSE_LEN: usize = HEADER_LEN + STATE_LEN;

/// Upper bound on a job payload, NUL terminator included.
pub const MAX_JOB_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Job,
    Command,
    Response,
}

impl FrameKind {
    pub const fn magic(self) -> u32 {
        match self {
            FrameKind::Job => JSON_MAGIC,
            FrameKind::Command => COMMAND_MAGIC,
            FrameKind::Response => RESPONSE_MAGIC,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            JSON_MAGIC => Some(FrameKind::Job),
            COMMAND_MAGIC => Some(FrameKind::Command),
            RESPONSE_MAGIC => Some(FrameKind::Response),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Job => f.write_str("job"),
            FrameKind::Command => f.write_str("command"),
            FrameKind::Response => f.write_str("response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("incorrect packet header: expected {expected} frame, found magic {found:#010x}")]
    BadMagic { expected: FrameKind, found: u32 },
    #[error("unknown command tag {0}")]
    UnknownCommand(i32),
    #[error("unknown stage code {0}")]
    UnknownStage(u32),
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected frame size: expected {expected} bytes, found {found}")]
    FrameSize { expected: usize, found: usize },
    #[error("invalid job length {0}")]
    InvalidLength(isize),
    #[error("job payload is not NUL-terminated")]
    MissingTerminator,
    #[error("job payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("job payload is not valid JSON: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("socket was not ready to send data")]
    NotReady,
    #[error("send timed out after {written} of {len} bytes")]
    Truncated { written: usize, len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<nix::Error> for ChannelError {
    fn from(errno: nix::Error) -> Self {
        ChannelError::Io(io::Error::from(errno))
    }
}

fn header(kind: FrameKind, payload_len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
    frame.extend_from_slice(&kind.magic().to_ne_bytes());
    frame.extend_from_slice(&(payload_len as isize).to_ne_bytes());
    frame
}

fn read_header(buf: &[u8]) -> (u32, isize) {
    let mut magic = [0u8; MAGIC_LEN];
    magic.copy_from_slice(&buf[..MAGIC_LEN]);
    let mut len = [0u8; LENGTH_LEN];
    len.copy_from_slice(&buf[MAGIC_LEN..HEADER_LEN]);
    (u32::from_ne_bytes(magic), isize::from_ne_bytes(len))
}

fn expect_magic(found: u32, expected: FrameKind) -> Result<(), ProtocolError> {
    if found == expected.magic() {
        Ok(())
    } else {
        Err(ProtocolError::BadMagic { expected, found })
    }
}

/// Job frame: the JSON text followed by a NUL; the length counts the NUL.
pub fn encode_job(job: &JobDescription) -> Vec<u8> {
    let mut frame = header(FrameKind::Job, job.len() + 1);
    frame.extend_from_slice(job.as_str().as_bytes());
    frame.push(0);
    frame
}

pub fn encode_command(command: Command) -> Vec<u8> {
    let mut frame = header(FrameKind::Command, size_of::<i32>());
    frame.extend_from_slice(&command.tag().to_ne_bytes());
    frame
}

pub fn encode_state(state: &StateSnapshot) -> Vec<u8> {
    let mut frame = header(FrameKind::Response, STATE_LEN);
    frame.extend_from_slice(&state.to_bytes());
    frame
}

pub fn decode_command(frame: &[u8]) -> Result<Command, ProtocolError> {
    if frame.len() != COMMAND_LEN {
        return Err(ProtocolError::FrameSize { expected: COMMAND_LEN, found: frame.len() });
    }
    let (magic, _) = read_header(frame);
    expect_magic(magic, FrameKind::Command)?;
    let mut tag = [0u8; size_of::<i32>()];
    tag.copy_from_slice(&frame[HEADER_LEN..]);
    Command::try_from(i32::from_ne_bytes(tag))
}

pub fn decode_state(frame: &[u8]) -> Result<StateSnapshot, ProtocolError> {
    if frame.len() != RESPONSE_LEN {
        return Err(ProtocolError::FrameSize { expected: RESPONSE_LEN, found: frame.len() });
    }
    let (magic, _) = read_header(frame);
    expect_magic(magic, FrameKind::Response)?;
    StateSnapshot::from_bytes(&frame[HEADER_LEN..])
}

fn decode_job_payload(payload: &[u8]) -> Result<JobDescription, ProtocolError> {
    let Some((&0, text)) = payload.split_last() else {
        return Err(ProtocolError::MissingTerminator);
    };
    let text = std::str::from_utf8(text).map_err(|_| ProtocolError::InvalidUtf8)?;
    JobDescription::from_json(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

/// One end of a connected socket plus the bytes received but not yet parsed.
///
/// Reads only happen after a readiness check and writes run against a
/// deadline, so neither can stall the caller's loop.
pub struct Channel {
    stream: UnixStream,
    inbox: Vec<u8>,
    closed: bool,
}

impl Channel {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        Ok(Self {
            stream,
            inbox: Vec::new(),
            closed: false,
        })
    }

    pub fn connect(path: &Path) -> io::Result<Self> {
        Self::new(UnixStream::connect(path)?)
    }

    fn poll_for(&self, events: PollFlags, timeout: Duration) -> Result<bool, ChannelError> {
        let mut fds = [PollFd::new(&self.stream, events)];
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        loop {
            match poll(&mut fds, millis) {
                Ok(0) => return Ok(false),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // A hung-up or failed socket counts as ready: the next read or write
        // reports what happened.
        let ready = events | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(fds[0].revents().map_or(false, |revents| revents.intersects(ready)))
    }

    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, ChannelError> {
        self.poll_for(PollFlags::POLLIN, timeout)
    }

    pub fn wait_writable(&self, timeout: Duration) -> Result<bool, ChannelError> {
        self.poll_for(PollFlags::POLLOUT, timeout)
    }

    pub fn is_writable(&self) -> Result<bool, ChannelError> {
        self.wait_writable(Duration::ZERO)
    }

    /// Moves every byte that can be read right now into the receive buffer.
    /// Returns the number of bytes added. Peer EOF marks the channel closed.
    pub fn fill(&mut self) -> Result<usize, ChannelError> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        while !self.closed && self.wait_readable(Duration::ZERO)? {
            match self.stream.read(&mut chunk) {
                Ok(0) => self.closed = true,
                Ok(n) => {
                    self.inbox.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Writes a whole frame if the socket reports writability right now.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        self.send_within(frame, Duration::ZERO)
    }

    /// Writes a whole frame, spending at most `wait` in total. A frame the
    /// peer does not take in time is cut short and reported as `Truncated`.
    pub fn send_within(&mut self, frame: &[u8], wait: Duration) -> Result<(), ChannelError> {
        let deadline = Instant::now() + wait;
        if !self.wait_writable(wait)? {
            return Err(ChannelError::NotReady);
        }
        self.stream.set_nonblocking(true)?;
        let sent = self.write_until(frame, deadline);
        let restored = self.stream.set_nonblocking(false);
        sent?;
        restored?;
        Ok(())
    }

    fn write_until(&mut self, frame: &[u8], deadline: Instant) -> Result<(), ChannelError> {
        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || !self.wait_writable(remaining)? {
                        return Err(match written {
                            0 => ChannelError::NotReady,
                            _ => ChannelError::Truncated { written, len: frame.len() },
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn take_exact(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.inbox.len() < len {
            return None;
        }
        Some(self.inbox.drain(..len).collect())
    }

    /// Next complete command frame, if one is buffered. A frame that fails
    /// validation is still consumed.
    pub fn take_command(&mut self) -> Option<Result<Command, ProtocolError>> {
        self.take_exact(COMMAND_LEN).map(|frame| decode_command(&frame))
    }

    pub fn take_state(&mut self) -> Option<Result<StateSnapshot, ProtocolError>> {
        self.take_exact(RESPONSE_LEN).map(|frame| decode_state(&frame))
    }

    /// Next job frame, once all of its payload has arrived. A bad header
    /// leaves nothing trustworthy in the buffer, so it is cleared.
    pub fn take_job(&mut self) -> Option<Result<JobDescription, ProtocolError>> {
        if self.inbox.len() < HEADER_LEN {
            return None;
        }
        let (magic, len) = read_header(&self.inbox);
        if let Err(e) = expect_magic(magic, FrameKind::Job) {
            self.inbox.clear();
            return Some(Err(e));
        }
        let payload_len = match usize::try_from(len) {
            Ok(n) if n > 0 && n <= MAX_JOB_LEN => n,
            _ => {
                self.inbox.clear();
                return Some(Err(ProtocolError::InvalidLength(len)));
            }
        };
        let frame = self.take_exact(HEADER_LEN + payload_len)?;
        Some(decode_job_payload(&frame[HEADER_LEN..]))
    }

    pub fn buffered(&self) -> usize {
        self.inbox.len()
    }

    /// Drops whatever is left in the receive buffer, returning its size.
    pub fn discard_buffered(&mut self) -> usize {
        let len = self.inbox.len();
        self.inbox.clear();
        len
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn shutdown(&mut self) -> io::Result<()> {
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
