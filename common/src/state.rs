use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::ipc::ProtocolError;

/// Bumped whenever the encoded layout below changes.
pub const STATE_VERSION: u32 = 1;

/// Encoded size of a [`StateSnapshot`]:
/// version, stage, sequence_id, pass, pass_count, pass_id, progress,
/// rate_cur, rate_avg, error (4 bytes each) followed by eta_seconds (8 bytes).
pub const STATE_LEN: usize = 10 * 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Scanning,
    ScanDone,
    Working,
    Paused,
    Searching,
    WorkDone,
    Muxing,
}

impl Stage {
    const fn code(self) -> u32 {
        match self {
            Stage::Idle => 0,
            Stage::Scanning => 1,
            Stage::ScanDone => 2,
            Stage::Working => 3,
            Stage::Paused => 4,
            Stage::Searching => 5,
            Stage::WorkDone => 6,
            Stage::Muxing => 7,
        }
    }

    fn from_code(code: u32) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => Stage::Idle,
            1 => Stage::Scanning,
            2 => Stage::ScanDone,
            3 => Stage::Working,
            4 => Stage::Paused,
            5 => Stage::Searching,
            6 => Stage::WorkDone,
            7 => Stage::Muxing,
            other => return Err(ProtocolError::UnknownStage(other)),
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "Idle",
            Stage::Scanning => "Scanning",
            Stage::ScanDone => "Scan done",
            Stage::Working => "Encoding",
            Stage::Paused => "Paused",
            Stage::Searching => "Searching",
            Stage::WorkDone => "Done",
            Stage::Muxing => "Muxing",
        };
        f.write_str(name)
    }
}

/// Engine progress as reported by a worker. The fields are copied from the
/// engine untouched; `error` in particular is an engine-defined code.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub stage: Stage,
    pub sequence_id: i32,
    pub pass: i32,
    pub pass_count: i32,
    pub pass_id: i32,
    /// Fraction of the current pass, 0.0 to 1.0
    pub progress: f32,
    pub rate_cur: f32,
    pub rate_avg: f32,
    pub eta_seconds: i64,
    pub error: i32,
}

impl StateSnapshot {
    pub fn percent(&self) -> f32 {
        (self.progress * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::WorkDone
    }

    pub fn eta(&self) -> Duration {
        Duration::from_secs(self.eta_seconds.max(0) as u64)
    }

    pub fn to_bytes(&self) -> [u8; STATE_LEN] {
        let mut out = [0u8; STATE_LEN];
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            out[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&STATE_VERSION.to_ne_bytes());
        put(&self.stage.code().to_ne_bytes());
        put(&self.sequence_id.to_ne_bytes());
        put(&self.pass.to_ne_bytes());
        put(&self.pass_count.to_ne_bytes());
        put(&self.pass_id.to_ne_bytes());
        put(&self.progress.to_ne_bytes());
        put(&self.rate_cur.to_ne_bytes());
        put(&self.rate_avg.to_ne_bytes());
        put(&self.error.to_ne_bytes());
        put(&self.eta_seconds.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != STATE_LEN {
            return Err(ProtocolError::FrameSize { expected: STATE_LEN, found: bytes.len() });
        }
        let mut fields = Fields { buf: bytes, pos: 0 };

        let version = u32::from_ne_bytes(fields.take());
        if version != STATE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let stage = Stage::from_code(u32::from_ne_bytes(fields.take()))?;
        let sequence_id = i32::from_ne_bytes(fields.take());
        let pass = i32::from_ne_bytes(fields.take());
        let pass_count = i32::from_ne_bytes(fields.take());
        let pass_id = i32::from_ne_bytes(fields.take());
        let progress = f32::from_ne_bytes(fields.take());
        let rate_cur = f32::from_ne_bytes(fields.take());
        let rate_avg = f32::from_ne_bytes(fields.take());
        let error = i32::from_ne_bytes(fields.take());
        let eta_seconds = i64::from_ne_bytes(fields.take());

        Ok(Self {
            stage,
            sequence_id,
            pass,
            pass_count,
            pass_id,
            progress,
            rate_cur,
            rate_avg,
            eta_seconds,
            error,
        })
    }
}

struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Fields<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Stage::Working | Stage::Paused => {
                let eta = self.eta().as_secs();
                write!(
                    f,
                    "{}: pass {} of {}, {:.2} % ({:.2} fps, avg {:.2} fps, ETA {:02}h{:02}m{:02}s)",
                    self.stage,
                    self.pass,
                    self.pass_count,
                    self.percent(),
                    self.rate_cur,
                    self.rate_avg,
                    eta / 3600,
                    (eta / 60) % 60,
                    eta % 60
                )
            }
            Stage::WorkDone if self.error != 0 => write!(f, "Done (error {})", self.error),
            stage => write!(f, "{}", stage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn working() -> StateSnapshot {
        StateSnapshot {
            stage: Stage::Working,
            sequence_id: 1,
            pass: 2,
            pass_count: 2,
            pass_id: -1,
            progress: 0.425,
            rate_cur: 31.5,
            rate_avg: 30.25,
            eta_seconds: 3725,
            error: 0,
        }
    }

    #[test]
    fn test_encoded_snapshot_is_fixed_size() {
        let state = working();
        let bytes = state.to_bytes();
        assert_eq!(bytes.len(), STATE_LEN);
        assert_eq!(StateSnapshot::from_bytes(&bytes).unwrap(), state);
    }

    #[test]
    fn test_version_is_checked() {
        let mut bytes = working().to_bytes();
        bytes[..4].copy_from_slice(&(STATE_VERSION + 1).to_ne_bytes());
        assert_eq!(
            StateSnapshot::from_bytes(&bytes),
            Err(ProtocolError::UnsupportedVersion(STATE_VERSION + 1))
        );
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let mut bytes = working().to_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_ne_bytes());
        assert_eq!(StateSnapshot::from_bytes(&bytes), Err(ProtocolError::UnknownStage(99)));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let bytes = working().to_bytes();
        assert!(matches!(
            StateSnapshot::from_bytes(&bytes[..STATE_LEN - 1]),
            Err(ProtocolError::FrameSize { .. })
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            working().to_string(),
            "Encoding: pass 2 of 2, 42.50 % (31.50 fps, avg 30.25 fps, ETA 01h02m05s)"
        );
        let canceled = StateSnapshot { stage: Stage::WorkDone, error: 1, ..Default::default() };
        assert_eq!(canceled.to_string(), "Done (error 1)");
        assert_eq!(StateSnapshot::default().to_string(), "Idle");
    }
}
