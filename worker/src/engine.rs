//! Stand-in transcoding engine.
//!
//! The real engine is an external library. This one accepts the same job
//! JSON, walks through its passes in fixed progress steps each time its
//! state is polled, and honours pause, resume and stop, which is all the
//! worker protocol can observe.

use common::{Engine, EngineError, EngineLibrary, JobDescription, Stage, StateSnapshot};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Error code reported after a job was stopped.
pub const ERROR_CANCELED: i32 = 1;

const DEFAULT_STEP: f32 = 0.005;
const FRAMES_PER_PASS: f32 = 1000.0;

pub struct SimulatedLibrary {
    step: f32,
    initialized: bool,
}

impl SimulatedLibrary {
    /// `step` is the fraction of a pass completed per state poll.
    pub fn with_step(step: f32) -> Self {
        Self {
            step: step.clamp(f32::EPSILON, 1.0),
            initialized: false,
        }
    }
}

impl Default for SimulatedLibrary {
    fn default() -> Self {
        Self::with_step(DEFAULT_STEP)
    }
}

impl EngineLibrary for SimulatedLibrary {
    type Handle = SimulatedEngine;

    fn global_init(&mut self) -> Result<(), EngineError> {
        self.initialized = true;
        Ok(())
    }

    fn open(&mut self, verbosity: u8) -> Result<SimulatedEngine, EngineError> {
        if !self.initialized {
            return Err(EngineError::Init("global_init was not called".to_string()));
        }
        log::debug!("Opening simulated engine (verbosity {})", verbosity);
        Ok(SimulatedEngine::new(self.step))
    }

    fn global_close(&mut self) {
        self.initialized = false;
    }
}

pub struct SimulatedEngine {
    step: f32,
    job: Option<SimulatedJob>,
    stage: Stage,
    pass: i32,
    progress: f32,
    error: i32,
    working_since: Option<Instant>,
    worked: Duration,
}

struct SimulatedJob {
    sequence_id: i32,
    pass_count: i32,
}

impl SimulatedJob {
    fn parse(job: &JobDescription) -> Result<Self, EngineError> {
        let value: Value = serde_json::from_str(job.as_str())
            .map_err(|e| EngineError::InvalidJob(e.to_string()))?;
        let job = value
            .get("Job")
            .filter(|job| job.is_object())
            .ok_or_else(|| EngineError::InvalidJob("missing \"Job\" object".to_string()))?;

        let int = |key: &str, default: i32| {
            job.get(key)
                .and_then(Value::as_i64)
                .and_then(|n| i32::try_from(n).ok())
                .unwrap_or(default)
        };
        Ok(Self {
            sequence_id: int("SequenceID", 1),
            pass_count: int("PassCount", 1).max(1),
        })
    }
}

impl SimulatedEngine {
    fn new(step: f32) -> Self {
        Self {
            step,
            job: None,
            stage: Stage::Idle,
            pass: 0,
            progress: 0.0,
            error: 0,
            working_since: None,
            worked: Duration::ZERO,
        }
    }

    fn pass_count(&self) -> i32 {
        self.job.as_ref().map_or(0, |job| job.pass_count)
    }

    fn elapsed(&self) -> Duration {
        self.worked + self.working_since.map_or(Duration::ZERO, |since| since.elapsed())
    }

    fn suspend_clock(&mut self) {
        if let Some(since) = self.working_since.take() {
            self.worked += since.elapsed();
        }
    }

    fn advance(&mut self) {
        self.progress += self.step;
        if self.progress < 1.0 {
            return;
        }
        if self.pass < self.pass_count() {
            self.pass += 1;
            self.progress = 0.0;
        } else {
            self.progress = 1.0;
            self.stage = Stage::WorkDone;
            self.suspend_clock();
        }
    }

    /// Overall fraction done across all passes.
    fn overall(&self) -> f32 {
        let passes = self.pass_count().max(1) as f32;
        ((self.pass - 1).max(0) as f32 + self.progress) / passes
    }
}

impl Engine for SimulatedEngine {
    fn add_job(&mut self, job: &JobDescription) -> Result<(), EngineError> {
        self.job = Some(SimulatedJob::parse(job)?);
        Ok(())
    }

    fn start(&mut self) {
        match self.stage {
            Stage::Idle if self.job.is_some() => {
                self.stage = Stage::Working;
                self.pass = 1;
                self.working_since = Some(Instant::now());
            }
            Stage::Idle => log::warn!("Engine started without a job"),
            Stage::Paused => self.resume(),
            _ => {}
        }
    }

    fn pause(&mut self) {
        if self.stage == Stage::Working {
            self.stage = Stage::Paused;
            self.suspend_clock();
        }
    }

    fn resume(&mut self) {
        if self.stage == Stage::Paused {
            self.stage = Stage::Working;
            self.working_since = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if self.stage != Stage::WorkDone {
            self.stage = Stage::WorkDone;
            self.error = ERROR_CANCELED;
            self.suspend_clock();
        }
    }

    fn state(&mut self) -> StateSnapshot {
        if self.stage == Stage::Working {
            self.advance();
        }

        let elapsed = self.elapsed().as_secs_f32();
        let overall = self.overall();
        let (rate_avg, eta_seconds) = if elapsed > 0.0 && overall > 0.0 {
            let frames = overall * self.pass_count() as f32 * FRAMES_PER_PASS;
            let eta = elapsed * (1.0 - overall) / overall;
            (frames / elapsed, eta as i64)
        } else {
            (0.0, 0)
        };

        StateSnapshot {
            stage: self.stage,
            sequence_id: self.job.as_ref().map_or(0, |job| job.sequence_id),
            pass: self.pass,
            pass_count: self.pass_count(),
            pass_id: self.pass,
            progress: self.progress,
            rate_cur: if self.stage == Stage::Working { rate_avg } else { 0.0 },
            rate_avg,
            eta_seconds,
            error: self.error,
        }
    }

    fn close(self) {
        log::debug!("Simulated engine closed at {:?}", self.stage);
    }
}
