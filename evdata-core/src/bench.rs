//! Timing hooks for engine stages.
//!
//! The engine feeds one sample per timed stage to a [`TimingReporter`].
//! [`Benchmark`] is the bundled reporter: it keeps call counts and total
//! time per stage and logs a summary when reported.

use std::time::Duration;
use tracing::info;

/// Stage names fed to reporters by the engine.
pub mod stage {
    pub const INIT: &str = "init";
    pub const CLEAR: &str = "clear";
    pub const DECODE: &str = "decode";
}

/// Receiver of timing samples.
pub trait TimingReporter: Send {
    /// Records one timed execution of `stage`.
    fn record(&mut self, stage: &'static str, elapsed: Duration);

    /// Finalizes and emits accumulated statistics.
    fn report(&mut self);
}

/// Accumulated timing of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub name: &'static str,
    pub calls: u64,
    pub total: Duration,
}

impl StageTiming {
    /// Mean time per call.
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.calls);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Per-stage call counter and stopwatch.
#[derive(Debug, Clone, Default)]
pub struct Benchmark {
    stages: Vec<StageTiming>,
}

impl Benchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated timings, in first-seen order.
    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageTiming> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Total time over all stages.
    pub fn total(&self) -> Duration {
        self.stages.iter().map(|s| s.total).sum()
    }
}

impl TimingReporter for Benchmark {
    fn record(&mut self, stage: &'static str, elapsed: Duration) {
        match self.stages.iter_mut().find(|s| s.name == stage) {
            Some(timing) => {
                timing.calls += 1;
                timing.total += elapsed;
            }
            None => self.stages.push(StageTiming {
                name: stage,
                calls: 1,
                total: elapsed,
            }),
        }
    }

    fn report(&mut self) {
        for s in &self.stages {
            info!(
                stage = s.name,
                calls = s.calls,
                total_ms = s.total.as_secs_f64() * 1e3,
                mean_us = s.mean().as_secs_f64() * 1e6,
                "benchmark"
            );
        }
        info!(total_ms = self.total().as_secs_f64() * 1e3, "benchmark total");
    }
}
