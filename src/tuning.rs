//! Binary search for the most compressed schedule the system under test
//! can keep up with.
//!
//! A smaller compression ratio replays the workload faster. A probe that
//! passes validation moves the upper bound down to the probed ratio; a
//! failing probe moves the lower bound up. The coarse phase runs bounded
//! probes over the whole domain, the fine phase re-checks the region above
//! the coarse answer with full runs.

use crate::config::TuningConfig;
use crate::observability::{DriverLog, LogLevel};
use crate::validation::ValidationResult;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("probe at ratio {ratio} failed to run: {message}")]
    Probe { ratio: f64, message: String },
    #[error("invalid tuning bounds: {0}")]
    Bounds(String),
}

/// Result of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub passed: bool,
    pub throughput_ops_per_sec: f64,
    pub validation: Option<ValidationResult>,
}

impl ProbeOutcome {
    pub fn new(passed: bool, throughput_ops_per_sec: f64) -> Self {
        Self {
            passed,
            throughput_ops_per_sec,
            validation: None,
        }
    }
}

/// Runs one complete benchmark cycle at a given compression ratio.
pub trait ThroughputProbe {
    /// `bound` limits the probe's duration; `None` runs to completion.
    fn probe(&mut self, ratio: f64, bound: Option<Duration>) -> Result<ProbeOutcome, TuningError>;
}

impl<F> ThroughputProbe for F
where
    F: FnMut(f64, Option<Duration>) -> Result<ProbeOutcome, TuningError>,
{
    fn probe(&mut self, ratio: f64, bound: Option<Duration>) -> Result<ProbeOutcome, TuningError> {
        self(ratio, bound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningPhase {
    Coarse,
    Fine,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRecord {
    pub phase: TuningPhase,
    pub ratio: f64,
    pub lo: f64,
    pub hi: f64,
    pub passed: bool,
    pub throughput_ops_per_sec: f64,
}

/// Controller state; mutated only between probes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TuningState {
    pub current_ratio: f64,
    pub last_good_ratio: Option<f64>,
    pub last_throughput: f64,
    pub lo: f64,
    pub hi: f64,
}

impl TuningState {
    fn new(lo: f64, hi: f64) -> Self {
        Self {
            current_ratio: hi,
            last_good_ratio: None,
            last_throughput: 0.0,
            lo,
            hi,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningReport {
    /// Smallest ratio that passed, `None` when nothing passed.
    pub best_ratio: Option<f64>,
    pub best_throughput_ops_per_sec: f64,
    pub coarse_ratio: Option<f64>,
    pub coarse_iterations: u32,
    pub fine_iterations: u32,
    pub probes: Vec<ProbeRecord>,
}

pub struct AutoTuner {
    config: TuningConfig,
    log: DriverLog,
}

impl AutoTuner {
    pub fn new(config: TuningConfig, log: DriverLog) -> Self {
        Self {
            config,
            log: log.for_module("tuning"),
        }
    }

    pub fn tune(&self, probe: &mut dyn ThroughputProbe) -> Result<TuningReport, TuningError> {
        let cfg = &self.config;
        if !(cfg.ratio_min > 0.0 && cfg.ratio_min < cfg.ratio_max && cfg.ratio_max <= 1.0) {
            return Err(TuningError::Bounds(format!(
                "ratio_min {} / ratio_max {}",
                cfg.ratio_min, cfg.ratio_max
            )));
        }
        let mut probes = Vec::new();

        let bound = Some(Duration::from_millis(cfg.estimate_test_time_ms));
        let mut coarse = TuningState::new(cfg.ratio_min, cfg.ratio_max);
        let coarse_iterations =
            self.search(TuningPhase::Coarse, &mut coarse, bound, probe, &mut probes)?;
        let coarse_ratio = coarse.last_good_ratio;
        self.log.event(
            LogLevel::Info,
            "coarse search finished",
            json!({ "best_ratio": coarse_ratio, "iterations": coarse_iterations }),
        );

        // With no passing coarse probe the fine phase starts from the upper
        // bound the coarse phase converged to.
        let fine_lo = coarse_ratio.unwrap_or(coarse.hi);
        let fine_hi = (fine_lo * cfg.fine_expansion).min(cfg.ratio_max);
        let mut fine = TuningState::new(fine_lo, fine_hi);
        let fine_iterations = self.search(TuningPhase::Fine, &mut fine, None, probe, &mut probes)?;

        let (best_ratio, best_throughput) = match fine.last_good_ratio {
            Some(ratio) => (Some(ratio), fine.last_throughput),
            None => (coarse_ratio, coarse.last_throughput),
        };
        let report = TuningReport {
            best_ratio,
            best_throughput_ops_per_sec: best_throughput,
            coarse_ratio,
            coarse_iterations,
            fine_iterations,
            probes,
        };
        self.log.event(
            LogLevel::Info,
            "tuning finished",
            json!({
                "best_ratio": report.best_ratio,
                "throughput": report.best_throughput_ops_per_sec,
            }),
        );
        Ok(report)
    }

    fn search(
        &self,
        phase: TuningPhase,
        state: &mut TuningState,
        bound: Option<Duration>,
        probe: &mut dyn ThroughputProbe,
        probes: &mut Vec<ProbeRecord>,
    ) -> Result<u32, TuningError> {
        let mut iterations = 0u32;
        while state.hi - state.lo >= self.config.tolerance {
            let mid = (state.lo + state.hi) / 2.0;
            state.current_ratio = mid;
            let outcome = probe.probe(mid, bound)?;
            iterations += 1;
            probes.push(ProbeRecord {
                phase,
                ratio: mid,
                lo: state.lo,
                hi: state.hi,
                passed: outcome.passed,
                throughput_ops_per_sec: outcome.throughput_ops_per_sec,
            });
            self.log.event(
                LogLevel::Info,
                "probe finished",
                json!({
                    "phase": phase,
                    "iteration": iterations,
                    "ratio": mid,
                    "passed": outcome.passed,
                    "throughput": outcome.throughput_ops_per_sec,
                }),
            );
            if outcome.passed {
                state.hi = mid;
                state.last_good_ratio = Some(mid);
                state.last_throughput = outcome.throughput_ops_per_sec;
            } else {
                state.lo = mid;
            }
        }
        // The last probe may have failed; the answer stays at the last
        // ratio known to pass.
        if let Some(good) = state.last_good_ratio {
            state.current_ratio = good;
        }
        Ok(iterations)
    }
}
