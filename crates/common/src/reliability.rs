//! Reliability scoring
//!
//! Reliability is recomputed from the full terminal-run history of a test
//! case every time one of its runs ends. Nothing is accumulated between
//! calls, so the score cannot drift away from the history it summarises.

use crate::types::{RunStatus, TestRun};
use serde::{Deserialize, Serialize};

/// Coefficient applied to the adaptation rate. Tunable, not derived.
pub const DEFAULT_ADAPTATION_PENALTY: f64 = 0.3;

/// Breakdown of a reliability computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    pub total_runs: usize,
    pub completed_runs: usize,
    pub runs_with_adaptations: usize,
    pub success_rate: f64,
    pub adaptation_rate: f64,
    pub reliability: f64,
}

/// Compute reliability over terminal runs.
///
/// Every terminal status counts, cancelled included; runs still pending or
/// running are ignored. An empty history scores 0.
pub fn compute(history: &[TestRun], adaptation_penalty: f64) -> ReliabilityReport {
    let counted: Vec<&TestRun> = history.iter().filter(|r| r.status.is_terminal()).collect();

    let total_runs = counted.len();
    if total_runs == 0 {
        return ReliabilityReport {
            total_runs: 0,
            completed_runs: 0,
            runs_with_adaptations: 0,
            success_rate: 0.0,
            adaptation_rate: 0.0,
            reliability: 0.0,
        };
    }

    let completed_runs = counted
        .iter()
        .filter(|r| r.status == RunStatus::Completed)
        .count();
    let runs_with_adaptations = counted.iter().filter(|r| r.had_adaptations()).count();

    let success_rate = completed_runs as f64 / total_runs as f64;
    let adaptation_rate = runs_with_adaptations as f64 / total_runs as f64;
    let penalty = adaptation_penalty.clamp(0.0, 1.0);

    let reliability = if runs_with_adaptations == 0 {
        success_rate
    } else {
        success_rate * (1.0 - penalty * adaptation_rate)
    };

    ReliabilityReport {
        total_runs,
        completed_runs,
        runs_with_adaptations,
        success_rate,
        adaptation_rate,
        reliability: reliability.clamp(0.0, 1.0),
    }
}
