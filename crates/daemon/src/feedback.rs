//! Reliability feedback
//!
//! Recomputes a test case's reliability from its whole terminal-run history
//! and writes the score back to the test case record.

use adaptest_common::reliability::{self, ReliabilityReport};
use adaptest_common::{Result, RunStore};
use std::sync::Arc;
use tracing::info;

/// Folds terminal runs back into per-test-case reliability
#[derive(Clone)]
pub struct ReliabilityAggregator {
    store: Arc<dyn RunStore>,
    adaptation_penalty: f64,
}

impl ReliabilityAggregator {
    pub fn new(store: Arc<dyn RunStore>, adaptation_penalty: f64) -> Self {
        Self {
            store,
            adaptation_penalty,
        }
    }

    /// Compute without writing
    pub fn report(&self, test_case_id: &str) -> Result<ReliabilityReport> {
        let history = self.store.terminal_runs(test_case_id)?;
        Ok(reliability::compute(&history, self.adaptation_penalty))
    }

    /// Recompute and persist the score of `test_case_id`
    pub fn on_terminal(&self, test_case_id: &str) -> Result<ReliabilityReport> {
        let report = self.report(test_case_id)?;
        self.store
            .update_reliability(test_case_id, report.reliability)?;
        info!(
            "Reliability of {} is {:.3} ({} of {} runs completed, {} adapted)",
            test_case_id,
            report.reliability,
            report.completed_runs,
            report.total_runs,
            report.runs_with_adaptations
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptest_common::{Database, RunStatus, StepAction, TestCase, TestRun};

    fn seed(db: &Database) {
        db.save_test_case(&TestCase {
            id: "checkout".into(),
            name: "Checkout".into(),
            objective: "buy one item".into(),
            base_url: None,
            tags: vec![],
            steps: vec![StepAction::navigate("/")],
            reliability_score: 0.0,
        })
        .unwrap();

        for (i, (status, adaptations)) in [
            (RunStatus::Completed, 0),
            (RunStatus::Completed, 2),
            (RunStatus::Failed, 0),
        ]
        .into_iter()
        .enumerate()
        {
            let mut run = TestRun::new(format!("run-{}", i), "checkout", 1);
            run.transition(RunStatus::Running).unwrap();
            run.adaptation_count = adaptations;
            run.transition(status).unwrap();
            db.create_run(&run).unwrap();
        }
    }

    #[test]
    fn test_on_terminal_writes_score() {
        let db = Database::open_memory().unwrap();
        seed(&db);
        let aggregator = ReliabilityAggregator::new(Arc::new(db.clone()), 0.3);

        let report = aggregator.on_terminal("checkout").unwrap();
        // 2/3 completed, 1/3 adapted: 0.667 * (1 - 0.3 * 0.333) = 0.6
        assert!((report.reliability - 0.6).abs() < 1e-9);

        let case = db.get_test_case("checkout").unwrap().unwrap();
        assert!((case.reliability_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_adapted_run_is_penalised() {
        let db = Database::open_memory().unwrap();
        seed(&db);
        // Healed by recovery: an adapted step but no advisor adaptations
        let mut run = TestRun::new("run-healed", "checkout", 1);
        run.transition(RunStatus::Running).unwrap();
        run.completed_steps = 1;
        run.adapted_steps = 1;
        run.transition(RunStatus::Completed).unwrap();
        db.create_run(&run).unwrap();
        let aggregator = ReliabilityAggregator::new(Arc::new(db), 0.3);

        let report = aggregator.on_terminal("checkout").unwrap();
        assert_eq!(report.total_runs, 4);
        assert_eq!(report.runs_with_adaptations, 2);
        // 3/4 completed, 2/4 adapted: 0.75 * (1 - 0.3 * 0.5)
        assert!((report.reliability - 0.6375).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_case_scores_zero() {
        let db = Database::open_memory().unwrap();
        let aggregator = ReliabilityAggregator::new(Arc::new(db), 0.3);
        assert_eq!(aggregator.report("missing").unwrap().reliability, 0.0);
    }
}
