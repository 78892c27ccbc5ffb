//! Job intake
//!
//! Turns job requests into engine runs, one task per run, and keeps a
//! cancellation token per active run so runs can be cancelled by id.

use crate::config::RunOverrides;
use crate::engine::AdaptiveEngine;
use adaptest_common::{Error, RunStatus, TestResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A request to execute one test case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub test_case_id: String,
    /// Generated when absent
    #[serde(default)]
    pub test_run_id: Option<String>,
    #[serde(default)]
    pub config: RunOverrides,
}

/// Summary returned for every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub test_run_id: String,
    pub status: RunStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub adapted_steps: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResponse {
    pub fn from_result(result: &TestResult) -> Self {
        Self {
            test_run_id: result.run.id.clone(),
            status: result.run.status,
            total_steps: result.run.total_steps,
            completed_steps: result.run.completed_steps,
            failed_steps: result.run.failed_steps,
            adapted_steps: result.run.adapted_steps,
            duration_ms: result.duration_ms,
            error: result.run.error_summary.clone(),
        }
    }

    /// Response for a job that never became a run
    pub fn rejected(test_run_id: &str, error: &Error) -> Self {
        Self {
            test_run_id: test_run_id.to_string(),
            status: RunStatus::Failed,
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            adapted_steps: 0,
            duration_ms: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Spawns engine runs and tracks their cancellation tokens
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<AdaptiveEngine>,
    active: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(engine: Arc<AdaptiveEngine>) -> Self {
        Self {
            engine,
            active: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a run for `job`; the handle resolves when the run is terminal
    pub fn submit(&self, job: JobRequest) -> JoinHandle<JobResponse> {
        let run_id = job
            .test_run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Child of the shutdown token so `cancel_all` reaches every run
        let token = self.shutdown.child_token();
        let duplicate = match self.active.entry(run_id.clone()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                false
            }
        };

        let engine = self.engine.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            if duplicate {
                let err = Error::AllocationConflict(format!("run {} is already active", run_id));
                warn!("Rejected job: {}", err);
                return JobResponse::rejected(&run_id, &err);
            }

            let response = match engine.store().get_test_case(&job.test_case_id) {
                Ok(Some(case)) => {
                    match engine.execute(&case, &run_id, &job.config, token).await {
                        Ok(result) => JobResponse::from_result(&result),
                        Err(e) => {
                            warn!("Run {} was not started: {}", run_id, e);
                            JobResponse::rejected(&run_id, &e)
                        }
                    }
                }
                Ok(None) => {
                    JobResponse::rejected(&run_id, &Error::not_found("test_case", &job.test_case_id))
                }
                Err(e) => JobResponse::rejected(&run_id, &e),
            };

            active.remove(&run_id);
            info!("Job {} finished: {}", run_id, response.status);
            response
        })
    }

    /// Cancel an active run; false when no such run is active
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                info!("Cancelling run {}", run_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Ids of runs that have not reached a terminal status yet
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
