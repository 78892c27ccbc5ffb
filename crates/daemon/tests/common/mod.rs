//! Scripted in-memory collaborators for integration tests

#![allow(dead_code)]

use adaptest_common::{
    Database, Error, HealthStatus, PageSnapshot, ResourceLimits, Result, RunStore, StepAction,
    TestCase,
};
use adaptest_daemon::capability::{
    AdaptationRequest, AdaptedStep, PageStateCapturer, StepAdvisor, Validation,
};
use adaptest_daemon::config::{EngineConfig, PoolConfig, RecoveryConfig, RetryConfig};
use adaptest_daemon::runtime::{ActionFailure, ActionResult, ContainerInfo, FailureCategory};
use adaptest_daemon::{
    AdaptiveEngine, ContainerRuntime, EngineParts, PoolManager, ReliabilityAggregator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Target that never finishes executing
pub const HANG: &str = "#hang";
/// Target whose execution panics
pub const PANIC: &str = "#panic";

/// Runtime + page capturer whose action results are scripted per target
#[derive(Default)]
pub struct ScriptedRuntime {
    created: AtomicUsize,
    pub resets: AtomicUsize,
    scripts: Mutex<HashMap<String, VecDeque<ActionResult>>>,
    executed: Mutex<Vec<(String, StepAction)>>,
    snapshot: Mutex<PageSnapshot>,
}

impl ScriptedRuntime {
    /// Queue results for `target`; once drained, actions succeed
    pub fn script(&self, target: &str, results: Vec<ActionResult>) {
        self.scripts
            .lock()
            .entry(target.to_string())
            .or_default()
            .extend(results);
    }

    /// Make every execution of `target` fail with `category`
    pub fn always_fail(&self, target: &str, category: FailureCategory, times: usize) {
        self.script(
            target,
            (0..times)
                .map(|_| ActionResult::failed(ActionFailure::new(category, format!("{} failed", target))))
                .collect(),
        );
    }

    pub fn set_snapshot(&self, snapshot: PageSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn executed(&self) -> Vec<StepAction> {
        self.executed.lock().iter().map(|(_, a)| a.clone()).collect()
    }

    pub fn executed_targets(&self) -> Vec<String> {
        self.executed().into_iter().map(|a| a.target).collect()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, _image: &str, _limits: &ResourceLimits) -> Result<String> {
        Ok(format!("ctr-{}", self.created.fetch_add(1, Ordering::SeqCst)))
    }

    async fn start(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        Ok(ContainerInfo {
            id: container_id.to_string(),
            running: true,
            endpoint: Some("ws://127.0.0.1:9222".to_string()),
        })
    }

    async fn health_probe(&self, _container_id: &str) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }

    async fn exec(&self, container_id: &str, action: &StepAction) -> Result<ActionResult> {
        self.executed
            .lock()
            .push((container_id.to_string(), action.clone()));

        if action.target == HANG {
            std::future::pending::<()>().await;
        }
        if action.target == PANIC {
            panic!("driver crashed on {}", action);
        }

        let next = self
            .scripts
            .lock()
            .get_mut(&action.target)
            .and_then(|q| q.pop_front());
        Ok(next.unwrap_or_else(ActionResult::ok))
    }

    async fn reset_context(&self, _container_id: &str) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self, _container_id: &str, _tail: usize) -> Result<String> {
        Ok(String::new())
    }
}

#[async_trait]
impl PageStateCapturer for ScriptedRuntime {
    async fn capture(&self, _container_id: &str) -> Result<PageSnapshot> {
        Ok(self.snapshot.lock().clone())
    }
}

/// Advisor that rejects listed targets and adapts them from a fixed map
#[derive(Default)]
pub struct ScriptedAdvisor {
    invalid: Mutex<HashSet<String>>,
    replacements: Mutex<HashMap<String, Vec<StepAction>>>,
    pub validate_calls: AtomicUsize,
    fail_validation: Mutex<bool>,
}

impl ScriptedAdvisor {
    /// Treat `from` as invalid and adapt it to `to`
    pub fn replace(&self, from: &str, to: Vec<StepAction>) {
        self.invalid.lock().insert(from.to_string());
        self.replacements.lock().insert(from.to_string(), to);
    }

    /// Treat `target` as invalid with no adaptation available
    pub fn reject(&self, target: &str) {
        self.invalid.lock().insert(target.to_string());
    }

    pub fn fail_validation(&self) {
        *self.fail_validation.lock() = true;
    }
}

#[async_trait]
impl StepAdvisor for ScriptedAdvisor {
    async fn validate(&self, planned: &StepAction, _snapshot: &PageSnapshot) -> Result<Validation> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_validation.lock() {
            return Err(Error::Capability("validator offline".into()));
        }
        if self.invalid.lock().contains(&planned.target) {
            Ok(Validation::invalid(0.9, format!("{} moved", planned.target)))
        } else {
            Ok(Validation::valid(1.0))
        }
    }

    async fn adapt(&self, request: &AdaptationRequest) -> Result<Vec<AdaptedStep>> {
        Ok(self
            .replacements
            .lock()
            .get(&request.planned_step.target)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|action| AdaptedStep {
                action,
                confidence: Some(0.8),
                reason: Some("selector renamed".to_string()),
            })
            .collect())
    }
}

/// Engine settings with millisecond waits
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        step_timeout_secs: 5,
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: 0.0,
        },
        recovery: RecoveryConfig {
            wait_attempts: 3,
            wait_ms: 1,
            max_alternative_selectors: 3,
        },
        ..EngineConfig::default()
    }
}

pub fn pool_config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        acquire_timeout_secs: 5,
        acquire_backoff_ms: 10,
        ..PoolConfig::default()
    }
}

pub struct Harness {
    pub db: Database,
    pub runtime: Arc<ScriptedRuntime>,
    pub advisor: Arc<ScriptedAdvisor>,
    pub pool: Arc<PoolManager>,
    pub engine: Arc<AdaptiveEngine>,
}

impl Harness {
    pub fn new(pool_size: usize, engine: EngineConfig) -> Self {
        let db = Database::open_memory().expect("in-memory database");
        let store: Arc<dyn RunStore> = Arc::new(db.clone());
        let runtime = Arc::new(ScriptedRuntime::default());
        let advisor = Arc::new(ScriptedAdvisor::default());
        let pool = Arc::new(
            PoolManager::new(pool_config(pool_size), runtime.clone()).with_store(store.clone()),
        );
        let engine = Arc::new(AdaptiveEngine::new(
            engine,
            EngineParts {
                pool: pool.clone(),
                runtime: runtime.clone(),
                capturer: runtime.clone(),
                advisor: advisor.clone(),
                store: store.clone(),
                aggregator: ReliabilityAggregator::new(store, 0.3),
            },
        ));

        Self {
            db,
            runtime,
            advisor,
            pool,
            engine,
        }
    }

    /// Store and return a case with one click step per target after an
    /// initial navigation
    pub fn case(&self, id: &str, targets: &[&str]) -> TestCase {
        let mut steps = vec![StepAction::navigate("/")];
        steps.extend(targets.iter().map(|t| StepAction::click(*t)));
        let case = TestCase {
            id: id.to_string(),
            name: id.to_string(),
            objective: format!("exercise {}", id),
            base_url: Some("https://app.test".to_string()),
            tags: vec![],
            steps,
            reliability_score: 0.0,
        };
        self.db.save_test_case(&case).expect("save case");
        case
    }
}

/// Poll until `f` holds or a second has passed
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f()
}
