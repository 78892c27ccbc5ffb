//! Core types for Adaptest

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Current unix timestamp in seconds
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Actions
// ============================================================================

/// Kind of browser action a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    Type,
    Press,
    Select,
    Hover,
    Check,
    Uncheck,
    Wait,
    Assert,
    Screenshot,
}

impl ActionKind {
    /// Actions whose target is a URL rather than an element selector
    pub fn targets_url(&self) -> bool {
        matches!(self, ActionKind::Navigate)
    }

    /// Actions that require an interactable element
    pub fn needs_interaction(&self) -> bool {
        matches!(
            self,
            ActionKind::Click
                | ActionKind::Fill
                | ActionKind::Type
                | ActionKind::Select
                | ActionKind::Check
                | ActionKind::Uncheck
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Type => "type",
            ActionKind::Press => "press",
            ActionKind::Select => "select",
            ActionKind::Hover => "hover",
            ActionKind::Check => "check",
            ActionKind::Uncheck => "uncheck",
            ActionKind::Wait => "wait",
            ActionKind::Assert => "assert",
            ActionKind::Screenshot => "screenshot",
        };
        f.write_str(s)
    }
}

/// Action descriptor: type + target + optional value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAction {
    pub action: ActionKind,
    /// CSS selector, or URL for navigation
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl StepAction {
    pub fn new(action: ActionKind, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(ActionKind::Navigate, url)
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self::new(ActionKind::Click, selector)
    }

    pub fn fill(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ActionKind::Fill, selector).with_value(value)
    }

    /// Same action and value against a different target
    pub fn retarget(&self, target: impl Into<String>) -> Self {
        Self {
            action: self.action,
            target: target.into(),
            value: self.value.clone(),
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.action, self.target)
    }
}

// ============================================================================
// Sandboxes
// ============================================================================

/// Resource limits applied to each sandbox container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f32,
    /// Shared memory size; headless Chromium needs more than the default
    pub shm_mb: u64,
    pub allow_network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 1.0,
            shm_mb: 512,
            allow_network: true,
        }
    }
}

/// Health as observed by probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unresponsive,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

/// Sandbox lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Idle,
    Allocated,
    InUse,
    Cleaning,
    Unresponsive,
    Terminated,
}

impl SandboxState {
    pub const ALL: [SandboxState; 7] = [
        SandboxState::Created,
        SandboxState::Idle,
        SandboxState::Allocated,
        SandboxState::InUse,
        SandboxState::Cleaning,
        SandboxState::Unresponsive,
        SandboxState::Terminated,
    ];

    /// Whether `self -> next` is a legal lifecycle edge
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Unresponsive) | (_, Terminated) => true,
            (Created, Allocated) | (Created, Idle) => true,
            (Idle, Allocated) => true,
            (Allocated, InUse) | (Allocated, Cleaning) => true,
            (InUse, Cleaning) => true,
            (Cleaning, Idle) => true,
            _ => false,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Created => "created",
            SandboxState::Idle => "idle",
            SandboxState::Allocated => "allocated",
            SandboxState::InUse => "in_use",
            SandboxState::Cleaning => "cleaning",
            SandboxState::Unresponsive => "unresponsive",
            SandboxState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// An isolated browser sandbox owned by the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Pool-assigned identity
    pub id: String,
    /// Runtime container id, once provisioned
    pub container_id: Option<String>,
    /// Automation endpoint, e.g. `ws://127.0.0.1:49153`
    pub endpoint: Option<String>,
    pub limits: ResourceLimits,
    pub health: HealthStatus,
    pub state: SandboxState,
    pub consecutive_failures: u32,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl Sandbox {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            id: format!("sbx-{}", Uuid::new_v4().simple()),
            container_id: None,
            endpoint: None,
            limits,
            health: HealthStatus::Healthy,
            state: SandboxState::Created,
            consecutive_failures: 0,
            created_at: now(),
            last_used_at: None,
        }
    }

    /// Eligible to be handed to a new run
    pub fn is_allocatable(&self) -> bool {
        self.state == SandboxState::Idle && self.health != HealthStatus::Unresponsive
    }
}

/// Binding between one sandbox and one test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub sandbox_id: String,
    pub test_run_id: String,
    pub allocated_at: i64,
    pub released_at: Option<i64>,
}

impl Allocation {
    pub fn new(sandbox_id: &str, test_run_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sandbox_id: sandbox_id.to_string(),
            test_run_id: test_run_id.to_string(),
            allocated_at: now(),
            released_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.released_at.is_none()
    }
}

// ============================================================================
// Page state
// ============================================================================

/// An element visible in a page snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageElement {
    pub selector: String,
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub interactable: bool,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Structured snapshot of a live page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<PageElement>,
    #[serde(default)]
    pub console_errors: Vec<String>,
    #[serde(default)]
    pub network_failures: Vec<String>,
    #[serde(default)]
    pub captured_at: i64,
}

impl PageSnapshot {
    pub fn find(&self, selector: &str) -> Option<&PageElement> {
        self.elements.iter().find(|e| e.selector == selector)
    }
}

// ============================================================================
// Runs and steps
// ============================================================================

/// Test run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Test step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Adapted,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Adapted => write!(f, "adapted"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Runtime substitution of a planned action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adaptation {
    pub original: StepAction,
    pub adapted: StepAction,
    /// Clamped to [0, 1]
    pub confidence: f64,
    pub reason: String,
    pub created_at: i64,
}

impl Adaptation {
    pub fn new(
        original: StepAction,
        adapted: StepAction,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            original,
            adapted,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            created_at: now(),
        }
    }
}

/// Recovery strategy names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    AlternativeSelector,
    WaitAndRetry,
    Renavigate,
    NonRecoverable,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::AlternativeSelector => write!(f, "alternative_selector"),
            RecoveryStrategy::WaitAndRetry => write!(f, "wait_and_retry"),
            RecoveryStrategy::Renavigate => write!(f, "renavigate"),
            RecoveryStrategy::NonRecoverable => write!(f, "non_recoverable"),
        }
    }
}

/// One recovery strategy tried after retries ran out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub strategy: RecoveryStrategy,
    pub reason: String,
    pub success: bool,
    pub wait_ms: Option<u64>,
    pub created_at: i64,
}

impl RecoveryAttempt {
    pub fn new(strategy: RecoveryStrategy, reason: impl Into<String>, success: bool) -> Self {
        Self {
            strategy,
            reason: reason.into(),
            success,
            wait_ms: None,
            created_at: now(),
        }
    }

    pub fn with_wait(mut self, wait_ms: u64) -> Self {
        self.wait_ms = Some(wait_ms);
        self
    }
}

/// A step of a test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    pub test_run_id: String,
    /// 1-based, unique within the run
    pub step_number: u32,
    /// Planned action
    pub action: StepAction,
    /// Actions actually executed when they differ from the plan
    #[serde(default)]
    pub executed: Vec<StepAction>,
    pub status: StepStatus,
    pub page_before: Option<PageSnapshot>,
    pub page_after: Option<PageSnapshot>,
    #[serde(default)]
    adaptations: Vec<Adaptation>,
    #[serde(default)]
    recovery_attempts: Vec<RecoveryAttempt>,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TestStep {
    pub fn new(test_run_id: &str, step_number: u32, action: StepAction) -> Self {
        Self {
            test_run_id: test_run_id.to_string(),
            step_number,
            action,
            executed: Vec::new(),
            status: StepStatus::Pending,
            page_before: None,
            page_after: None,
            adaptations: Vec::new(),
            recovery_attempts: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn adaptations(&self) -> &[Adaptation] {
        &self.adaptations
    }

    pub fn recovery_attempts(&self) -> &[RecoveryAttempt] {
        &self.recovery_attempts
    }

    pub fn record_adaptation(&mut self, adaptation: Adaptation) {
        self.adaptations.push(adaptation);
    }

    pub fn record_recovery(&mut self, attempt: RecoveryAttempt) {
        self.recovery_attempts.push(attempt);
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Success | StepStatus::Adapted | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn finish(&mut self, status: StepStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(now());
    }
}

/// A single execution of a test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub test_case_id: String,
    pub status: RunStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub adapted_steps: u32,
    pub skipped_steps: u32,
    pub adaptation_count: u32,
    pub recovery_attempts: u32,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error_summary: Option<String>,
}

impl TestRun {
    pub fn new(id: impl Into<String>, test_case_id: impl Into<String>, total_steps: u32) -> Self {
        Self {
            id: id.into(),
            test_case_id: test_case_id.into(),
            status: RunStatus::Pending,
            total_steps,
            completed_steps: 0,
            failed_steps: 0,
            adapted_steps: 0,
            skipped_steps: 0,
            adaptation_count: 0,
            recovery_attempts: 0,
            started_at: None,
            finished_at: None,
            error_summary: None,
        }
    }

    /// Move the run to `next`, refusing changes once terminal
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        let legal = match (self.status, next) {
            (from, _) if from.is_terminal() => false,
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Cancelled) | (RunStatus::Pending, RunStatus::Failed) => {
                true
            }
            (RunStatus::Running, to) => to.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        match next {
            RunStatus::Running => self.started_at = Some(now()),
            s if s.is_terminal() => self.finished_at = Some(now()),
            _ => {}
        }
        Ok(())
    }

    /// Fold a resolved step into the counters
    pub fn tally(&mut self, step: &TestStep) {
        match step.status {
            StepStatus::Success => self.completed_steps += 1,
            StepStatus::Adapted => {
                self.completed_steps += 1;
                self.adapted_steps += 1;
            }
            StepStatus::Failed => self.failed_steps += 1,
            StepStatus::Skipped => self.skipped_steps += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }
        self.recovery_attempts += step.recovery_attempts().len() as u32;
    }

    /// Whether any step ran something other than its plan, whether the
    /// substitution came from the advisor or from recovery
    pub fn had_adaptations(&self) -> bool {
        self.adaptation_count > 0 || self.adapted_steps > 0
    }
}

// ============================================================================
// Test cases
// ============================================================================

/// A recorded test scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    /// Goal in plain language, handed to the adapter
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<StepAction>,
    #[serde(default)]
    pub reliability_score: f64,
}

/// Outcome of one `execute` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub run: TestRun,
    pub steps: Vec<TestStep>,
    pub sandbox_id: Option<String>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn adaptations(&self) -> impl Iterator<Item = &Adaptation> {
        self.steps.iter().flat_map(|s| s.adaptations().iter())
    }

    pub fn recovery_attempts(&self) -> impl Iterator<Item = &RecoveryAttempt> {
        self.steps.iter().flat_map(|s| s.recovery_attempts().iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_transitions() {
        use SandboxState::*;
        assert!(Idle.can_transition_to(Allocated));
        assert!(Allocated.can_transition_to(InUse));
        assert!(InUse.can_transition_to(Cleaning));
        assert!(Cleaning.can_transition_to(Idle));
        assert!(InUse.can_transition_to(Unresponsive));
        assert!(!Idle.can_transition_to(InUse));
        assert!(!InUse.can_transition_to(Idle));
        assert!(!Terminated.can_transition_to(Idle));
        assert!(!Unresponsive.can_transition_to(Idle));
    }

    #[test]
    fn test_run_terminal_is_immutable() {
        let mut run = TestRun::new("run-1", "case-1", 2);
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Completed).unwrap();
        assert!(run.finished_at.is_some());

        let err = run.transition(RunStatus::Failed).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_tally_counts_adapted_as_completed() {
        let mut run = TestRun::new("run-1", "case-1", 3);
        let mut step = TestStep::new("run-1", 1, StepAction::click("#go"));
        step.record_recovery(RecoveryAttempt::new(
            RecoveryStrategy::WaitAndRetry,
            "page not loaded",
            true,
        ));
        step.finish(StepStatus::Adapted, None);
        run.tally(&step);

        assert_eq!(run.completed_steps, 1);
        assert_eq!(run.adapted_steps, 1);
        assert_eq!(run.recovery_attempts, 1);
    }

    #[test]
    fn test_adaptation_confidence_clamped() {
        let a = Adaptation::new(
            StepAction::click("#old"),
            StepAction::click("#new"),
            1.7,
            "selector renamed",
        );
        assert_eq!(a.confidence, 1.0);
    }

    #[test]
    fn test_step_action_yaml_shape() {
        let action: StepAction =
            serde_json::from_str(r##"{"action":"fill","target":"#email","value":"a@b.c"}"##)
                .unwrap();
        assert_eq!(action, StepAction::fill("#email", "a@b.c"));
        assert_eq!(action.to_string(), "fill:#email");
    }
}
