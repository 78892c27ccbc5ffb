//! End-to-end engine runs against scripted collaborators

mod common;

use adaptest_common::{RecoveryStrategy, RunStatus, RunStore, StepAction, StepStatus};
use adaptest_daemon::config::{FailurePolicy, RunOverrides};
use adaptest_daemon::runtime::FailureCategory;
use common::{eventually, fast_engine_config, Harness, HANG, PANIC};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_clean_run_completes_and_releases() {
    let h = Harness::new(1, fast_engine_config());
    let case = h.case("login", &["#email", "#submit"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Completed);
    assert_eq!(result.run.completed_steps, 3);
    assert_eq!(result.run.adapted_steps, 0);
    assert!(result.run.error_summary.is_none());
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(
        h.runtime.executed()[0],
        StepAction::navigate("https://app.test/")
    );

    // Released back to idle and the allocation closed
    assert!(h.pool.allocation_for("run-1").is_none());
    let stats = h.pool.get_stats();
    assert_eq!((stats.idle, stats.in_use), (1, 0));
    let allocations = h.db.allocations_for_run("run-1").unwrap();
    assert_eq!(allocations.len(), 1);
    assert!(allocations[0].released_at.is_some());

    // Persisted run, steps and score
    let stored = h.db.get_run("run-1").unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(h.db.list_steps("run-1").unwrap().len(), 3);
    let case = h.db.get_test_case("login").unwrap().unwrap();
    assert_eq!(case.reliability_score, 1.0);
}

#[tokio::test]
async fn test_invalid_step_is_adapted() {
    let h = Harness::new(1, fast_engine_config());
    h.advisor
        .replace("#login", vec![StepAction::click("#sign-in")]);
    let case = h.case("adapt", &["#login"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Completed);
    assert_eq!(result.run.adaptation_count, 1);
    assert_eq!(result.run.adapted_steps, 1);

    let step = &result.steps[1];
    assert_eq!(step.status, StepStatus::Adapted);
    assert_eq!(step.executed, vec![StepAction::click("#sign-in")]);
    assert_eq!(step.adaptations().len(), 1);
    assert_eq!(step.adaptations()[0].original, StepAction::click("#login"));
    assert_eq!(step.adaptations()[0].confidence, 0.8);
    assert!(!h.runtime.executed_targets().contains(&"#login".to_string()));

    // One run, completed, with adaptations: 1.0 * (1 - 0.3)
    let case = h.db.get_test_case("adapt").unwrap().unwrap();
    assert!((case.reliability_score - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn test_adaptation_budget_exhaustion_fails_run() {
    let h = Harness::new(1, fast_engine_config());
    h.advisor.replace("#a", vec![StepAction::click("#a2")]);
    h.advisor.replace("#b", vec![StepAction::click("#b2")]);
    let case = h.case("budget", &["#a", "#b", "#c"]);
    let overrides = RunOverrides {
        max_adaptations: Some(1),
        ..Default::default()
    };

    let result = h
        .engine
        .execute(&case, "run-1", &overrides, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Failed);
    assert!(result
        .run
        .error_summary
        .as_deref()
        .unwrap()
        .contains("Adaptation budget exhausted"));
    let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Success,
            StepStatus::Adapted,
            StepStatus::Failed,
            StepStatus::Skipped
        ]
    );

    let targets = h.runtime.executed_targets();
    assert!(targets.contains(&"#a2".to_string()));
    assert!(!targets.iter().any(|t| t == "#b" || t == "#b2" || t == "#c"));
    assert!(h.pool.allocation_for("run-1").is_none());
}

#[tokio::test]
async fn test_wait_and_retry_recovers_on_second_wait() {
    let h = Harness::new(1, fast_engine_config());
    // Two retry attempts and the first wait fail; the second wait succeeds
    h.runtime
        .always_fail("#slow", FailureCategory::PageNotLoaded, 3);
    let case = h.case("slow", &["#slow"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Completed);
    let step = &result.steps[1];
    assert_eq!(step.status, StepStatus::Success);
    assert_eq!(step.recovery_attempts().len(), 1);
    let attempt = &step.recovery_attempts()[0];
    assert_eq!(attempt.strategy, RecoveryStrategy::WaitAndRetry);
    assert!(attempt.success);
    assert_eq!(attempt.wait_ms, Some(1));
    assert_eq!(result.run.recovery_attempts, 1);
}

#[tokio::test]
async fn test_alternative_selector_recovery_adapts_step() {
    use adaptest_common::{PageElement, PageSnapshot};

    let h = Harness::new(1, fast_engine_config());
    h.runtime.set_snapshot(PageSnapshot {
        url: "https://app.test/".into(),
        elements: vec![PageElement {
            selector: "#checkout-button".into(),
            tag: "button".into(),
            text: "Checkout".into(),
            visible: true,
            interactable: true,
            ..Default::default()
        }],
        ..Default::default()
    });
    h.runtime
        .always_fail("#checkout", FailureCategory::ElementNotFound, 10);
    let case = h.case("alt", &["#checkout"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Completed);
    let step = &result.steps[1];
    assert_eq!(step.status, StepStatus::Adapted);
    assert_eq!(step.executed, vec![StepAction::click("#checkout-button")]);
    assert_eq!(step.recovery_attempts().len(), 1);
    assert_eq!(
        step.recovery_attempts()[0].strategy,
        RecoveryStrategy::AlternativeSelector
    );
    // Recovery substitutions do not consume the adaptation budget
    assert_eq!(result.run.adaptation_count, 0);
    assert_eq!(result.run.adapted_steps, 1);

    // but a run healed by recovery is still penalised: 1.0 * (1 - 0.3)
    let case = h.db.get_test_case("alt").unwrap().unwrap();
    assert!((case.reliability_score - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn test_unrecoverable_step_aborts_by_default() {
    let h = Harness::new(1, fast_engine_config());
    h.runtime
        .always_fail("#account", FailureCategory::AuthRequired, 10);
    let case = h.case("auth", &["#account", "#after"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Failed);
    assert_eq!(result.steps[1].status, StepStatus::Failed);
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    let attempts = result.steps[1].recovery_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, RecoveryStrategy::NonRecoverable);
    assert!(!attempts[0].success);
    assert!(!h.runtime.executed_targets().contains(&"#after".to_string()));
    assert!(result
        .run
        .error_summary
        .as_deref()
        .unwrap()
        .contains("step 2"));
}

#[tokio::test]
async fn test_continue_policy_runs_later_steps() {
    let h = Harness::new(1, fast_engine_config());
    h.runtime
        .always_fail("#account", FailureCategory::AuthRequired, 10);
    let case = h.case("auth", &["#account", "#after"]);
    let overrides = RunOverrides {
        failure_policy: Some(FailurePolicy::Continue),
        ..Default::default()
    };

    let result = h
        .engine
        .execute(&case, "run-1", &overrides, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Failed);
    assert_eq!(result.steps[2].status, StepStatus::Success);
    assert_eq!(result.run.failed_steps, 1);
    assert_eq!(result.run.completed_steps, 2);
    assert!(h.runtime.executed_targets().contains(&"#after".to_string()));
}

#[tokio::test]
async fn test_unadaptable_step_fails() {
    let h = Harness::new(1, fast_engine_config());
    h.advisor.reject("#gone");
    let case = h.case("gone", &["#gone"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Failed);
    assert_eq!(result.steps[1].status, StepStatus::Failed);
    assert!(result.steps[1]
        .error
        .as_deref()
        .unwrap()
        .contains("no adaptation"));
}

#[tokio::test]
async fn test_validator_outage_executes_as_planned() {
    let h = Harness::new(1, fast_engine_config());
    h.advisor.fail_validation();
    let case = h.case("offline", &["#go"]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Completed);
    assert!(h.runtime.executed_targets().contains(&"#go".to_string()));
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    let h = Harness::new(1, fast_engine_config());
    let case = h.case("cancel", &[HANG, "#after"]);
    let token = CancellationToken::new();

    let run = {
        let engine = h.engine.clone();
        let token = token.clone();
        let case = case.clone();
        tokio::spawn(async move {
            engine
                .execute(&case, "run-1", &RunOverrides::default(), token)
                .await
        })
    };

    let runtime = h.runtime.clone();
    assert!(eventually(|| runtime.executed_targets().contains(&HANG.to_string())).await);
    token.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status(), RunStatus::Cancelled);
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    assert!(!h.runtime.executed_targets().contains(&"#after".to_string()));

    assert!(h.pool.allocation_for("run-1").is_none());
    assert_eq!(h.pool.get_stats().idle, 1);
    assert_eq!(
        h.db.get_run("run-1").unwrap().unwrap().status,
        RunStatus::Cancelled
    );
}

#[tokio::test]
async fn test_panic_still_releases_sandbox() {
    let h = Harness::new(1, fast_engine_config());
    let case = h.case("panic", &[PANIC]);

    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Failed);
    assert!(result.run.error_summary.as_deref().unwrap().contains("panic"));
    assert!(h.pool.allocation_for("run-1").is_none());

    // The sandbox is usable by the next run
    let next = h.case("after-panic", &["#ok"]);
    let result = h
        .engine
        .execute(&next, "run-2", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status(), RunStatus::Completed);
}

#[tokio::test]
async fn test_terminal_run_is_not_rewritten() {
    let h = Harness::new(1, fast_engine_config());
    let case = h.case("immutable", &["#go"]);
    let result = h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .unwrap();

    let mut tampered = result.run.clone();
    tampered.completed_steps = 0;
    assert!(h.db.update_run(&tampered).is_err());
    assert_eq!(h.db.get_run("run-1").unwrap().unwrap().completed_steps, 2);

    // Reusing a run id is refused before anything runs
    assert!(h
        .engine
        .execute(&case, "run-1", &RunOverrides::default(), CancellationToken::new())
        .await
        .is_err());
}
