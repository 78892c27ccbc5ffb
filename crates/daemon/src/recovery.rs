//! Recovery strategies for steps whose retries ran out
//!
//! Strategies are chosen by failure category and tried in order. Each one
//! tried produces exactly one [`RecoveryAttempt`]; the first success ends
//! recovery.

use crate::capability::PageStateCapturer;
use crate::config::RecoveryConfig;
use crate::locator;
use crate::retry::sleep_or_cancel;
use crate::runtime::{run_action, ActionFailure, ContainerRuntime, FailureCategory};
use adaptest_common::{RecoveryAttempt, RecoveryStrategy, Result, StepAction};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Strategies to try for a failure category, in order
pub fn strategies_for(category: FailureCategory) -> &'static [RecoveryStrategy] {
    match category {
        FailureCategory::ElementNotFound => &[
            RecoveryStrategy::AlternativeSelector,
            RecoveryStrategy::WaitAndRetry,
        ],
        FailureCategory::PageNotLoaded => &[RecoveryStrategy::WaitAndRetry],
        FailureCategory::UnexpectedNavigation => &[RecoveryStrategy::Renavigate],
        FailureCategory::AuthRequired => &[RecoveryStrategy::NonRecoverable],
        FailureCategory::Timeout | FailureCategory::Other => &[RecoveryStrategy::WaitAndRetry],
    }
}

/// Result of a recovery pass
#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    /// One entry per strategy tried
    pub attempts: Vec<RecoveryAttempt>,
    /// Actions that finally succeeded, when recovery worked
    pub executed: Option<Vec<StepAction>>,
}

impl RecoveryOutcome {
    pub fn recovered(&self) -> bool {
        self.executed.is_some()
    }
}

/// Everything recovery needs to act inside one sandbox
pub struct Recovery<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub capturer: &'a dyn PageStateCapturer,
    pub config: &'a RecoveryConfig,
    pub container_id: &'a str,
    pub step_timeout: Duration,
    pub cancel: &'a CancellationToken,
}

impl<'a> Recovery<'a> {
    /// Try the strategies for `failure` against `action`.
    ///
    /// `last_url` is the most recent navigation target of the run, used to
    /// re-navigate after an unexpected page change.
    pub async fn recover(
        &self,
        action: &StepAction,
        failure: &ActionFailure,
        last_url: Option<&str>,
    ) -> Result<RecoveryOutcome> {
        let mut outcome = RecoveryOutcome::default();

        for strategy in strategies_for(failure.category) {
            let (attempt, executed) = match strategy {
                RecoveryStrategy::AlternativeSelector => self.alternative_selector(action).await?,
                RecoveryStrategy::WaitAndRetry => self.wait_and_retry(action).await?,
                RecoveryStrategy::Renavigate => self.renavigate(action, last_url).await?,
                RecoveryStrategy::NonRecoverable => (
                    RecoveryAttempt::new(
                        RecoveryStrategy::NonRecoverable,
                        format!("{}; not recoverable", failure.message),
                        false,
                    ),
                    None,
                ),
            };

            debug!(
                "Recovery {} for {}: success={}",
                attempt.strategy, action, attempt.success
            );
            outcome.attempts.push(attempt);
            if executed.is_some() {
                outcome.executed = executed;
                break;
            }
        }

        if outcome.recovered() {
            info!("Recovered {} after {} strategy(ies)", action, outcome.attempts.len());
        } else {
            warn!("Recovery exhausted for {}: {}", action, failure);
        }
        Ok(outcome)
    }

    async fn alternative_selector(
        &self,
        action: &StepAction,
    ) -> Result<(RecoveryAttempt, Option<Vec<StepAction>>)> {
        let strategy = RecoveryStrategy::AlternativeSelector;
        let snapshot = match self.capturer.capture(self.container_id).await {
            Ok(s) => s,
            Err(e) => {
                return Ok((
                    RecoveryAttempt::new(strategy, format!("snapshot failed: {}", e), false),
                    None,
                ))
            }
        };

        let candidates =
            locator::alternative_selectors(&snapshot, action, self.config.max_alternative_selectors);
        if candidates.is_empty() {
            return Ok((
                RecoveryAttempt::new(strategy, "no alternative selector on the page", false),
                None,
            ));
        }

        let mut tried = Vec::new();
        for candidate in candidates {
            if self.cancel.is_cancelled() {
                return Err(adaptest_common::Error::Cancelled);
            }
            let alternative = action.retarget(&candidate.selector);
            match run_action(self.runtime, self.container_id, &alternative, self.step_timeout).await
            {
                Ok(_) => {
                    let reason = format!(
                        "{} matched via {} (score {:.2})",
                        action.target, candidate.selector, candidate.score
                    );
                    return Ok((
                        RecoveryAttempt::new(strategy, reason, true),
                        Some(vec![alternative]),
                    ));
                }
                Err(failure) => tried.push(format!("{} ({})", candidate.selector, failure.message)),
            }
        }

        Ok((
            RecoveryAttempt::new(strategy, format!("tried {}", tried.join(", ")), false),
            None,
        ))
    }

    async fn wait_and_retry(
        &self,
        action: &StepAction,
    ) -> Result<(RecoveryAttempt, Option<Vec<StepAction>>)> {
        let wait = Duration::from_millis(self.config.wait_ms);
        let attempts = self.config.wait_attempts.max(1);
        let mut last = String::new();

        for n in 1..=attempts {
            sleep_or_cancel(wait, self.cancel).await?;
            match run_action(self.runtime, self.container_id, action, self.step_timeout).await {
                Ok(_) => {
                    let attempt = RecoveryAttempt::new(
                        RecoveryStrategy::WaitAndRetry,
                        format!("succeeded on wait {} of {}", n, attempts),
                        true,
                    )
                    .with_wait(self.config.wait_ms);
                    return Ok((attempt, Some(vec![action.clone()])));
                }
                Err(failure) => last = failure.message,
            }
        }

        let attempt = RecoveryAttempt::new(
            RecoveryStrategy::WaitAndRetry,
            format!("still failing after {} wait(s): {}", attempts, last),
            false,
        )
        .with_wait(self.config.wait_ms);
        Ok((attempt, None))
    }

    async fn renavigate(
        &self,
        action: &StepAction,
        last_url: Option<&str>,
    ) -> Result<(RecoveryAttempt, Option<Vec<StepAction>>)> {
        let strategy = RecoveryStrategy::Renavigate;
        let Some(url) = last_url else {
            return Ok((
                RecoveryAttempt::new(strategy, "no earlier navigation to return to", false),
                None,
            ));
        };

        let navigate = StepAction::navigate(url);
        if let Err(failure) =
            run_action(self.runtime, self.container_id, &navigate, self.step_timeout).await
        {
            return Ok((
                RecoveryAttempt::new(strategy, format!("navigate to {} failed: {}", url, failure.message), false),
                None,
            ));
        }

        let mut executed = vec![navigate];
        if action.action.targets_url() {
            return Ok((
                RecoveryAttempt::new(strategy, format!("returned to {}", url), true),
                Some(executed),
            ));
        }

        match run_action(self.runtime, self.container_id, action, self.step_timeout).await {
            Ok(_) => {
                executed.push(action.clone());
                Ok((
                    RecoveryAttempt::new(strategy, format!("returned to {} and retried", url), true),
                    Some(executed),
                ))
            }
            Err(failure) => Ok((
                RecoveryAttempt::new(
                    strategy,
                    format!("returned to {} but retry failed: {}", url, failure.message),
                    false,
                ),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            strategies_for(FailureCategory::ElementNotFound),
            &[
                RecoveryStrategy::AlternativeSelector,
                RecoveryStrategy::WaitAndRetry
            ]
        );
        assert_eq!(
            strategies_for(FailureCategory::PageNotLoaded),
            &[RecoveryStrategy::WaitAndRetry]
        );
        assert_eq!(
            strategies_for(FailureCategory::UnexpectedNavigation),
            &[RecoveryStrategy::Renavigate]
        );
        assert_eq!(
            strategies_for(FailureCategory::AuthRequired),
            &[RecoveryStrategy::NonRecoverable]
        );
    }
}
