//! Page observation and step validation/adaptation capabilities
//!
//! Both are external collaborators: the engine only sees the traits here.
//! `HttpAdvisor` forwards to an AI service; `HeuristicAdvisor` needs no
//! service and decides from the snapshot alone.

use crate::config::{AdvisorConfig, AdvisorKind};
use crate::locator;
use adaptest_common::{Error, PageSnapshot, Result, StepAction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Produces a structured snapshot of the page live in a sandbox
#[async_trait]
pub trait PageStateCapturer: Send + Sync {
    async fn capture(&self, container_id: &str) -> Result<PageSnapshot>;
}

/// Validator verdict for a planned step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub is_valid: bool,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Validation {
    pub fn valid(confidence: f64) -> Self {
        Self {
            is_valid: true,
            confidence,
            issues: Vec::new(),
        }
    }

    pub fn invalid(confidence: f64, issue: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            confidence,
            issues: vec![issue.into()],
        }
    }

    /// Human-readable reason, used when recording an adaptation
    pub fn reason(&self) -> String {
        if self.issues.is_empty() {
            "planned step is not executable against the current page".to_string()
        } else {
            self.issues.join("; ")
        }
    }
}

/// Input to `adapt`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationRequest {
    pub objective: String,
    pub planned_step: StepAction,
    pub page_snapshot: PageSnapshot,
    pub completed_steps: Vec<StepAction>,
}

/// One replacement action proposed by the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptedStep {
    pub action: StepAction,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Step validator/adapter
#[async_trait]
pub trait StepAdvisor: Send + Sync {
    async fn validate(&self, planned: &StepAction, snapshot: &PageSnapshot) -> Result<Validation>;

    /// Replacement sequence for a step judged invalid; empty when no
    /// adaptation is possible
    async fn adapt(&self, request: &AdaptationRequest) -> Result<Vec<AdaptedStep>>;
}

/// Build the advisor selected by configuration
pub fn advisor_from_config(config: &AdvisorConfig) -> Result<Arc<dyn StepAdvisor>> {
    match config.kind {
        AdvisorKind::Http => Ok(Arc::new(HttpAdvisor::new(config)?)),
        AdvisorKind::Heuristic => Ok(Arc::new(HeuristicAdvisor::default())),
    }
}

// ============================================================================
// HTTP advisor
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationRequest<'a> {
    planned_step: &'a StepAction,
    page_snapshot: &'a PageSnapshot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdaptationResponse {
    #[serde(default)]
    adapted_steps: Vec<AdaptedStep>,
}

/// Advisor backed by a JSON-over-HTTP AI service
pub struct HttpAdvisor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAdvisor {
    pub fn new(config: &AdvisorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Capability(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.endpoint, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Capability(format!("{}: {}", url, e)))?;
        response
            .json::<R>()
            .await
            .map_err(|e| Error::Capability(format!("{}: invalid response: {}", url, e)))
    }
}

#[async_trait]
impl StepAdvisor for HttpAdvisor {
    async fn validate(&self, planned: &StepAction, snapshot: &PageSnapshot) -> Result<Validation> {
        let mut validation: Validation = self
            .post(
                "validate",
                &ValidationRequest {
                    planned_step: planned,
                    page_snapshot: snapshot,
                },
            )
            .await?;
        validation.confidence = validation.confidence.clamp(0.0, 1.0);
        Ok(validation)
    }

    async fn adapt(&self, request: &AdaptationRequest) -> Result<Vec<AdaptedStep>> {
        let response: AdaptationResponse = self.post("adapt", request).await?;
        debug!(
            "Adapter proposed {} step(s) for {}",
            response.adapted_steps.len(),
            request.planned_step
        );
        Ok(response.adapted_steps)
    }
}

// ============================================================================
// Heuristic advisor
// ============================================================================

/// Snapshot-only advisor: checks the target exists, adapts by selector search
#[derive(Debug, Clone)]
pub struct HeuristicAdvisor {
    /// Below this candidate score no adaptation is proposed
    pub min_score: f64,
}

impl Default for HeuristicAdvisor {
    fn default() -> Self {
        Self { min_score: 0.3 }
    }
}

#[async_trait]
impl StepAdvisor for HeuristicAdvisor {
    async fn validate(&self, planned: &StepAction, snapshot: &PageSnapshot) -> Result<Validation> {
        if planned.action.targets_url() {
            return Ok(Validation::valid(1.0));
        }
        // Driver reported no element inventory; nothing to judge against
        if snapshot.elements.is_empty() {
            return Ok(Validation::valid(0.5));
        }

        Ok(match snapshot.find(&planned.target) {
            None => Validation::invalid(0.9, format!("{} is not on the page", planned.target)),
            Some(e) if !e.visible => {
                Validation::invalid(0.7, format!("{} is not visible", planned.target))
            }
            Some(e) if planned.action.needs_interaction() && !e.interactable => {
                Validation::invalid(0.7, format!("{} is not interactable", planned.target))
            }
            Some(_) => Validation::valid(1.0),
        })
    }

    async fn adapt(&self, request: &AdaptationRequest) -> Result<Vec<AdaptedStep>> {
        let best = locator::alternative_selectors(&request.page_snapshot, &request.planned_step, 1)
            .into_iter()
            .find(|c| c.score >= self.min_score);

        Ok(best
            .map(|c| AdaptedStep {
                action: request.planned_step.retarget(&c.selector),
                confidence: Some(c.score),
                reason: Some(format!(
                    "{} best matches {}",
                    c.selector, request.planned_step.target
                )),
            })
            .into_iter()
            .collect())
    }
}
