//! Container runtime client
//!
//! The pool and engine only talk to sandboxes through [`ContainerRuntime`].
//! [`DockerRuntime`] implements it by shelling out to the docker/podman CLI
//! and to a driver executable baked into the sandbox image. The driver
//! speaks one JSON document per invocation on stdout:
//!
//! - `driver act '<StepAction json>'` -> [`ActionResult`]
//! - `driver snapshot` -> [`PageSnapshot`]
//! - `driver reset` -> exit status only
//! - `driver ping` -> exit status only

use crate::capability::PageStateCapturer;
use crate::config::RuntimeConfig;
use adaptest_common::{Error, HealthStatus, PageSnapshot, ResourceLimits, Result, StepAction};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Why an action failed, as far as recovery is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ElementNotFound,
    PageNotLoaded,
    UnexpectedNavigation,
    AuthRequired,
    Timeout,
    Other,
}

static ELEMENT_NOT_FOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(no (such )?element|element not found|not attached|waiting for (locator|selector)|strict mode violation)")
        .expect("valid regex")
});
static PAGE_NOT_LOADED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(net::err_|navigation timeout|page (is )?not loaded|document not ready|loading)")
        .expect("valid regex")
});
static UNEXPECTED_NAVIGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(unexpected navigation|execution context was destroyed|frame was detached|redirected)")
        .expect("valid regex")
});
static AUTH_REQUIRED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\b40[13]\b|unauthori[sz]ed|forbidden|login required|auth(entication)? required)")
        .expect("valid regex")
});
static TIMEOUT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(timed? ?out|deadline)").expect("valid regex"));

impl FailureCategory {
    /// Classify a driver error message
    pub fn classify(message: &str) -> Self {
        // Order matters: auth and navigation messages often also mention timeouts
        if AUTH_REQUIRED.is_match(message) {
            Self::AuthRequired
        } else if UNEXPECTED_NAVIGATION.is_match(message) {
            Self::UnexpectedNavigation
        } else if ELEMENT_NOT_FOUND.is_match(message) {
            Self::ElementNotFound
        } else if PAGE_NOT_LOADED.is_match(message) {
            Self::PageNotLoaded
        } else if TIMEOUT.is_match(message) {
            Self::Timeout
        } else {
            Self::Other
        }
    }
}

/// Failure detail reported by the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl ActionFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Build a failure whose category is inferred from the message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            category: FailureCategory::classify(&message),
            message,
        }
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.category, self.message)
    }
}

/// Result of executing one action inside a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    /// Page URL after the action
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub failure: Option<ActionFailure>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            url: None,
            failure: None,
        }
    }

    pub fn failed(failure: ActionFailure) -> Self {
        Self {
            success: false,
            url: None,
            failure: Some(failure),
        }
    }
}

/// What `inspect` reports about a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub endpoint: Option<String>,
}

/// Create/start/stop/remove/inspect of sandboxes and action execution in them
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a sandbox container, returning its runtime id
    async fn create(&self, image: &str, limits: &ResourceLimits) -> Result<String>;
    async fn start(&self, container_id: &str) -> Result<()>;
    async fn stop(&self, container_id: &str) -> Result<()>;
    async fn remove(&self, container_id: &str) -> Result<()>;
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo>;
    async fn health_probe(&self, container_id: &str) -> Result<HealthStatus>;
    /// Execute an action. `Err` means the call itself failed; a failed
    /// action is `Ok` with `success == false`.
    async fn exec(&self, container_id: &str, action: &StepAction) -> Result<ActionResult>;
    /// Fresh browser context: closes sessions, clears cookies and storage
    async fn reset_context(&self, container_id: &str) -> Result<()>;
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;
}

/// Execute one action under `timeout`, folding every way it can go wrong
/// into an [`ActionFailure`]
pub async fn run_action(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    action: &StepAction,
    timeout: Duration,
) -> std::result::Result<ActionResult, ActionFailure> {
    match tokio::time::timeout(timeout, runtime.exec(container_id, action)).await {
        Ok(Ok(result)) if result.success => Ok(result),
        Ok(Ok(result)) => Err(result
            .failure
            .unwrap_or_else(|| ActionFailure::from_message(format!("{} failed", action)))),
        Ok(Err(Error::Timeout { seconds })) => Err(ActionFailure::new(
            FailureCategory::Timeout,
            format!("runtime call timed out after {}s", seconds),
        )),
        Ok(Err(e)) => Err(ActionFailure::from_message(e.to_string())),
        Err(_) => Err(ActionFailure::new(
            FailureCategory::Timeout,
            format!("{} timed out after {:?}", action, timeout),
        )),
    }
}

/// Detect an available container CLI
pub fn detect_binary() -> Option<&'static str> {
    // Check podman first (rootless friendly)
    for bin in ["podman", "docker"] {
        if Command::new(bin).arg("--version").output().is_ok() {
            return Some(bin);
        }
    }
    None
}

/// Docker/Podman CLI backed runtime
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let binary = match &config.binary {
            Some(b) => b.clone(),
            None => detect_binary()
                .ok_or_else(|| Error::Runtime("No container runtime available".into()))?
                .to_string(),
        };
        Ok(Self { binary, config })
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    /// Arguments for `create`
    pub fn create_args(&self, image: &str, limits: &ResourceLimits) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--label".to_string(),
            "adaptest.sandbox=1".to_string(),
            "--init".to_string(),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            format!("{}", limits.cpu_cores),
            "--shm-size".to_string(),
            format!("{}m", limits.shm_mb),
        ];

        if limits.allow_network {
            args.extend([
                "-p".to_string(),
                format!("127.0.0.1::{}", self.config.debug_port),
            ]);
        } else {
            args.extend(["--network".to_string(), "none".to_string()]);
        }

        args.extend([
            image.to_string(),
            self.config.driver_command.clone(),
            "serve".to_string(),
            "--port".to_string(),
            self.config.debug_port.to_string(),
        ]);
        args
    }

    /// Run the CLI, returning stdout on success
    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn output(&self, args: &[String]) -> Result<std::process::Output> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut cmd = AsyncCommand::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        match tokio::time::timeout(self.command_timeout(), cmd.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout {
                seconds: self.config.command_timeout_secs,
            }),
        }
    }

    fn driver_args(&self, container_id: &str, verb: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            container_id.to_string(),
            self.config.driver_command.clone(),
            verb.to_string(),
        ]
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, image: &str, limits: &ResourceLimits) -> Result<String> {
        let stdout = self.run(&self.create_args(image, limits)).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(Error::Runtime("create returned no container id".into()));
        }
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.run(&["start".to_string(), container_id.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.run(&[
            "stop".to_string(),
            "--time".to_string(),
            "5".to_string(),
            container_id.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.run(&["rm".to_string(), "-f".to_string(), container_id.to_string()])
            .await
            .map(|_| ())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let stdout = self
            .run(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{json .}}".to_string(),
                container_id.to_string(),
            ])
            .await?;
        parse_inspect(container_id, &stdout, self.config.debug_port)
    }

    async fn health_probe(&self, container_id: &str) -> Result<HealthStatus> {
        let info = self.inspect(container_id).await?;
        if !info.running {
            return Ok(HealthStatus::Unresponsive);
        }
        let output = self.output(&self.driver_args(container_id, "ping")).await?;
        Ok(if output.status.success() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        })
    }

    async fn exec(&self, container_id: &str, action: &StepAction) -> Result<ActionResult> {
        let mut args = self.driver_args(container_id, "act");
        args.push(serde_json::to_string(action)?);
        let output = self.output(&args).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            if let Ok(result) = serde_json::from_str::<ActionResult>(line) {
                return Ok(result);
            }
        }

        if output.status.success() {
            Ok(ActionResult::ok())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Driver returned no result for {}: {}", action, stderr.trim());
            Ok(ActionResult::failed(ActionFailure::from_message(stderr.trim())))
        }
    }

    async fn reset_context(&self, container_id: &str) -> Result<()> {
        self.run(&self.driver_args(container_id, "reset"))
            .await
            .map(|_| ())
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let output = self
            .output(&[
                "logs".to_string(),
                "--tail".to_string(),
                tail.to_string(),
                container_id.to_string(),
            ])
            .await?;
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }
}

#[async_trait]
impl PageStateCapturer for DockerRuntime {
    async fn capture(&self, container_id: &str) -> Result<PageSnapshot> {
        let stdout = self.run(&self.driver_args(container_id, "snapshot")).await?;
        let mut snapshot: PageSnapshot = serde_json::from_str(stdout.trim())?;
        if snapshot.captured_at == 0 {
            snapshot.captured_at = adaptest_common::now();
        }
        Ok(snapshot)
    }
}

/// Parse `inspect --format '{{json .}}'` output
fn parse_inspect(container_id: &str, stdout: &str, debug_port: u16) -> Result<ContainerInfo> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim())?;
    // podman wraps the document in an array
    let doc = match &value {
        serde_json::Value::Array(items) => items
            .first()
            .ok_or_else(|| Error::not_found("container", container_id))?,
        other => other,
    };

    let running = doc
        .pointer("/State/Running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let port_key = format!("{}/tcp", debug_port);
    let endpoint = doc
        .pointer("/NetworkSettings/Ports")
        .and_then(|ports| ports.get(&port_key))
        .and_then(|bindings| bindings.get(0))
        .and_then(|b| b.get("HostPort"))
        .and_then(|p| p.as_str())
        .map(|port| format!("ws://127.0.0.1:{}", port));

    Ok(ContainerInfo {
        id: doc
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or(container_id)
            .to_string(),
        running,
        endpoint,
    })
}
