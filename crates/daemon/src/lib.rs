//! Adaptest daemon library
//!
//! Sandbox pool, adaptive execution engine, reliability feedback and job
//! intake. The `adaptestd` binary wires these together; tests build them
//! with in-memory collaborators.

pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod feedback;
pub mod health;
pub mod locator;
pub mod pool;
pub mod recovery;
pub mod retry;
pub mod runtime;

pub use capability::{HeuristicAdvisor, HttpAdvisor, PageStateCapturer, StepAdvisor};
pub use config::DaemonConfig;
pub use dispatcher::{Dispatcher, JobRequest, JobResponse};
pub use engine::{AdaptiveEngine, EngineParts};
pub use feedback::ReliabilityAggregator;
pub use health::HealthMonitor;
pub use pool::{Lease, PoolManager, PoolStats, ReleaseOutcome};
pub use runtime::{ContainerRuntime, DockerRuntime};
