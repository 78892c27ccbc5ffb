//! Exclusive sandbox pool
//!
//! Every test run gets a sandbox of its own. The pool table (sandboxes and
//! live allocations) sits behind one mutex that is only ever held for
//! in-memory bookkeeping; provisioning, resets, probes and teardown all run
//! with the lock released. Per-state counts are mirrored into atomics so
//! [`PoolManager::get_stats`] never contends with allocation.

use crate::config::PoolConfig;
use crate::runtime::ContainerRuntime;
use adaptest_common::{
    now, Allocation, Error, HealthStatus, Result, RunStore, Sandbox, SandboxState,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A sandbox handed to a run, with the allocation that binds them
#[derive(Debug, Clone)]
pub struct Lease {
    pub sandbox: Sandbox,
    pub allocation: Allocation,
}

impl Lease {
    pub fn container_id(&self) -> Result<&str> {
        self.sandbox.container_id.as_deref().ok_or_else(|| {
            Error::Internal(format!("sandbox {} has no container", self.sandbox.id))
        })
    }
}

/// Outcome of `release`; releasing twice is not an error
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released(Allocation),
    Noop,
}

/// Result of one `health_check` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unresponsive: usize,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub created: usize,
    pub idle: usize,
    pub allocated: usize,
    pub in_use: usize,
    pub cleaning: usize,
    pub unresponsive: usize,
    /// Sandboxes torn down since the pool started
    pub terminated: usize,
    pub active_resets: usize,
    pub config: PoolConfig,
}

impl PoolStats {
    /// Sandboxes currently counted against `max_size`
    pub fn live(&self) -> usize {
        self.created + self.idle + self.allocated + self.in_use + self.cleaning + self.unresponsive
    }
}

#[derive(Default)]
struct StateCounts([AtomicUsize; 7]);

impl StateCounts {
    fn enter(&self, state: SandboxState) {
        self.0[state.index()].fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self, state: SandboxState) {
        self.0[state.index()].fetch_sub(1, Ordering::SeqCst);
    }

    fn get(&self, state: SandboxState) -> usize {
        self.0[state.index()].load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct PoolTable {
    sandboxes: HashMap<String, Sandbox>,
    /// Live allocations keyed by test run id
    allocations: HashMap<String, Allocation>,
}

impl PoolTable {
    fn holder_of(&self, sandbox_id: &str) -> Option<&Allocation> {
        self.allocations.values().find(|a| a.sandbox_id == sandbox_id)
    }
}

/// Exclusive sandbox pool manager
pub struct PoolManager {
    config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: Option<Arc<dyn RunStore>>,
    table: Mutex<PoolTable>,
    counts: StateCounts,
    active_resets: AtomicUsize,
    released: Notify,
}

impl PoolManager {
    pub fn new(config: PoolConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            store: None,
            table: Mutex::new(PoolTable::default()),
            counts: StateCounts::default(),
            active_resets: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// Persist allocations through `store`
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn transition(&self, sandbox: &mut Sandbox, next: SandboxState) -> Result<()> {
        if !sandbox.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: sandbox.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Sandbox {}: {} -> {}", sandbox.id, sandbox.state, next);
        self.counts.leave(sandbox.state);
        self.counts.enter(next);
        sandbox.state = next;
        Ok(())
    }

    fn insert(&self, table: &mut PoolTable, sandbox: Sandbox) {
        self.counts.enter(sandbox.state);
        table.sandboxes.insert(sandbox.id.clone(), sandbox);
    }

    fn remove(&self, table: &mut PoolTable, sandbox_id: &str) -> Option<Sandbox> {
        let sandbox = table.sandboxes.remove(sandbox_id)?;
        // Terminated stays counted as a running total
        if sandbox.state != SandboxState::Terminated {
            self.counts.leave(sandbox.state);
        }
        Some(sandbox)
    }

    fn persist_allocation(&self, allocation: &Allocation, first: bool) {
        let Some(store) = &self.store else { return };
        let result = if first {
            store.record_allocation(allocation)
        } else {
            store.update_allocation(allocation)
        };
        if let Err(e) = result {
            warn!("Failed to persist allocation {}: {}", allocation.id, e);
        }
    }

    /// Bind a sandbox exclusively to `run_id`.
    ///
    /// Reuses the least recently used idle sandbox, or provisions a new one
    /// while under `max_size`.
    pub async fn allocate(&self, run_id: &str) -> Result<Lease> {
        let (sandbox_id, needs_provisioning) = {
            let mut table = self.table.lock();

            if let Some(existing) = table.allocations.get(run_id) {
                error!(
                    "Run {} already holds sandbox {}; refusing second allocation",
                    run_id, existing.sandbox_id
                );
                return Err(Error::AllocationConflict(format!(
                    "run {} already holds sandbox {}",
                    run_id, existing.sandbox_id
                )));
            }

            let reusable = table
                .sandboxes
                .values()
                .filter(|s| s.is_allocatable())
                .min_by_key(|s| s.last_used_at.unwrap_or(s.created_at))
                .map(|s| s.id.clone());

            let picked = match reusable {
                Some(id) => {
                    let sandbox = table
                        .sandboxes
                        .get_mut(&id)
                        .ok_or_else(|| Error::not_found("sandbox", id.as_str()))?;
                    self.transition(sandbox, SandboxState::Allocated)?;
                    (id, false)
                }
                None if table.sandboxes.len() < self.config.max_size => {
                    let sandbox = Sandbox::new(self.config.resources.clone());
                    let id = sandbox.id.clone();
                    self.insert(&mut table, sandbox);
                    (id, true)
                }
                None => {
                    return Err(Error::PoolExhausted {
                        in_use: table.allocations.len(),
                        max_size: self.config.max_size,
                    })
                }
            };

            table
                .allocations
                .insert(run_id.to_string(), Allocation::new(&picked.0, run_id));
            picked
        };

        if needs_provisioning {
            match self.provision().await {
                Ok((container_id, endpoint)) => {
                    let mut table = self.table.lock();
                    if let Some(sandbox) = table.sandboxes.get_mut(&sandbox_id) {
                        sandbox.container_id = Some(container_id);
                        sandbox.endpoint = endpoint;
                        self.transition(sandbox, SandboxState::Allocated)?;
                    }
                }
                Err(e) => {
                    warn!("Provisioning sandbox for run {} failed: {}", run_id, e);
                    let mut table = self.table.lock();
                    table.allocations.remove(run_id);
                    self.remove(&mut table, &sandbox_id);
                    drop(table);
                    self.released.notify_waiters();
                    return Err(e);
                }
            }
        }

        if self.config.reset_on_allocate {
            if let Err(e) = self.reset(&sandbox_id).await {
                let mut table = self.table.lock();
                table.allocations.remove(run_id);
                drop(table);
                self.released.notify_waiters();
                return Err(e);
            }
        }

        let lease = {
            let mut table = self.table.lock();
            let allocation = table
                .allocations
                .get(run_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("allocation for run {} vanished", run_id)))?;
            let sandbox = table
                .sandboxes
                .get_mut(&sandbox_id)
                .ok_or_else(|| Error::not_found("sandbox", sandbox_id.as_str()))?;
            self.transition(sandbox, SandboxState::InUse)?;
            sandbox.last_used_at = Some(now());
            Lease {
                sandbox: sandbox.clone(),
                allocation,
            }
        };

        self.persist_allocation(&lease.allocation, true);
        info!("Allocated sandbox {} to run {}", lease.sandbox.id, run_id);
        Ok(lease)
    }

    /// `allocate`, waiting for a release while the pool is exhausted.
    ///
    /// Gives up with the last `PoolExhausted` after `timeout`.
    pub async fn acquire(
        &self,
        run_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let exhausted = match self.allocate(run_id).await {
                Err(e @ Error::PoolExhausted { .. }) => e,
                other => return other,
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("Run {} gave up waiting for a sandbox", run_id);
                return Err(exhausted);
            }
            debug!("Pool exhausted, run {} waiting for a release", run_id);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.acquire_backoff().min(remaining)) => {}
            }
        }
    }

    /// End the live allocation of `run_id` and return its sandbox to the pool.
    ///
    /// Unknown or already released runs are a no-op.
    pub async fn release(&self, run_id: &str) -> Result<ReleaseOutcome> {
        let (allocation, cleaning) = {
            let mut table = self.table.lock();
            let Some(mut allocation) = table.allocations.remove(run_id) else {
                debug!("Release for run {} is a no-op", run_id);
                return Ok(ReleaseOutcome::Noop);
            };
            allocation.released_at = Some(now());

            let cleaning = match table.sandboxes.get_mut(&allocation.sandbox_id) {
                Some(sandbox) if sandbox.state.can_transition_to(SandboxState::Cleaning) => {
                    self.transition(sandbox, SandboxState::Cleaning)?;
                    sandbox.container_id.clone()
                }
                _ => None,
            };
            (allocation, cleaning)
        };

        self.persist_allocation(&allocation, false);

        if let Some(container_id) = cleaning {
            let next = if self.config.reset_on_release {
                match self.reset_container(&container_id).await {
                    Ok(()) => SandboxState::Idle,
                    Err(e) => {
                        warn!(
                            "Reset of sandbox {} failed on release: {}",
                            allocation.sandbox_id, e
                        );
                        SandboxState::Unresponsive
                    }
                }
            } else {
                SandboxState::Idle
            };

            let mut table = self.table.lock();
            if let Some(sandbox) = table.sandboxes.get_mut(&allocation.sandbox_id) {
                if sandbox.state == SandboxState::Cleaning {
                    if next == SandboxState::Unresponsive {
                        sandbox.health = HealthStatus::Unresponsive;
                    }
                    self.transition(sandbox, next)?;
                }
            }
        }

        self.released.notify_waiters();
        info!(
            "Released sandbox {} from run {}",
            allocation.sandbox_id, run_id
        );
        Ok(ReleaseOutcome::Released(allocation))
    }

    /// Give a sandbox a fresh browser context without restarting it.
    ///
    /// A failed reset quarantines the sandbox.
    pub async fn reset(&self, sandbox_id: &str) -> Result<()> {
        let container_id = {
            let table = self.table.lock();
            let sandbox = table
                .sandboxes
                .get(sandbox_id)
                .ok_or_else(|| Error::not_found("sandbox", sandbox_id))?;
            sandbox.container_id.clone().ok_or_else(|| Error::SandboxUnhealthy {
                sandbox_id: sandbox_id.to_string(),
                reason: "not provisioned".into(),
            })?
        };

        if let Err(e) = self.reset_container(&container_id).await {
            let mut table = self.table.lock();
            if let Some(sandbox) = table.sandboxes.get_mut(sandbox_id) {
                sandbox.health = HealthStatus::Unresponsive;
                if sandbox.state != SandboxState::Unresponsive {
                    self.transition(sandbox, SandboxState::Unresponsive)?;
                }
            }
            return Err(Error::SandboxUnhealthy {
                sandbox_id: sandbox_id.to_string(),
                reason: format!("reset failed: {}", e),
            });
        }
        Ok(())
    }

    async fn reset_container(&self, container_id: &str) -> Result<()> {
        self.active_resets.fetch_add(1, Ordering::SeqCst);
        let result = self.runtime.reset_context(container_id).await;
        self.active_resets.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Create and start a container, returning its id and endpoint
    async fn provision(&self) -> Result<(String, Option<String>)> {
        let container_id = self
            .runtime
            .create(&self.config.image, &self.config.resources)
            .await?;

        let started = async {
            self.runtime.start(&container_id).await?;
            self.runtime.inspect(&container_id).await
        }
        .await;

        match started {
            Ok(info) => {
                debug!("Provisioned container {}", container_id);
                Ok((container_id, info.endpoint))
            }
            Err(e) => {
                if let Err(rm) = self.runtime.remove(&container_id).await {
                    warn!("Failed to remove half-provisioned {}: {}", container_id, rm);
                }
                Err(e)
            }
        }
    }

    /// Stop and remove a sandbox's container and drop it from the pool.
    ///
    /// Refused while a run holds the sandbox.
    pub async fn cleanup_container(&self, sandbox_id: &str) -> Result<()> {
        let container_id = {
            let mut table = self.table.lock();
            if let Some(holder) = table.holder_of(sandbox_id) {
                return Err(Error::AllocationConflict(format!(
                    "sandbox {} is held by run {}",
                    sandbox_id, holder.test_run_id
                )));
            }
            let sandbox = table
                .sandboxes
                .get_mut(sandbox_id)
                .ok_or_else(|| Error::not_found("sandbox", sandbox_id))?;
            self.transition(sandbox, SandboxState::Terminated)?;
            let container_id = sandbox.container_id.clone();
            self.remove(&mut table, sandbox_id);
            container_id
        };

        if let Some(container_id) = container_id {
            if let Err(e) = self.runtime.stop(&container_id).await {
                warn!("Failed to stop {}: {}", container_id, e);
            }
            self.runtime.remove(&container_id).await?;
        }

        self.released.notify_waiters();
        info!("Cleaned up sandbox {}", sandbox_id);
        Ok(())
    }

    /// Probe every provisioned sandbox once.
    ///
    /// `unhealthy_threshold` consecutive failures quarantine a sandbox;
    /// fewer mark it degraded; one good probe clears the count.
    pub async fn health_check(&self) -> HealthSummary {
        let targets: Vec<(String, String)> = {
            let table = self.table.lock();
            table
                .sandboxes
                .values()
                .filter(|s| {
                    !matches!(
                        s.state,
                        SandboxState::Created | SandboxState::Unresponsive | SandboxState::Terminated
                    )
                })
                .filter_map(|s| s.container_id.clone().map(|c| (s.id.clone(), c)))
                .collect()
        };

        let mut summary = HealthSummary::default();
        for (sandbox_id, container_id) in targets {
            let probe = self.runtime.health_probe(&container_id).await;
            summary.probed += 1;

            let mut table = self.table.lock();
            let Some(sandbox) = table.sandboxes.get_mut(&sandbox_id) else {
                continue;
            };

            match probe {
                Ok(HealthStatus::Healthy) => {
                    sandbox.consecutive_failures = 0;
                    sandbox.health = HealthStatus::Healthy;
                    summary.healthy += 1;
                }
                other => {
                    if let Err(e) = &other {
                        debug!("Probe of {} failed: {}", sandbox_id, e);
                    }
                    sandbox.consecutive_failures += 1;
                    if sandbox.consecutive_failures >= self.config.unhealthy_threshold {
                        warn!(
                            "Sandbox {} unresponsive after {} failed probes",
                            sandbox_id, sandbox.consecutive_failures
                        );
                        sandbox.health = HealthStatus::Unresponsive;
                        if sandbox.state != SandboxState::Unresponsive {
                            if let Err(e) = self.transition(sandbox, SandboxState::Unresponsive) {
                                error!("Cannot quarantine {}: {}", sandbox_id, e);
                            }
                        }
                        summary.unresponsive += 1;
                    } else {
                        sandbox.health = HealthStatus::Degraded;
                        summary.degraded += 1;
                    }
                }
            }
        }
        summary
    }

    /// End allocations older than `timeout` and quarantine their sandboxes,
    /// returning the run ids swept.
    ///
    /// The owning run may still be driving the container, so the sandbox is
    /// never returned to idle; `evict_unresponsive` tears it down.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let cutoff = now() - timeout.as_secs() as i64;
        let swept: Vec<Allocation> = {
            let mut table = self.table.lock();
            let stale: Vec<String> = table
                .allocations
                .values()
                .filter(|a| a.allocated_at < cutoff)
                .map(|a| a.test_run_id.clone())
                .collect();

            let mut swept = Vec::with_capacity(stale.len());
            for run_id in stale {
                let Some(mut allocation) = table.allocations.remove(&run_id) else {
                    continue;
                };
                allocation.released_at = Some(now());
                if let Some(sandbox) = table.sandboxes.get_mut(&allocation.sandbox_id) {
                    sandbox.health = HealthStatus::Unresponsive;
                    if let Err(e) = self.transition(sandbox, SandboxState::Unresponsive) {
                        error!("Cannot quarantine sandbox {}: {}", sandbox.id, e);
                    }
                }
                warn!(
                    "Allocation of sandbox {} to run {} went stale; sandbox quarantined",
                    allocation.sandbox_id, run_id
                );
                swept.push(allocation);
            }
            swept
        };

        for allocation in &swept {
            self.persist_allocation(allocation, false);
        }
        swept.into_iter().map(|a| a.test_run_id).collect()
    }

    /// Tear down quarantined sandboxes nobody holds, freeing their capacity
    pub async fn evict_unresponsive(&self) -> usize {
        let doomed: Vec<String> = {
            let table = self.table.lock();
            table
                .sandboxes
                .values()
                .filter(|s| s.state == SandboxState::Unresponsive)
                .filter(|s| table.holder_of(&s.id).is_none())
                .map(|s| s.id.clone())
                .collect()
        };

        let mut evicted = 0;
        for id in doomed {
            match self.cleanup_container(&id).await {
                Ok(()) => evicted += 1,
                Err(e) => warn!("Failed to evict sandbox {}: {}", id, e),
            }
        }
        evicted
    }

    /// Provision idle sandboxes until `min_idle` are available or the pool is full
    pub async fn warm_up(&self, min_idle: usize) -> Result<usize> {
        let mut provisioned = 0;
        loop {
            let sandbox_id = {
                let mut table = self.table.lock();
                let idle = table
                    .sandboxes
                    .values()
                    .filter(|s| s.is_allocatable())
                    .count();
                if idle >= min_idle || table.sandboxes.len() >= self.config.max_size {
                    break;
                }
                let sandbox = Sandbox::new(self.config.resources.clone());
                let id = sandbox.id.clone();
                self.insert(&mut table, sandbox);
                id
            };

            match self.provision().await {
                Ok((container_id, endpoint)) => {
                    let mut table = self.table.lock();
                    if let Some(sandbox) = table.sandboxes.get_mut(&sandbox_id) {
                        sandbox.container_id = Some(container_id);
                        sandbox.endpoint = endpoint;
                        self.transition(sandbox, SandboxState::Idle)?;
                    }
                    provisioned += 1;
                }
                Err(e) => {
                    let mut table = self.table.lock();
                    self.remove(&mut table, &sandbox_id);
                    return Err(e);
                }
            }
        }

        if provisioned > 0 {
            info!("Warmed up {} sandbox(es)", provisioned);
            self.released.notify_waiters();
        }
        Ok(provisioned)
    }

    /// Tear down every sandbox no run holds
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let table = self.table.lock();
            table
                .sandboxes
                .keys()
                .filter(|id| table.holder_of(id).is_none())
                .cloned()
                .collect()
        };
        for id in ids {
            if let Err(e) = self.cleanup_container(&id).await {
                warn!("Failed to clean up sandbox {} on shutdown: {}", id, e);
            }
        }
    }

    /// Counts by lifecycle state; lock-free
    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            created: self.counts.get(SandboxState::Created),
            idle: self.counts.get(SandboxState::Idle),
            allocated: self.counts.get(SandboxState::Allocated),
            in_use: self.counts.get(SandboxState::InUse),
            cleaning: self.counts.get(SandboxState::Cleaning),
            unresponsive: self.counts.get(SandboxState::Unresponsive),
            terminated: self.counts.get(SandboxState::Terminated),
            active_resets: self.active_resets.load(Ordering::SeqCst),
            config: self.config.clone(),
        }
    }

    /// Copy of every sandbox in the pool
    pub fn sandboxes(&self) -> Vec<Sandbox> {
        self.table.lock().sandboxes.values().cloned().collect()
    }

    pub fn get_sandbox(&self, sandbox_id: &str) -> Option<Sandbox> {
        self.table.lock().sandboxes.get(sandbox_id).cloned()
    }

    /// Live allocation held by `run_id`, if any
    pub fn allocation_for(&self, run_id: &str) -> Option<Allocation> {
        self.table.lock().allocations.get(run_id).cloned()
    }
}
