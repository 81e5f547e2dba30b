//! Garbage collection of expired and orphaned sandboxes.
//!
//! Every cycle enumerates the registry and reaps bindings past their
//! inactivity or absolute TTL, or failing their health probe. A sandbox
//! mid-turn (`running`) is never touched. Every Nth cycle, runtime
//! sandboxes carrying workspace labels but no registry entry are reaped
//! too, once they age past the orphan-safety threshold. GC errors are
//! logged and metered, never surfaced to callers.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::registry::{Registry, SandboxRecord, SandboxStatus, now_ms};
use crate::runtime::SandboxRuntime;

/// Destruction capability the GC borrows from the orchestrator, so the
/// two components never hold each other's concrete types.
#[async_trait]
pub trait SandboxCleanup: Send + Sync {
    /// Drain and destroy a bound sandbox (serialized with the
    /// conversation's own operations).
    async fn destroy_conversation(&self, conversation_id: &str) -> Result<()>;
    /// Destroy a runtime sandbox that has no binding.
    async fn destroy_orphan(&self, sandbox_id: &str) -> Result<()>;
}

/// What one GC cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub examined: usize,
    pub reaped: Vec<String>,
    pub orphans_reaped: Vec<String>,
}

pub struct GarbageCollector {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn SandboxRuntime>,
    cleanup: Arc<dyn SandboxCleanup>,
    config: Arc<Config>,
    cycle: AtomicU64,
}

impl GarbageCollector {
    pub fn new(
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn SandboxRuntime>,
        cleanup: Arc<dyn SandboxCleanup>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            runtime,
            cleanup,
            config,
            cycle: AtomicU64::new(0),
        })
    }

    /// Decide whether a binding should be reaped, and why. A running
    /// sandbox is never a victim; the inactivity comparison is strict,
    /// so a sandbox at exactly `inactive_ttl` is still reusable.
    pub fn should_destroy(
        &self,
        record: &SandboxRecord,
        now: i64,
        healthy: bool,
    ) -> Option<&'static str> {
        if record.status == SandboxStatus::Running {
            return None;
        }
        if record.idle_for(now) > self.config.container.inactive_ttl() {
            return Some("inactive");
        }
        if record.age(now) > self.config.container.absolute_ttl() {
            return Some("absolute-ttl");
        }
        if !healthy {
            return Some("unhealthy");
        }
        None
    }

    /// One full GC pass. Returns a report for observability and tests.
    pub async fn cycle_once(&self) -> GcReport {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let now = now_ms();
        let mut report = GcReport::default();

        let bindings = match self.registry.bindings().await {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!("gc could not enumerate registry: {e}");
                return report;
            }
        };
        report.examined = bindings.len();

        for record in &bindings {
            let healthy = self.runtime.probe(&record.agent_endpoint).await;
            let Some(reason) = self.should_destroy(record, now, healthy) else {
                continue;
            };
            info!(
                conversation_id = %record.conversation_id,
                sandbox_id = %record.sandbox_id,
                reason,
                "gc reaping sandbox"
            );
            match self
                .cleanup
                .destroy_conversation(&record.conversation_id)
                .await
            {
                Ok(()) => report.reaped.push(record.conversation_id.clone()),
                Err(e) => warn!(
                    conversation_id = %record.conversation_id,
                    "gc destroy failed: {e}"
                ),
            }
        }

        if cycle % self.config.gc.orphan_cycle == 0 {
            self.reap_orphans(now, &mut report).await;
        }

        debug!(
            cycle,
            examined = report.examined,
            reaped = report.reaped.len(),
            orphans = report.orphans_reaped.len(),
            "gc cycle complete"
        );
        report
    }

    /// Remove runtime sandboxes with workspace labels but no registry
    /// record, once older than the safety threshold. Warm-pool members
    /// have registry side-records and are not orphans.
    async fn reap_orphans(&self, now: i64, report: &mut GcReport) {
        let sandboxes = match self.runtime.list().await {
            Ok(sandboxes) => sandboxes,
            Err(e) => {
                warn!("gc could not list runtime sandboxes: {e}");
                return;
            }
        };

        let mut known: HashSet<String> = HashSet::new();
        if let Ok(bindings) = self.registry.bindings().await {
            known.extend(bindings.into_iter().map(|record| record.sandbox_id));
        }
        if let Ok(warm_ids) = self.registry.warm_ids().await {
            known.extend(warm_ids);
        }

        let safety_ms = self.config.gc.orphan_safety().as_millis() as i64;
        for sandbox in sandboxes {
            if known.contains(&sandbox.sandbox_id) {
                continue;
            }
            let age_ms = now - sandbox.created_at_ms;
            if age_ms <= safety_ms {
                continue;
            }
            info!(
                sandbox_id = %sandbox.sandbox_id,
                age_secs = age_ms / 1000,
                "gc reaping orphan sandbox"
            );
            match self.cleanup.destroy_orphan(&sandbox.sandbox_id).await {
                Ok(()) => report.orphans_reaped.push(sandbox.sandbox_id),
                Err(e) => warn!(sandbox_id = %sandbox.sandbox_id, "orphan destroy failed: {e}"),
            }
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gc.interval());
        ticker.tick().await; // immediate first tick is skipped
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("gc loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
