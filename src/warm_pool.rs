//! Warm pool of pre-provisioned sandboxes.
//!
//! Acquisition pops atomically from the shared registry queue so no two
//! concurrent acquirers ever see the same sandbox. Misses fall through
//! to on-demand creation (a cold start), never to a user-visible error.
//! Replenishment runs in tracked background tasks with exponential
//! backoff; sizing hot-reloads from a registry key each cycle.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, ContainerConfig, PoolSizing, WarmPoolConfig};
use crate::error::WorkspaceError;
use crate::registry::{ManagerType, Registry, SandboxRecord, SandboxStatus, now_ms};
use crate::runtime::{SandboxRuntime, SandboxSpec};

/// Capability the orchestrator consumes: hand out one unbound, healthy
/// sandbox.
#[async_trait]
pub trait SandboxSource: Send + Sync {
    async fn acquire(&self) -> Result<SandboxRecord, WorkspaceError>;
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub warm_count: usize,
    pub min_size: usize,
    pub target_size: usize,
    pub max_size: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool: {}/{} warm (min {}, max {})",
            self.warm_count, self.target_size, self.min_size, self.max_size
        )
    }
}

/// Warm pool manager.
pub struct WarmPool {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn SandboxRuntime>,
    container: ContainerConfig,
    pool: WarmPoolConfig,
    manager_type: ManagerType,
    sizing: RwLock<PoolSizing>,
    /// Caps concurrent creations, pooled and on-demand alike.
    create_semaphore: Arc<Semaphore>,
    replenishing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Weak self-handle so acquisition (behind `dyn SandboxSource`)
    /// can schedule tracked replenish tasks.
    self_ref: std::sync::Weak<WarmPool>,
}

impl WarmPool {
    pub fn new(
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn SandboxRuntime>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let manager_type: ManagerType = config.container.manager_type.parse()?;
        Ok(Arc::new_cyclic(|weak| Self {
            registry,
            runtime,
            container: config.container.clone(),
            pool: config.warm_pool.clone(),
            manager_type,
            sizing: RwLock::new(config.warm_pool.sizing()),
            create_semaphore: Arc::new(Semaphore::new(config.warm_pool.max_concurrent_creates)),
            replenishing: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        }))
    }

    /// Current sizing: the registry key wins over the static config so
    /// operators can resize without a restart. Takes effect on the next
    /// replenish cycle.
    pub async fn reload_sizing(&self) -> PoolSizing {
        let sizing = match self.registry.pool_sizing().await {
            Ok(Some(sizing)) => sizing,
            Ok(None) => self.pool.sizing(),
            Err(e) => {
                warn!("failed to read pool sizing key: {e}");
                self.pool.sizing()
            }
        };
        *self.sizing.write().await = sizing;
        sizing
    }

    pub async fn stats(&self) -> PoolStats {
        let sizing = *self.sizing.read().await;
        PoolStats {
            warm_count: self.registry.warm_len().await.unwrap_or(0),
            min_size: sizing.min_size,
            target_size: sizing.target_size,
            max_size: sizing.max_size,
        }
    }

    /// Bring the pool up to `target_size` in parallel, bounded by the
    /// creation semaphore. Idempotent: a second call finds nothing to
    /// do.
    pub async fn preheat(self: &Arc<Self>) -> Result<()> {
        let sizing = self.reload_sizing().await;
        let current = self.registry.warm_len().await.unwrap_or(0);
        let needed = sizing.target_size.saturating_sub(current);
        if needed == 0 {
            return Ok(());
        }
        info!(needed, "preheating warm pool");

        let mut handles = Vec::new();
        for _ in 0..needed {
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                match pool.create_with_backoff().await {
                    Ok(record) => {
                        if let Err(e) = pool.registry.push_warm(&record).await {
                            warn!("failed to enqueue warm sandbox: {e}");
                            let _ = pool
                                .runtime
                                .destroy(&record.sandbox_id, pool.container.grace_period())
                                .await;
                        }
                    }
                    Err(e) => warn!("preheat creation failed: {e}"),
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let warm = self.registry.warm_len().await.unwrap_or(0);
        info!(warm, "warm pool preheated");
        Ok(())
    }

    /// Top the queue back up to `min_size`, evicting entries that aged
    /// past the pool idle TTL first. Only one replenish runs at a time.
    pub async fn replenish(&self) {
        if self
            .replenishing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let sizing = self.reload_sizing().await;
        self.evict_stale().await;

        loop {
            let warm = match self.registry.warm_len().await {
                Ok(len) => len,
                Err(e) => {
                    warn!("replenish could not read pool length: {e}");
                    break;
                }
            };
            if warm >= sizing.min_size || warm >= sizing.max_size {
                break;
            }
            match self.create_with_backoff().await {
                Ok(record) => {
                    if let Err(e) = self.registry.push_warm(&record).await {
                        warn!("failed to enqueue warm sandbox: {e}");
                        let _ = self
                            .runtime
                            .destroy(&record.sandbox_id, self.container.grace_period())
                            .await;
                        break;
                    }
                }
                Err(e) => {
                    // Surfaces as cold starts, never as a user error.
                    warn!("replenish creation failed: {e}");
                    break;
                }
            }
        }

        self.replenishing.store(false, Ordering::SeqCst);
    }

    async fn evict_stale(&self) {
        let idle_ttl = self.pool.idle_ttl();
        let now = now_ms();
        let ids = match self.registry.warm_ids().await {
            Ok(ids) => ids,
            Err(_) => return,
        };
        for id in ids {
            let Ok(Some(record)) = self.registry.warm_record(&id).await else {
                continue;
            };
            if record.age(now) > idle_ttl {
                debug!(sandbox_id = id, "evicting stale warm sandbox");
                let _ = self.registry.remove_warm(&id).await;
                let _ = self
                    .runtime
                    .destroy(&id, self.container.grace_period())
                    .await;
            }
        }
    }

    /// Kick off a tracked background replenish.
    pub async fn spawn_replenish(&self) {
        let Some(pool) = self.self_ref.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            pool.replenish().await;
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Wait for tracked background tasks to finish (tests, shutdown).
    pub async fn join_background_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Destroy every pooled sandbox (shutdown path).
    pub async fn drain(&self) {
        while let Ok(Some(record)) = self.registry.pop_warm().await {
            let _ = self
                .runtime
                .destroy(&record.sandbox_id, self.container.grace_period())
                .await;
        }
    }

    /// One creation attempt: create, start, and wait for the agent to
    /// come up, all within the per-attempt budget.
    async fn create_warm_sandbox(&self) -> Result<SandboxRecord> {
        let _permit = self
            .create_semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("pool is shutting down"))?;

        let name = format!("ws-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let spec = SandboxSpec::from_config(&self.container, &name)?;

        let created = tokio::time::timeout(self.pool.create_timeout(), async {
            let sandbox = self.runtime.create(&spec).await?;
            self.runtime.start(&sandbox.sandbox_id).await?;
            self.runtime
                .wait_ready(&sandbox.agent_endpoint, self.pool.create_timeout())
                .await?;
            anyhow::Ok(sandbox)
        })
        .await
        .map_err(|_| anyhow::anyhow!("sandbox creation timed out"))??;

        Ok(SandboxRecord {
            sandbox_id: created.sandbox_id,
            conversation_id: String::new(),
            agent_endpoint: created.agent_endpoint,
            proxy_endpoint: crate::endpoint::TransportEndpoint::Unix(spec.paths.admin_sock.clone()),
            created_at: spec.created_at_ms,
            last_active_at: now_ms(),
            status: SandboxStatus::Warm,
            manager_type: self.manager_type,
        })
    }

    /// Creation with exponential backoff on transient runtime errors.
    async fn create_with_backoff(&self) -> Result<SandboxRecord, WorkspaceError> {
        const ATTEMPTS: u32 = 3;
        let mut delay = Duration::from_millis(500);
        let mut last_error = String::new();
        for attempt in 1..=ATTEMPTS {
            match self.create_warm_sandbox().await {
                Ok(record) => return Ok(record),
                Err(e) => {
                    last_error = e.to_string();
                    debug!(attempt, "sandbox creation attempt failed: {last_error}");
                    if attempt < ATTEMPTS {
                        let jitter =
                            Duration::from_millis(rand::thread_rng().gen_range(0..250));
                        tokio::time::sleep(delay + jitter).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(WorkspaceError::CreateFailed {
            attempts: ATTEMPTS,
            reason: last_error,
        })
    }
}

#[async_trait]
impl SandboxSource for WarmPool {
    /// Pop one warm sandbox; discard entries that fail their health
    /// check (up to the configured retries) and fall back to on-demand
    /// creation. Always schedules an async replenish.
    async fn acquire(&self) -> Result<SandboxRecord, WorkspaceError> {
        for _ in 0..=self.pool.acquire_retries {
            let popped = self
                .registry
                .pop_warm()
                .await
                .map_err(|e| WorkspaceError::RegistryUnavailable(e.to_string()))?;
            let Some(record) = popped else { break };

            if self.runtime.probe(&record.agent_endpoint).await {
                self.spawn_replenish().await;
                debug!(sandbox_id = %record.sandbox_id, "warm pool hit");
                return Ok(record);
            }

            warn!(sandbox_id = %record.sandbox_id, "discarding unhealthy warm sandbox");
            let _ = self
                .runtime
                .destroy(&record.sandbox_id, self.container.grace_period())
                .await;
        }

        self.spawn_replenish().await;
        debug!("warm pool miss, creating on demand");
        self.create_with_backoff().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TransportEndpoint;
    use crate::registry::MemoryRegistry;
    use crate::runtime::MockRuntime;

    fn test_config(dir: &std::path::Path, min: usize, target: usize, max: usize) -> Config {
        let mut config = Config::default();
        config.container.workspace_root = dir.join("ws").to_string_lossy().to_string();
        config.container.run_root = dir.join("run").to_string_lossy().to_string();
        config.warm_pool.min_size = min;
        config.warm_pool.target_size = target;
        config.warm_pool.max_size = max;
        config.warm_pool.create_timeout_secs = 5;
        config
    }

    fn test_runtime() -> Arc<MockRuntime> {
        Arc::new(MockRuntime::new(TransportEndpoint::Http(
            "http://127.0.0.1:1".into(),
        )))
    }

    #[tokio::test]
    async fn test_preheat_reaches_target() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime.clone() as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 1, 3, 10),
        )
        .unwrap();

        pool.preheat().await.unwrap();
        assert_eq!(registry.warm_len().await.unwrap(), 3);
        assert_eq!(runtime.live_count(), 3);
    }

    #[tokio::test]
    async fn test_preheat_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime.clone() as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 1, 3, 10),
        )
        .unwrap();

        pool.preheat().await.unwrap();
        pool.preheat().await.unwrap();
        assert_eq!(registry.warm_len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_acquire_pops_warm_entry_and_replenishes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime.clone() as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 2, 3, 10),
        )
        .unwrap();
        pool.preheat().await.unwrap();

        let record = pool.acquire().await.unwrap();
        assert!(record.conversation_id.is_empty());
        assert_eq!(record.status, SandboxStatus::Warm);

        pool.join_background_tasks().await;
        // Replenish restored the floor.
        assert!(registry.warm_len().await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_acquire_miss_creates_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime.clone() as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 0, 0, 10),
        )
        .unwrap();

        let record = pool.acquire().await.unwrap();
        assert!(record.sandbox_id.starts_with("mock-ws-"));
        assert_eq!(runtime.live_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_discards_unhealthy_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let endpoint = TransportEndpoint::Http("http://127.0.0.1:1".into());
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime.clone() as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 0, 2, 10),
        )
        .unwrap();
        pool.preheat().await.unwrap();

        // Every pooled sandbox shares the mock endpoint; mark it down.
        runtime.set_endpoint_health(&endpoint, false);
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), "create-failed");

        // The broken entries were discarded, not handed out.
        assert_eq!(registry.warm_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_surfaces_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        runtime.fail_next_creates(100);
        let pool = WarmPool::new(
            registry as Arc<dyn Registry>,
            runtime as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 0, 0, 10),
        )
        .unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CreateFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_sizing_hot_reload_from_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 1, 2, 5),
        )
        .unwrap();

        registry
            .set_pool_sizing(&PoolSizing {
                min_size: 4,
                target_size: 6,
                max_size: 8,
            })
            .await
            .unwrap();

        let sizing = pool.reload_sizing().await;
        assert_eq!(sizing.target_size, 6);
        pool.preheat().await.unwrap();
        assert_eq!(registry.warm_len().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_drain_destroys_all_warm_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = test_runtime();
        let pool = WarmPool::new(
            registry.clone() as Arc<dyn Registry>,
            runtime.clone() as Arc<dyn SandboxRuntime>,
            &test_config(dir.path(), 1, 3, 10),
        )
        .unwrap();
        pool.preheat().await.unwrap();

        pool.drain().await;
        assert_eq!(registry.warm_len().await.unwrap(), 0);
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_stats_display() {
        let stats = PoolStats {
            warm_count: 2,
            min_size: 1,
            target_size: 3,
            max_size: 10,
        };
        let display = format!("{}", stats);
        assert!(display.contains("2/3 warm"));
        assert!(display.contains("min 1"));
    }
}
