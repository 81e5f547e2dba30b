//! Top-level sandbox orchestration.
//!
//! One instance per control plane. Owns the conversation → sandbox
//! bindings: acquire-or-create with per-conversation serialization,
//! turn execution with crash recovery, per-sandbox proxy lifecycle,
//! and drain on shutdown. The GC consumes this as a [`SandboxCleanup`]
//! capability; the warm pool is consumed as a `SandboxSource`. Neither
//! side sees the other's concrete type.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::agent::{AgentClient, ExecuteRequest};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::endpoint::TransportEndpoint;
use crate::error::WorkspaceError;
use crate::events::{AgentEvent, RelayEvent};
use crate::gc::SandboxCleanup;
use crate::proxy::audit::EgressAudit;
use crate::proxy::rules::RuleSet;
use crate::proxy::{ProxyHandle, ProxyListener, ProxySettings};
use crate::registry::{Registry, SandboxRecord, SandboxStatus, now_ms};
use crate::relay::{RelayOptions, StreamOutcome, TurnRelay, pump};
use crate::runtime::SandboxRuntime;
use crate::sync::FileSync;
use crate::sync::debounce::{FlushFn, FlushScheduler};
use crate::warm_pool::SandboxSource;

/// Derive the sandbox's short name from its admin socket path
/// (`{run_root}/{name}/admin.sock`). Falls back to the runtime handle.
fn sandbox_name(record: &SandboxRecord) -> String {
    if let TransportEndpoint::Unix(path) = &record.proxy_endpoint
        && let Some(parent) = path.parent()
        && let Some(name) = parent.file_name()
    {
        return name.to_string_lossy().to_string();
    }
    record.sandbox_id.chars().take(12).collect()
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn SandboxRuntime>,
    source: Arc<dyn SandboxSource>,
    credentials: Arc<CredentialStore>,
    sync: Arc<FileSync>,
    flusher: FlushScheduler,
    audit: Arc<EgressAudit>,
    agent: AgentClient,
    proxies: tokio::sync::Mutex<HashMap<String, Arc<ProxyHandle>>>,
    conversation_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    turn_permits: Arc<Semaphore>,
    shutting_down: AtomicBool,
    active_sandboxes: AtomicI64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn SandboxRuntime>,
        source: Arc<dyn SandboxSource>,
        credentials: Arc<CredentialStore>,
        sync: Arc<FileSync>,
        audit: Arc<EgressAudit>,
    ) -> Arc<Self> {
        let flusher = FlushScheduler::new(config.storage.flush_debounce());
        let turn_permits = Arc::new(Semaphore::new(config.server.max_concurrent_sandboxes));
        Arc::new(Self {
            config,
            registry,
            runtime,
            source,
            credentials,
            sync,
            flusher,
            audit,
            agent: AgentClient::new(),
            proxies: tokio::sync::Mutex::new(HashMap::new()),
            conversation_locks: std::sync::Mutex::new(HashMap::new()),
            turn_permits,
            shutting_down: AtomicBool::new(false),
            active_sandboxes: AtomicI64::new(0),
        })
    }

    pub fn active_sandboxes(&self) -> i64 {
        self.active_sandboxes.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.conversation_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn workspace_dir(&self, record: &SandboxRecord) -> PathBuf {
        Path::new(&self.config.container.workspace_root).join(sandbox_name(record))
    }

    /// Look up or allocate the sandbox for a conversation. Serialized
    /// per conversation; at most one live sandbox per conversation.
    pub async fn get_or_create(
        &self,
        conversation_id: &str,
    ) -> Result<SandboxRecord, WorkspaceError> {
        if self.is_shutting_down() {
            return Err(WorkspaceError::ShuttingDown);
        }
        if conversation_id.is_empty() {
            return Err(WorkspaceError::InvalidConversation(
                conversation_id.to_string(),
            ));
        }

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;
        self.get_or_create_locked(conversation_id).await
    }

    async fn get_or_create_locked(
        &self,
        conversation_id: &str,
    ) -> Result<SandboxRecord, WorkspaceError> {
        let existing = self
            .registry
            .lookup(conversation_id)
            .await
            .map_err(|e| WorkspaceError::RegistryUnavailable(e.to_string()))?;

        if let Some(mut record) = existing {
            if self.runtime.probe(&record.agent_endpoint).await {
                let now = now_ms();
                self.registry
                    .touch(conversation_id, now, self.config.container.inactive_ttl())
                    .await
                    .map_err(|e| WorkspaceError::RegistryUnavailable(e.to_string()))?;
                record.last_active_at = now;
                self.ensure_proxy(&record).await?;
                debug!(conversation_id, sandbox_id = %record.sandbox_id, "reusing bound sandbox");
                return Ok(record);
            }

            warn!(
                conversation_id,
                sandbox_id = %record.sandbox_id,
                "bound sandbox failed its liveness probe, replacing"
            );
            if let Ok(logs) = self.runtime.logs(&record.sandbox_id, 50).await {
                debug!(sandbox_id = %record.sandbox_id, "sandbox tail logs:\n{logs}");
            }
            self.teardown_locked(conversation_id, &record, Some(self.flush_deadline()))
                .await;
        }

        // Allocate from the pool (or cold start) and bind atomically
        // under the conversation lock.
        let mut record = self.source.acquire().await?;
        record.conversation_id = conversation_id.to_string();
        record.status = SandboxStatus::Running;
        record.last_active_at = now_ms();

        self.registry
            .bind(&record, self.config.container.inactive_ttl())
            .await
            .map_err(|e| WorkspaceError::RegistryUnavailable(e.to_string()))?;
        if let Err(e) = self
            .registry
            .set_runtime_handle(conversation_id, &record.sandbox_id)
            .await
        {
            warn!("failed to write runtime handle: {e}");
        }

        // The proxy must be live before anything in the sandbox is
        // asked to do work; until now the sandbox had no egress at all.
        self.ensure_proxy(&record).await?;

        if !self.runtime.probe(&record.agent_endpoint).await {
            self.teardown_locked(conversation_id, &record, None).await;
            return Err(WorkspaceError::SandboxUnhealthy {
                sandbox_id: record.sandbox_id,
            });
        }

        self.active_sandboxes.fetch_add(1, Ordering::SeqCst);
        info!(conversation_id, sandbox_id = %record.sandbox_id, "bound sandbox");
        Ok(record)
    }

    /// Start (or confirm) the credential proxy for a bound sandbox.
    async fn ensure_proxy(&self, record: &SandboxRecord) -> Result<(), WorkspaceError> {
        let mut proxies = self.proxies.lock().await;
        if proxies.contains_key(&record.conversation_id) {
            return Ok(());
        }

        // Sidecar deployments run their own proxy; nothing to start
        // locally, the admin endpoint is remote.
        let TransportEndpoint::Unix(admin_path) = &record.proxy_endpoint else {
            return Ok(());
        };
        let Some(run_base) = admin_path.parent() else {
            return Err(WorkspaceError::TransientRuntime(format!(
                "malformed proxy endpoint: {}",
                record.proxy_endpoint
            )));
        };

        let settings = ProxySettings {
            sandbox_id: record.sandbox_id.clone(),
            egress: ProxyListener::Unix(run_base.join("mnt").join("egress.sock")),
            admin: ProxyListener::Unix(admin_path.clone()),
            rules: RuleSet::from_config(
                &self.config.proxy.domain_whitelist,
                &self.config.proxy.signing_hosts,
            ),
        };

        let handle = crate::proxy::spawn(
            settings,
            Arc::clone(&self.credentials),
            Arc::clone(&self.audit),
        )
        .await
        .map_err(|e| WorkspaceError::TransientRuntime(e.to_string()))?;

        proxies.insert(record.conversation_id.clone(), Arc::new(handle));
        Ok(())
    }

    /// Proxy handle for a conversation (admin pushes, tests).
    pub async fn proxy_handle(&self, conversation_id: &str) -> Option<Arc<ProxyHandle>> {
        self.proxies.lock().await.get(conversation_id).cloned()
    }

    async fn stop_proxy(&self, conversation_id: &str) {
        let handle = self.proxies.lock().await.remove(conversation_id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    fn flush_deadline(&self) -> Duration {
        self.config.container.grace_period()
    }

    /// Run one agent turn, streaming relay events to the returned
    /// receiver. The stream ends with exactly one `done` or one
    /// `error`; a mid-turn sandbox crash surfaces as a
    /// `container_recovered` event followed by the retried turn.
    pub fn execute(
        self: &Arc<Self>,
        conversation_id: &str,
        request: ExecuteRequest,
    ) -> mpsc::Receiver<RelayEvent> {
        let (mut relay, rx) = TurnRelay::channel(64);
        let this = Arc::clone(self);
        let conversation_id = conversation_id.to_string();

        tokio::spawn(async move {
            if this.is_shutting_down() {
                relay.emit_error(&WorkspaceError::ShuttingDown).await;
                return;
            }

            let _permit = match this.turn_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    relay.emit_error(&WorkspaceError::ShuttingDown).await;
                    return;
                }
            };

            let turn_timeout = this.config.container.execution_timeout();
            let outcome = tokio::time::timeout(
                turn_timeout,
                this.turn_attempts(&conversation_id, &request, &mut relay),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    relay.emit_error(&err).await;
                }
                Err(_) => {
                    relay
                        .emit_error(&WorkspaceError::ExecutionTimeout(turn_timeout))
                        .await;
                    // Partial artifacts produced before the abort are
                    // still flushed, bounded by the grace period.
                    if let Ok(Some(record)) = this.registry.lookup(&conversation_id).await {
                        let workspace_dir = this.workspace_dir(&record);
                        let _ = tokio::time::timeout(
                            this.flush_deadline(),
                            this.sync.sync_out(&conversation_id, &workspace_dir),
                        )
                        .await;
                    }
                    this.finish_turn(&conversation_id).await;
                }
            }
        });

        rx
    }

    /// The retry loop for a turn: at most one crash recovery, with the
    /// user's input re-sent exactly once.
    async fn turn_attempts(
        &self,
        conversation_id: &str,
        request: &ExecuteRequest,
        relay: &mut TurnRelay,
    ) -> Result<(), WorkspaceError> {
        let mut recovered = false;
        loop {
            let record = self.get_or_create(conversation_id).await?;
            let workspace_dir = self.workspace_dir(&record);

            // Sync-in must complete before the agent executes; an
            // unavailable object store degrades to a warning.
            match self.sync.sync_in(conversation_id, &workspace_dir).await {
                Ok(report) if report.skipped => {
                    debug!(conversation_id, "sync-in skipped (no object store)")
                }
                Ok(report) => debug!(conversation_id, fetched = report.fetched, "sync-in done"),
                Err(e) => warn!(conversation_id, "sync-in failed, continuing: {e}"),
            }

            let _ = self
                .registry
                .set_status(conversation_id, SandboxStatus::Running)
                .await;

            let stream = match self.agent.execute(&record.agent_endpoint, request).await {
                Ok(stream) => stream,
                Err(e) => {
                    if !recovered {
                        recovered = true;
                        relay.emit(AgentEvent::recovered(&e.to_string())).await;
                        self.replace_sandbox(conversation_id).await;
                        continue;
                    }
                    self.destroy(conversation_id).await.ok();
                    return Err(e);
                }
            };

            let options = RelayOptions {
                idle_stream_timeout: self.config.container.idle_stream_timeout(),
            };
            // Mid-run flushes are scheduled the moment a tool_result is
            // observed, off the delivery path, debounced per sandbox.
            let flush = self.flush_fn(conversation_id, &workspace_dir);
            let flusher = self.flusher.clone();
            let sandbox_key = record.sandbox_id.clone();
            let on_tool_result = move || {
                let flusher = flusher.clone();
                let flush = flush.clone();
                let key = sandbox_key.clone();
                tokio::spawn(async move {
                    flusher.trigger(&key, flush).await;
                });
            };

            let outcome = pump(stream, relay, &options, on_tool_result).await;

            match outcome {
                StreamOutcome::Completed { failed } => {
                    if failed {
                        debug!(conversation_id, "agent reported terminal error");
                    }
                    self.flusher.settle(&record.sandbox_id).await;
                    let _ = self.sync.sync_out(conversation_id, &workspace_dir).await;
                    self.finish_turn(conversation_id).await;
                    return Ok(());
                }
                broken => {
                    let reason = match broken {
                        StreamOutcome::IdleTimeout => {
                            "no agent events within the idle-stream timeout".to_string()
                        }
                        StreamOutcome::Disconnected(reason) => reason,
                        StreamOutcome::Completed { .. } => unreachable!(),
                    };
                    warn!(conversation_id, reason, "agent stream broke mid-turn");
                    if !recovered {
                        recovered = true;
                        relay.emit(AgentEvent::recovered(&reason)).await;
                        self.replace_sandbox(conversation_id).await;
                        continue;
                    }
                    self.destroy(conversation_id).await.ok();
                    return Err(WorkspaceError::AgentDisconnect(reason));
                }
            }
        }
    }

    fn flush_fn(&self, conversation_id: &str, workspace_dir: &Path) -> FlushFn {
        let sync = Arc::clone(&self.sync);
        let conversation_id = conversation_id.to_string();
        let workspace_dir = workspace_dir.to_path_buf();
        Arc::new(move || {
            let sync = Arc::clone(&sync);
            let conversation_id = conversation_id.clone();
            let workspace_dir = workspace_dir.clone();
            Box::pin(async move {
                sync.sync_out(&conversation_id, &workspace_dir).await?;
                Ok(())
            })
        })
    }

    /// Mark the turn finished: status idle, TTL refreshed.
    async fn finish_turn(&self, conversation_id: &str) {
        let _ = self
            .registry
            .set_status(conversation_id, SandboxStatus::Idle)
            .await;
        let _ = self
            .registry
            .touch(
                conversation_id,
                now_ms(),
                self.config.container.inactive_ttl(),
            )
            .await;
    }

    /// Crash-recovery replacement: destroy the broken sandbox (files
    /// flush best-effort) so the retry allocates a fresh one and
    /// sync-in restores state from the object store.
    async fn replace_sandbox(&self, conversation_id: &str) {
        if let Err(e) = self.destroy(conversation_id).await {
            warn!(conversation_id, "failed to tear down broken sandbox: {e}");
        }
    }

    /// Explicitly destroy a conversation's sandbox: drain, stop the
    /// proxy, sync files out, remove the sandbox and the binding.
    pub async fn destroy(&self, conversation_id: &str) -> Result<(), WorkspaceError> {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        let record = self
            .registry
            .lookup(conversation_id)
            .await
            .map_err(|e| WorkspaceError::RegistryUnavailable(e.to_string()))?;
        let Some(record) = record else {
            // Binding already gone (GC raced us); make sure no proxy
            // lingers.
            self.stop_proxy(conversation_id).await;
            return Ok(());
        };

        self.teardown_locked(conversation_id, &record, None).await;
        Ok(())
    }

    /// Teardown under the conversation lock. `flush_deadline` bounds
    /// the sync-out on GC/replacement paths; explicit destroys wait.
    async fn teardown_locked(
        &self,
        conversation_id: &str,
        record: &SandboxRecord,
        flush_deadline: Option<Duration>,
    ) {
        let _ = self
            .registry
            .set_status(conversation_id, SandboxStatus::Draining)
            .await;

        self.stop_proxy(conversation_id).await;

        let workspace_dir = self.workspace_dir(record);
        let flush = self.sync.sync_out(conversation_id, &workspace_dir);
        let flushed = match flush_deadline {
            Some(deadline) => tokio::time::timeout(deadline, flush)
                .await
                .unwrap_or_else(|_| {
                    warn!(conversation_id, "sync-out deadline elapsed during teardown");
                    Ok(Default::default())
                }),
            None => flush.await,
        };
        if let Err(e) = flushed {
            warn!(conversation_id, "sync-out failed during teardown: {e}");
        }

        if let Err(e) = self
            .runtime
            .destroy(&record.sandbox_id, self.config.container.grace_period())
            .await
        {
            warn!(sandbox_id = %record.sandbox_id, "sandbox destroy failed: {e}");
        }

        let _ = self.registry.remove(conversation_id).await;
        let _ = self.registry.remove_runtime_handle(conversation_id).await;

        // Host-side workspace and socket trees.
        let _ = tokio::fs::remove_dir_all(&workspace_dir).await;
        if let TransportEndpoint::Unix(admin_path) = &record.proxy_endpoint
            && let Some(run_base) = admin_path.parent()
        {
            let _ = tokio::fs::remove_dir_all(run_base).await;
        }

        self.active_sandboxes.fetch_sub(1, Ordering::SeqCst);
        info!(conversation_id, sandbox_id = %record.sandbox_id, "sandbox destroyed");
    }

    /// Ordered drain of every sandbox on shutdown, bounded by the
    /// configured deadline; leftovers are force-destroyed.
    pub async fn destroy_all(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = self.config.server.shutdown_timeout();

        let bindings = self.registry.bindings().await.unwrap_or_default();
        info!(count = bindings.len(), "draining sandboxes for shutdown");

        let mut handles = Vec::new();
        for record in bindings {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _ = this.destroy(&record.conversation_id).await;
            }));
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("shutdown deadline elapsed, force-destroying leftovers");
            if let Ok(sandboxes) = self.runtime.list().await {
                for sandbox in sandboxes {
                    let _ = self
                        .runtime
                        .destroy(&sandbox.sandbox_id, Duration::from_secs(1))
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl SandboxCleanup for Orchestrator {
    async fn destroy_conversation(&self, conversation_id: &str) -> Result<()> {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;
        let Some(record) = self.registry.lookup(conversation_id).await? else {
            return Ok(());
        };
        // GC-driven: the file flush gets a bounded deadline.
        self.teardown_locked(conversation_id, &record, Some(self.flush_deadline()))
            .await;
        Ok(())
    }

    async fn destroy_orphan(&self, sandbox_id: &str) -> Result<()> {
        self.runtime
            .destroy(sandbox_id, self.config.container.grace_period())
            .await
    }
}
