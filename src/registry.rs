//! Sandbox registry backed by a Redis-class KV store.
//!
//! The registry is the source of truth for conversation bindings and
//! the warm-pool queue. The control plane holds no durable state of its
//! own; on startup it reconciles against whatever the KV and the
//! container runtime report.
//!
//! Key layout:
//! - `workspace:container:{conversation_id}`: binding hash, TTL =
//!   inactive_ttl, refreshed on every successful turn
//! - `workspace:warm_pool`: FIFO list of warm sandbox ids
//! - `workspace:warm_pool:{sandbox_id}`: full record per warm id
//! - `workspace:warm_pool:config`: hot-reloadable pool sizing
//! - `workspace:runtime_handle:{conversation_id}`: backend-native
//!   handle for orphan resolution

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::config::PoolSizing;
use crate::endpoint::TransportEndpoint;

const BINDING_PREFIX: &str = "workspace:container:";
const WARM_POOL_KEY: &str = "workspace:warm_pool";
const WARM_ENTRY_PREFIX: &str = "workspace:warm_pool:";
const POOL_CONFIG_KEY: &str = "workspace:warm_pool:config";
const RUNTIME_HANDLE_PREFIX: &str = "workspace:runtime_handle:";

/// Current epoch milliseconds. All registry timestamps use this clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sandbox lifecycle state as persisted in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Warm,
    Running,
    Idle,
    Draining,
    Destroyed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Warm => "warm",
            SandboxStatus::Running => "running",
            SandboxStatus::Idle => "idle",
            SandboxStatus::Draining => "draining",
            SandboxStatus::Destroyed => "destroyed",
        }
    }
}

impl FromStr for SandboxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "warm" => Ok(SandboxStatus::Warm),
            "running" => Ok(SandboxStatus::Running),
            "idle" => Ok(SandboxStatus::Idle),
            "draining" => Ok(SandboxStatus::Draining),
            "destroyed" => Ok(SandboxStatus::Destroyed),
            other => bail!("unknown sandbox status: {other:?}"),
        }
    }
}

/// Which runtime backend owns a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerType {
    Docker,
    Podman,
}

impl ManagerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerType::Docker => "docker",
            ManagerType::Podman => "podman",
        }
    }
}

impl FromStr for ManagerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(ManagerType::Docker),
            "podman" => Ok(ManagerType::Podman),
            other => bail!("unknown manager type: {other:?}. Valid options: docker, podman"),
        }
    }
}

impl std::fmt::Display for ManagerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of ownership: one sandbox, bound to at most one
/// conversation at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRecord {
    pub sandbox_id: String,
    /// Empty while the sandbox sits in the warm pool.
    pub conversation_id: String,
    pub agent_endpoint: TransportEndpoint,
    /// Admin endpoint of the credential proxy.
    pub proxy_endpoint: TransportEndpoint,
    pub created_at: i64,
    pub last_active_at: i64,
    pub status: SandboxStatus,
    pub manager_type: ManagerType,
}

impl SandboxRecord {
    /// Flatten into the string map stored as a registry hash.
    pub fn to_map(&self) -> Vec<(String, String)> {
        vec![
            ("sandbox_id".into(), self.sandbox_id.clone()),
            ("conversation_id".into(), self.conversation_id.clone()),
            ("agent_endpoint".into(), self.agent_endpoint.to_string()),
            ("proxy_endpoint".into(), self.proxy_endpoint.to_string()),
            ("created_at".into(), self.created_at.to_string()),
            ("last_active_at".into(), self.last_active_at.to_string()),
            ("status".into(), self.status.as_str().into()),
            ("manager_type".into(), self.manager_type.as_str().into()),
        ]
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| -> Result<&String> {
            map.get(name)
                .with_context(|| format!("registry record missing field {name:?}"))
        };
        Ok(Self {
            sandbox_id: field("sandbox_id")?.clone(),
            conversation_id: map.get("conversation_id").cloned().unwrap_or_default(),
            agent_endpoint: TransportEndpoint::parse(field("agent_endpoint")?)?,
            proxy_endpoint: TransportEndpoint::parse(field("proxy_endpoint")?)?,
            created_at: field("created_at")?.parse()?,
            last_active_at: field("last_active_at")?.parse()?,
            status: field("status")?.parse()?,
            manager_type: field("manager_type")?.parse()?,
        })
    }

    pub fn age(&self, now: i64) -> Duration {
        Duration::from_millis((now - self.created_at).max(0) as u64)
    }

    pub fn idle_for(&self, now: i64) -> Duration {
        Duration::from_millis((now - self.last_active_at).max(0) as u64)
    }
}

/// Registry operations the core needs from the KV store. Atomicity
/// requirements: `pop_warm` must never hand the same id to two
/// concurrent acquirers; binding writes go through the conversation's
/// current owner (or the GC during destruction).
#[async_trait]
pub trait Registry: Send + Sync {
    // Conversation bindings.
    async fn bind(&self, record: &SandboxRecord, ttl: Duration) -> Result<()>;
    async fn lookup(&self, conversation_id: &str) -> Result<Option<SandboxRecord>>;
    /// Refresh `last_active_at` and the binding's TTL.
    async fn touch(&self, conversation_id: &str, last_active_ms: i64, ttl: Duration) -> Result<()>;
    async fn set_status(&self, conversation_id: &str, status: SandboxStatus) -> Result<()>;
    async fn remove(&self, conversation_id: &str) -> Result<()>;
    async fn bindings(&self) -> Result<Vec<SandboxRecord>>;

    // Warm pool.
    async fn push_warm(&self, record: &SandboxRecord) -> Result<()>;
    /// Atomic pop from the front of the queue.
    async fn pop_warm(&self) -> Result<Option<SandboxRecord>>;
    async fn warm_len(&self) -> Result<usize>;
    async fn warm_ids(&self) -> Result<Vec<String>>;
    async fn warm_record(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>>;
    /// Remove a specific entry (queue position and side record).
    async fn remove_warm(&self, sandbox_id: &str) -> Result<()>;

    // Hot-reloadable pool sizing.
    async fn pool_sizing(&self) -> Result<Option<PoolSizing>>;
    async fn set_pool_sizing(&self, sizing: &PoolSizing) -> Result<()>;

    // Orphan resolution.
    async fn set_runtime_handle(&self, conversation_id: &str, handle: &str) -> Result<()>;
    async fn remove_runtime_handle(&self, conversation_id: &str) -> Result<()>;
}

fn binding_key(conversation_id: &str) -> String {
    format!("{BINDING_PREFIX}{conversation_id}")
}

fn warm_entry_key(sandbox_id: &str) -> String {
    format!("{WARM_ENTRY_PREFIX}{sandbox_id}")
}

/// Redis-backed registry.
pub struct RedisRegistry {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisRegistry {
    /// Connect to the configured Redis endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid registry url: {url}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Failed to connect to registry at {url}"))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn bind(&self, record: &SandboxRecord, ttl: Duration) -> Result<()> {
        if record.conversation_id.is_empty() {
            bail!("cannot bind a record with an empty conversation id");
        }
        let key = binding_key(&record.conversation_id);
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(&key, &record.to_map())
            .await
            .context("registry bind failed")?;
        conn.expire::<_, ()>(&key, ttl.as_secs() as i64)
            .await
            .context("registry expire failed")?;
        Ok(())
    }

    async fn lookup(&self, conversation_id: &str) -> Result<Option<SandboxRecord>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(binding_key(conversation_id))
            .await
            .context("registry lookup failed")?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(SandboxRecord::from_map(&map)?))
    }

    async fn touch(&self, conversation_id: &str, last_active_ms: i64, ttl: Duration) -> Result<()> {
        let key = binding_key(conversation_id);
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&key, "last_active_at", last_active_ms.to_string())
            .await
            .context("registry touch failed")?;
        conn.expire::<_, ()>(&key, ttl.as_secs() as i64)
            .await
            .context("registry expire failed")?;
        Ok(())
    }

    async fn set_status(&self, conversation_id: &str, status: SandboxStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(binding_key(conversation_id), "status", status.as_str())
            .await
            .context("registry status update failed")?;
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(binding_key(conversation_id))
            .await
            .context("registry remove failed")?;
        Ok(())
    }

    async fn bindings(&self) -> Result<Vec<SandboxRecord>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter = conn
                .scan_match::<_, String>(format!("{BINDING_PREFIX}*"))
                .await
                .context("registry scan failed")?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        let mut records = Vec::new();
        for key in keys {
            let map: HashMap<String, String> = conn.hgetall(&key).await?;
            if map.is_empty() {
                continue;
            }
            match SandboxRecord::from_map(&map) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key, "skipping malformed registry record: {e}"),
            }
        }
        Ok(records)
    }

    async fn push_warm(&self, record: &SandboxRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(warm_entry_key(&record.sandbox_id), &record.to_map())
            .await
            .context("warm entry write failed")?;
        conn.rpush::<_, _, ()>(WARM_POOL_KEY, &record.sandbox_id)
            .await
            .context("warm pool push failed")?;
        Ok(())
    }

    async fn pop_warm(&self) -> Result<Option<SandboxRecord>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .lpop(WARM_POOL_KEY, None)
            .await
            .context("warm pool pop failed")?;
        let Some(id) = id else {
            return Ok(None);
        };
        let map: HashMap<String, String> = conn.hgetall(warm_entry_key(&id)).await?;
        conn.del::<_, ()>(warm_entry_key(&id)).await?;
        if map.is_empty() {
            // Queue id without a record; treat as a miss.
            tracing::warn!(sandbox_id = id, "warm pool id had no side record");
            return Ok(None);
        }
        Ok(Some(SandboxRecord::from_map(&map)?))
    }

    async fn warm_len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(WARM_POOL_KEY).await.context("warm pool len failed")?;
        Ok(len)
    }

    async fn warm_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(WARM_POOL_KEY, 0, -1)
            .await
            .context("warm pool range failed")?;
        Ok(ids)
    }

    async fn warm_record(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(warm_entry_key(sandbox_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(SandboxRecord::from_map(&map)?))
    }

    async fn remove_warm(&self, sandbox_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(WARM_POOL_KEY, 0, sandbox_id).await?;
        conn.del::<_, ()>(warm_entry_key(sandbox_id)).await?;
        Ok(())
    }

    async fn pool_sizing(&self) -> Result<Option<PoolSizing>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(POOL_CONFIG_KEY).await?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("malformed pool sizing key")?,
            )),
            None => Ok(None),
        }
    }

    async fn set_pool_sizing(&self, sizing: &PoolSizing) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(POOL_CONFIG_KEY, serde_json::to_string(sizing)?)
            .await?;
        Ok(())
    }

    async fn set_runtime_handle(&self, conversation_id: &str, handle: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(format!("{RUNTIME_HANDLE_PREFIX}{conversation_id}"), handle)
            .await?;
        Ok(())
    }

    async fn remove_runtime_handle(&self, conversation_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(format!("{RUNTIME_HANDLE_PREFIX}{conversation_id}"))
            .await?;
        Ok(())
    }
}

/// In-memory registry for tests and single-process development runs.
/// TTLs are recorded but never expire on their own; tests drive time by
/// writing explicit timestamps into records.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: std::sync::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    bindings: HashMap<String, SandboxRecord>,
    warm_queue: std::collections::VecDeque<String>,
    warm_records: HashMap<String, SandboxRecord>,
    sizing: Option<PoolSizing>,
    handles: HashMap<String, String>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn bind(&self, record: &SandboxRecord, _ttl: Duration) -> Result<()> {
        if record.conversation_id.is_empty() {
            bail!("cannot bind a record with an empty conversation id");
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .bindings
            .insert(record.conversation_id.clone(), record.clone());
        Ok(())
    }

    async fn lookup(&self, conversation_id: &str) -> Result<Option<SandboxRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.bindings.get(conversation_id).cloned())
    }

    async fn touch(&self, conversation_id: &str, last_active_ms: i64, _ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.bindings.get_mut(conversation_id) {
            record.last_active_at = last_active_ms;
        }
        Ok(())
    }

    async fn set_status(&self, conversation_id: &str, status: SandboxStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.bindings.get_mut(conversation_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.bindings.remove(conversation_id);
        Ok(())
    }

    async fn bindings(&self) -> Result<Vec<SandboxRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.bindings.values().cloned().collect())
    }

    async fn push_warm(&self, record: &SandboxRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .warm_records
            .insert(record.sandbox_id.clone(), record.clone());
        inner.warm_queue.push_back(record.sandbox_id.clone());
        Ok(())
    }

    async fn pop_warm(&self) -> Result<Option<SandboxRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(id) = inner.warm_queue.pop_front() else {
            return Ok(None);
        };
        Ok(inner.warm_records.remove(&id))
    }

    async fn warm_len(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().warm_queue.len())
    }

    async fn warm_ids(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().warm_queue.iter().cloned().collect())
    }

    async fn warm_record(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.inner.lock().unwrap().warm_records.get(sandbox_id).cloned())
    }

    async fn remove_warm(&self, sandbox_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.warm_queue.retain(|id| id != sandbox_id);
        inner.warm_records.remove(sandbox_id);
        Ok(())
    }

    async fn pool_sizing(&self) -> Result<Option<PoolSizing>> {
        Ok(self.inner.lock().unwrap().sizing)
    }

    async fn set_pool_sizing(&self, sizing: &PoolSizing) -> Result<()> {
        self.inner.lock().unwrap().sizing = Some(*sizing);
        Ok(())
    }

    async fn set_runtime_handle(&self, conversation_id: &str, handle: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .handles
            .insert(conversation_id.to_string(), handle.to_string());
        Ok(())
    }

    async fn remove_runtime_handle(&self, conversation_id: &str) -> Result<()> {
        self.inner.lock().unwrap().handles.remove(conversation_id);
        Ok(())
    }
}
