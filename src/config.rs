//! Configuration parsing for workspaced.toml files.
//!
//! Every tunable of the control plane lives here: registry connection,
//! sandbox lifecycle TTLs, warm-pool sizing, proxy allow-list, storage
//! backend, GC cadence, and server drain behavior. Values can be loaded
//! from a TOML file and individually overridden by environment variables
//! where noted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure matching the workspaced.toml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub warm_pool: WarmPoolConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Redis-class KV endpoint. Overridable via WORKSPACED_REGISTRY_URL.
    #[serde(default = "default_registry_url")]
    pub url: String,
}

fn default_registry_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Which runtime backend owns the sandboxes.
    #[serde(default = "default_manager_type")]
    pub manager_type: String,
    /// Image every workspace sandbox boots from.
    #[serde(default = "default_image")]
    pub image: String,
    /// Explicit runtime socket (e.g. a Podman socket path). Empty means
    /// the backend's local default.
    #[serde(default)]
    pub runtime_socket: String,
    /// "disabled" (no network device) or "restricted" (bridged, egress
    /// still forced through the proxy socket).
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// Binding expires after this much inactivity.
    #[serde(default = "default_inactive_ttl")]
    pub inactive_ttl_secs: u64,
    /// Hard lifetime cap regardless of activity.
    #[serde(default = "default_absolute_ttl")]
    pub absolute_ttl_secs: u64,
    /// Per-turn deadline.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// A live stream with no events for this long is treated as an
    /// agent disconnect.
    #[serde(default = "default_idle_stream_timeout")]
    pub idle_stream_timeout_secs: u64,
    /// SIGTERM grace before force-remove.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// CPU cores per sandbox.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    /// Memory cap in MB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Process-count cap (fork-bomb containment).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Writable scratch size in MB.
    #[serde(default = "default_disk_limit_mb")]
    pub disk_limit_mb: u64,
    /// Host directory holding per-sandbox workspace volumes.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    /// Host directory holding per-sandbox socket trees.
    #[serde(default = "default_run_root")]
    pub run_root: String,
}

fn default_manager_type() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "workspaced-sandbox:latest".to_string()
}

fn default_network_mode() -> String {
    "disabled".to_string()
}

fn default_inactive_ttl() -> u64 {
    3600
}

fn default_absolute_ttl() -> u64 {
    8 * 3600
}

fn default_execution_timeout() -> u64 {
    600
}

fn default_idle_stream_timeout() -> u64 {
    120
}

fn default_grace_period() -> u64 {
    10
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_pids_limit() -> i64 {
    256
}

fn default_disk_limit_mb() -> u64 {
    1024
}

fn default_workspace_root() -> String {
    "/var/lib/workspaced/workspaces".to_string()
}

fn default_run_root() -> String {
    "/var/lib/workspaced/run".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            manager_type: default_manager_type(),
            image: default_image(),
            runtime_socket: String::new(),
            network_mode: default_network_mode(),
            inactive_ttl_secs: default_inactive_ttl(),
            absolute_ttl_secs: default_absolute_ttl(),
            execution_timeout_secs: default_execution_timeout(),
            idle_stream_timeout_secs: default_idle_stream_timeout(),
            grace_period_secs: default_grace_period(),
            cpu_limit: default_cpu_limit(),
            memory_mb: default_memory_mb(),
            pids_limit: default_pids_limit(),
            disk_limit_mb: default_disk_limit_mb(),
            workspace_root: default_workspace_root(),
            run_root: default_run_root(),
        }
    }
}

impl ContainerConfig {
    pub fn inactive_ttl(&self) -> Duration {
        Duration::from_secs(self.inactive_ttl_secs)
    }

    pub fn absolute_ttl(&self) -> Duration {
        Duration::from_secs(self.absolute_ttl_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn idle_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_stream_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Warm-pool sizing. The same triple is also persisted under a registry
/// key so sizing can be hot-reloaded without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizing {
    pub min_size: usize,
    pub target_size: usize,
    pub max_size: usize,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min_size: 1,
            target_size: 3,
            max_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmPoolConfig {
    #[serde(default = "default_pool_min")]
    pub min_size: usize,
    #[serde(default = "default_pool_target")]
    pub target_size: usize,
    #[serde(default = "default_pool_max")]
    pub max_size: usize,
    /// Per-attempt creation budget.
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
    /// Entries sitting in the pool past this age are evicted.
    #[serde(default = "default_pool_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_max_concurrent_creates")]
    pub max_concurrent_creates: usize,
    /// Health-check retries during acquisition before falling back to
    /// on-demand creation.
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_target() -> usize {
    3
}

fn default_pool_max() -> usize {
    10
}

fn default_create_timeout() -> u64 {
    60
}

fn default_pool_idle_ttl() -> u64 {
    1800
}

fn default_max_concurrent_creates() -> usize {
    4
}

fn default_acquire_retries() -> u32 {
    3
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_pool_min(),
            target_size: default_pool_target(),
            max_size: default_pool_max(),
            create_timeout_secs: default_create_timeout(),
            idle_ttl_secs: default_pool_idle_ttl(),
            max_concurrent_creates: default_max_concurrent_creates(),
            acquire_retries: default_acquire_retries(),
        }
    }
}

impl WarmPoolConfig {
    pub fn sizing(&self) -> PoolSizing {
        PoolSizing {
            min_size: self.min_size,
            target_size: self.target_size,
            max_size: self.max_size,
        }
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Comma-separated host patterns (exact, `*.suffix`, `prefix.*`).
    #[serde(default)]
    pub domain_whitelist: String,
    /// Comma-separated host patterns whose requests get SigV4 signing.
    #[serde(default = "default_signing_hosts")]
    pub signing_hosts: String,
    /// Log every forwarded request, not just denials.
    #[serde(default)]
    pub log_all_requests: bool,
    /// Audit log location. Empty means ~/.workspaced/egress.jsonl.
    #[serde(default)]
    pub audit_path: String,
}

fn default_signing_hosts() -> String {
    "bedrock-runtime.*".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domain_whitelist: String::new(),
            signing_hosts: default_signing_hosts(),
            log_all_requests: false,
            audit_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "s3", "local", or "none". With "none", sync-in/out are skipped
    /// with a warning and never fail the turn.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: String,
    /// Root directory for the "local" backend.
    #[serde(default)]
    pub local_dir: String,
    /// Tenant segment of every object key.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Mid-run flush debounce window.
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
}

fn default_storage_backend() -> String {
    "none".to_string()
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_flush_debounce_ms() -> u64 {
    2000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            bucket: String::new(),
            prefix: String::new(),
            region: String::new(),
            local_dir: String::new(),
            tenant: default_tenant(),
            flush_debounce_ms: default_flush_debounce_ms(),
        }
    }
}

impl StorageConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,
    /// Orphan sweep runs every Nth cycle.
    #[serde(default = "default_orphan_cycle")]
    pub orphan_cycle: u64,
    /// Runtime sandboxes younger than this are never treated as
    /// orphans, even without a registry entry.
    #[serde(default = "default_orphan_safety")]
    pub orphan_safety_secs: u64,
}

fn default_gc_interval() -> u64 {
    60
}

fn default_orphan_cycle() -> u64 {
    5
}

fn default_orphan_safety() -> u64 {
    300
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval(),
            orphan_cycle: default_orphan_cycle(),
            orphan_safety_secs: default_orphan_safety(),
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn orphan_safety(&self) -> Duration {
        Duration::from_secs(self.orphan_safety_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_sandboxes")]
    pub max_concurrent_sandboxes: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8844".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_concurrent_sandboxes() -> usize {
    32
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_concurrent_sandboxes: default_max_concurrent_sandboxes(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Names of the environment variables credential material is read from.
/// The material itself never appears in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_session_token_env")]
    pub session_token_env: String,
    #[serde(default = "default_signing_region")]
    pub region: String,
    /// SigV4 service name for hosts matching the signing policy.
    #[serde(default = "default_signing_service")]
    pub signing_service: String,
}

fn default_access_key_env() -> String {
    "WORKSPACED_ACCESS_KEY_ID".to_string()
}

fn default_secret_key_env() -> String {
    "WORKSPACED_SECRET_ACCESS_KEY".to_string()
}

fn default_session_token_env() -> String {
    "WORKSPACED_SESSION_TOKEN".to_string()
}

fn default_signing_region() -> String {
    "us-east-1".to_string()
}

fn default_signing_service() -> String {
    "bedrock".to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            access_key_env: default_access_key_env(),
            secret_key_env: default_secret_key_env(),
            session_token_env: default_session_token_env(),
            region: default_signing_region(),
            signing_service: default_signing_service(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string, then apply environment
    /// overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no file is given.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("WORKSPACED_REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Ok(whitelist) = std::env::var("WORKSPACED_DOMAIN_WHITELIST") {
            self.proxy.domain_whitelist = whitelist;
        }
    }
}
