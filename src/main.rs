//! workspaced CLI entrypoint.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workspaced::config::Config;
use workspaced::credentials::CredentialStore;
use workspaced::gc::{GarbageCollector, SandboxCleanup};
use workspaced::http_api::{AppState, run_server};
use workspaced::orchestrator::Orchestrator;
use workspaced::proxy::audit::EgressAudit;
use workspaced::registry::{RedisRegistry, Registry};
use workspaced::runtime::SandboxRuntime;
use workspaced::runtime::docker::DockerRuntime;
use workspaced::store::{BlobStore, LocalStore, S3Store};
use workspaced::sync::FileSync;
use workspaced::warm_pool::{SandboxSource, WarmPool};

#[derive(Parser)]
#[command(name = "workspaced", version, about = "Workspace isolation control plane")]
struct Cli {
    /// Path to workspaced.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: preheat the pool, serve turns, GC.
    Serve,
    /// Show bindings and warm-pool state.
    Status,
    /// Bring the warm pool up to its target size.
    Preheat,
    /// Run a single GC cycle.
    Gc,
    /// Destroy a conversation's sandbox.
    Destroy {
        conversation_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("workspaced=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    let config = Arc::new(config);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Status => status(config).await,
        Command::Preheat => {
            let stack = Stack::build(config).await?;
            stack.pool.preheat().await?;
            println!("{}", stack.pool.stats().await);
            Ok(())
        }
        Command::Gc => {
            let stack = Stack::build(config.clone()).await?;
            let gc = GarbageCollector::new(
                stack.registry.clone(),
                stack.runtime.clone(),
                stack.orchestrator.clone() as Arc<dyn SandboxCleanup>,
                config,
            );
            let report = gc.cycle_once().await;
            println!(
                "examined {} bindings, reaped {:?}, orphans {:?}",
                report.examined, report.reaped, report.orphans_reaped
            );
            Ok(())
        }
        Command::Destroy { conversation_id } => {
            let stack = Stack::build(config).await?;
            stack
                .orchestrator
                .destroy(&conversation_id)
                .await
                .with_context(|| format!("Failed to destroy {conversation_id}"))?;
            println!("destroyed {conversation_id}");
            Ok(())
        }
    }
}

/// Everything `serve` and the one-shot subcommands share.
struct Stack {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn SandboxRuntime>,
    pool: Arc<WarmPool>,
    orchestrator: Arc<Orchestrator>,
}

impl Stack {
    async fn build(config: Arc<Config>) -> Result<Self> {
        let registry: Arc<dyn Registry> =
            Arc::new(RedisRegistry::connect(&config.registry.url).await?);

        let manager_type = config.container.manager_type.parse()?;
        let runtime: Arc<dyn SandboxRuntime> = Arc::new(
            DockerRuntime::connect(
                manager_type,
                &config.container.runtime_socket,
                &config.container.workspace_root,
                &config.container.run_root,
            )
            .await?,
        );

        let credentials = Arc::new(CredentialStore::load_env(&config.credentials).await);
        if !credentials.is_loaded().await {
            warn!("no credential material in environment; signed egress will fail closed");
        }

        let store: Option<Arc<dyn BlobStore>> = match config.storage.backend.as_str() {
            "s3" => {
                if config.storage.bucket.is_empty() {
                    bail!("storage.backend = \"s3\" requires storage.bucket");
                }
                Some(Arc::new(
                    S3Store::connect(
                        &config.storage.bucket,
                        &config.storage.prefix,
                        &config.storage.region,
                    )
                    .await,
                ))
            }
            "local" => {
                if config.storage.local_dir.is_empty() {
                    bail!("storage.backend = \"local\" requires storage.local_dir");
                }
                Some(Arc::new(LocalStore::new(&config.storage.local_dir)))
            }
            "none" => {
                warn!("no object store configured; file sync is disabled");
                None
            }
            other => bail!("unknown storage backend: {other:?}"),
        };
        let sync = Arc::new(FileSync::new(store, &config.storage.tenant));

        let audit = Arc::new(EgressAudit::new(
            &config.proxy.audit_path,
            config.proxy.log_all_requests,
        ));

        let pool = WarmPool::new(registry.clone(), runtime.clone(), &config)?;
        let orchestrator = Orchestrator::new(
            config.clone(),
            registry.clone(),
            runtime.clone(),
            pool.clone() as Arc<dyn SandboxSource>,
            credentials,
            sync,
            audit,
        );

        Ok(Self {
            registry,
            runtime,
            pool,
            orchestrator,
        })
    }

    /// Reconcile in-memory expectations against the KV and runtime at
    /// startup; anything labeled as a workspace with no registry record
    /// is left to the orphan sweep.
    async fn reconcile(&self) {
        let bindings = self.registry.bindings().await.unwrap_or_default();
        let live = self.runtime.list().await.unwrap_or_default();
        let known: std::collections::HashSet<&str> =
            bindings.iter().map(|r| r.sandbox_id.as_str()).collect();
        let orphans = live
            .iter()
            .filter(|s| !known.contains(s.sandbox_id.as_str()))
            .count();
        info!(
            bindings = bindings.len(),
            runtime_sandboxes = live.len(),
            unmatched = orphans,
            "startup reconciliation"
        );
    }
}

async fn serve(config: Arc<Config>) -> Result<()> {
    let stack = Stack::build(config.clone()).await?;
    stack.reconcile().await;
    stack.pool.preheat().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gc = GarbageCollector::new(
        stack.registry.clone(),
        stack.runtime.clone(),
        stack.orchestrator.clone() as Arc<dyn SandboxCleanup>,
        config.clone(),
    );
    let gc_task = tokio::spawn(gc.run(shutdown_rx.clone()));

    let addr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.server.listen_addr))?;
    let state = Arc::new(AppState {
        orchestrator: stack.orchestrator.clone(),
        pool: stack.pool.clone(),
    });
    let server = tokio::spawn(run_server(addr, state, shutdown_rx));

    wait_for_termination().await;
    info!("termination signal received, draining");
    let _ = shutdown_tx.send(true);

    // New turns are already rejected; give live turns the configured
    // grace, then drain everything.
    stack.orchestrator.destroy_all().await;
    stack.pool.drain().await;
    stack.pool.join_background_tasks().await;

    let _ = gc_task.await;
    server.abort();
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

async fn status(config: Arc<Config>) -> Result<()> {
    let registry = RedisRegistry::connect(&config.registry.url).await?;
    let bindings = registry.bindings().await?;
    let warm = registry.warm_len().await?;

    println!("warm pool: {warm} sandboxes");
    if bindings.is_empty() {
        println!("no active bindings");
        return Ok(());
    }
    println!("{} bindings:", bindings.len());
    for record in bindings {
        println!(
            "  {} -> {} [{}] agent={} last_active={}",
            record.conversation_id,
            record.sandbox_id,
            record.status.as_str(),
            record.agent_endpoint,
            record.last_active_at,
        );
    }
    Ok(())
}
