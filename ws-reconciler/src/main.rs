use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ws_adapters::{
    Cache, HttpAuthorizationClient, HttpIdentityClient, HttpSearchClient, KubeClusterClient,
    TieredCache,
};
use ws_orchestrator::db::{backup_database, create_pool, run_migrations};
use ws_orchestrator::{
    LifecycleRequest, SqliteWorkspaceStore, WorkspaceFilters, WorkspaceState, WorkspaceStore,
};
use ws_reconciler::{spawn_supervised, Adapters, Config, OperatorSignals, Reconciler, ReconcilerError};

/// Local cache tier lifetime; entries also expire at their own TTL
const LOCAL_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "ws-reconciler", version, about = "Workspace reconciliation control loop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation loop (default)
    Run,
    /// List workspaces
    List {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        state: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// File a lifecycle request for a workspace
    Request {
        action: RequestAction,
        workspace_id: String,
        #[arg(long, env = "WS_ACTOR")]
        actor: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RequestAction {
    Suspend,
    Resume,
    Delete,
}

impl From<RequestAction> for LifecycleRequest {
    fn from(action: RequestAction) -> Self {
        match action {
            RequestAction::Suspend => LifecycleRequest::Suspend,
            RequestAction::Resume => LifecycleRequest::Resume,
            RequestAction::Delete => LifecycleRequest::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = ws_logging::init_subscriber(&ws_logging::LogConfig::from_env());

    let config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::List {
            tenant,
            state,
            json,
        } => list(config, tenant, state, json).await,
        Command::Request {
            action,
            workspace_id,
            actor,
        } => request(config, action.into(), &workspace_id, &actor).await,
    }
}

/// Opens the database and applies migrations. The daemon passes
/// `backup = true` so an existing database is copied before migrating.
async fn open_store(config: &Config, backup: bool) -> Result<SqliteWorkspaceStore> {
    let db_path = &config.db_path;
    info!(path = %db_path.display(), "opening workspace database");

    let existed = db_path.exists();
    let pool = create_pool(db_path).await?;
    if backup && existed {
        let backup_path = backup_database(&pool, db_path).await?;
        info!(backup = %backup_path.display(), "database backed up");
    }
    run_migrations(&pool).await?;
    Ok(SqliteWorkspaceStore::new(pool))
}

fn build_cache(config: &Config) -> Arc<dyn Cache> {
    if let Some(address) = &config.redis_address {
        match TieredCache::with_redis(config.local_cache_size, LOCAL_CACHE_TTL, address) {
            Ok(cache) => return Arc::new(cache),
            Err(e) => warn!(error = %e, "invalid REDIS_ADDRESS, using local cache only"),
        }
    }
    Arc::new(TieredCache::local_only(
        config.local_cache_size,
        LOCAL_CACHE_TTL,
    ))
}

fn config_error(e: impl std::fmt::Display) -> ReconcilerError {
    ReconcilerError::Config(e.to_string())
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let identity = HttpIdentityClient::new(config.identity_base_url()?).map_err(config_error)?;
    let search = HttpSearchClient::new(config.search_base_url()?).map_err(config_error)?;
    // Authorization is only used by operator requests, but a bad URL should
    // still stop the service at startup.
    HttpAuthorizationClient::new(config.auth_base_url()?).map_err(config_error)?;
    let cluster = KubeClusterClient::try_default(&config.kube_namespace, &config.routing_configmap)
        .await
        .map_err(config_error)?;

    let store: Arc<dyn WorkspaceStore> = Arc::new(open_store(&config, true).await?);
    let adapters = Adapters {
        cluster: Arc::new(cluster),
        identity: Arc::new(identity),
        search: Arc::new(search),
    };
    let reconciler = Arc::new(Reconciler::new(&config, store, adapters)?);

    let shutdown = CancellationToken::new();
    let mut supervisor = spawn_supervised(reconciler, shutdown.clone());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("shutdown requested, waiting for in-flight cycle");
        }
        result = &mut supervisor => {
            error!("supervisor exited unexpectedly");
            result.context("supervisor task")?;
            return Ok(());
        }
    }

    shutdown.cancel();
    match tokio::time::timeout(config.shutdown_timeout(), supervisor).await {
        Ok(Ok(restarts)) => info!(restarts, "reconciler shut down"),
        Ok(Err(e)) => error!(error = %e, "supervisor task failed"),
        Err(_) => warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "in-flight cycle did not finish before timeout, exiting"
        ),
    }
    Ok(())
}

async fn list(
    config: Config,
    tenant: Option<String>,
    state: Option<String>,
    json: bool,
) -> Result<()> {
    let store = open_store(&config, false).await?;
    let state = state
        .map(|s| s.parse::<WorkspaceState>())
        .transpose()?;
    let workspaces = store
        .list_filtered(WorkspaceFilters {
            tenant_id: tenant,
            state,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workspaces)?);
        return Ok(());
    }

    if workspaces.is_empty() {
        println!("No workspaces found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<12}  {:<8}  {:<8}  VERSION",
        "ID", "SLUG", "STATE", "CLASS", "REQUEST"
    );
    for w in workspaces {
        let request = w.pending_request.map(|r| r.as_str()).unwrap_or("-");
        let state = if w.provisioning_blocked {
            format!("{}*", w.state)
        } else {
            w.state.to_string()
        };
        println!(
            "{:<36}  {:<20}  {:<12}  {:<8}  {:<8}  {}",
            w.id, w.slug, state, w.resource_class, request, w.version
        );
    }
    Ok(())
}

async fn request(
    config: Config,
    request: LifecycleRequest,
    workspace_id: &str,
    actor: &str,
) -> Result<()> {
    let authz = HttpAuthorizationClient::new(config.auth_base_url()?).map_err(config_error)?;
    let store: Arc<dyn WorkspaceStore> = Arc::new(open_store(&config, false).await?);
    let signals = OperatorSignals::new(
        store,
        Arc::new(authz),
        build_cache(&config),
        config.authz_cache_ttl(),
        config.conflict_retries,
    );

    let workspace = signals.request(actor, workspace_id, request).await?;
    println!(
        "{}: {} (pending: {})",
        workspace.id,
        workspace.state,
        workspace
            .pending_request
            .map(|r| r.as_str())
            .unwrap_or("none")
    );
    Ok(())
}
