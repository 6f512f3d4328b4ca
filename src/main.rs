//! Gateway entry point: configuration, boot order, and shutdown fan-out.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use aperture::agents::env::is_provider_secret;
use aperture::agents::{AgentBackend, ClaudeSdkBackend, PiSdkBackend};
use aperture::api::{AppState, build_router, serve};
use aperture::config::Config;
use aperture::core::{ManagerSettings, SessionManager};
use aperture::store::{SqliteStore, Store};
use aperture::vault::CredentialVault;
use aperture::worktree::{GitWorktreeBroker, StubWorktreeBroker, WorktreeBroker};

#[derive(Parser)]
#[command(name = "aperture")]
#[command(version)]
#[command(about = "Multi-tenant gateway for AI coding-agent sessions")]
#[command(long_about = "\
aperture fronts long-lived interactive AI coding-agent sessions.

Clients create a session over HTTP, then talk to it over a WebSocket frame
channel or observe it over an SSE event stream. Sessions survive client
disconnects, are bounded by idle timeouts, and can resume across gateway
restarts when the backend reports a durable session id.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    APERTURE_API_TOKEN          Bearer token for every API call (required)
    PORT                        Listener port (default: 8080)
    HOST                        Bind address (default: 0.0.0.0)
    LOG_LEVEL                   Tracing filter (default: info)
    MAX_CONCURRENT_SESSIONS     Live-session cap (default: 50)
    SESSION_IDLE_TIMEOUT_MS     Idle timeout (default: 600000)
    MAX_MESSAGE_SIZE_BYTES      Frame size cap (default: 262144)
    RPC_REQUEST_TIMEOUT_MS      Backend RPC deadline (default: 300000)
    RATE_LIMIT_MAX              Requests per window per remote (default: 100)
    RATE_LIMIT_WINDOW_MS        Rate window (default: 60000)
    HOSTED_MODE                 No human for browser logins (default: true)
    ALLOW_INTERACTIVE_AUTH      Permit interactive auth flows (default: false)
    CREDENTIALS_MASTER_KEY      >=32 chars enables the vault
    CREDENTIALS_STORE_PATH      Vault file (default: ~/.aperture/credentials.bin)
    APERTURE_DB_PATH            SQLite path (default: ~/.aperture/aperture.sqlite)
    CLAUDE_SDK_BIN, PI_SDK_BIN  Backend SDK binaries (default: on PATH)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway.
    Serve,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run())
        }
    }
}

async fn run() -> anyhow::Result<()> {
    // Tracing first so config warnings land somewhere.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Missing bearer token is fatal before anything else starts.
    let config = Arc::new(Config::from_env()?);

    warn_on_ambient_secrets();

    // Vault (if a master key is configured). A wrong key is fatal: the
    // gateway never silently degrades to "no vault".
    let vault = match &config.credentials_master_key {
        Some(master_key) => {
            let vault = CredentialVault::open(&config.credentials_store_path, master_key).await?;
            tracing::info!(path = %config.credentials_store_path.display(), "credential vault open");
            Some(Arc::new(vault))
        }
        None => {
            tracing::info!("credential vault disabled; only inline keys will work");
            None
        }
    };

    // Store + migrations; a failed migration aborts startup here.
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.database_path).await?);

    // Worktree broker, or the deterministic stub when git is unavailable.
    let broker: Arc<dyn WorktreeBroker> = if GitWorktreeBroker::available().await {
        Arc::new(GitWorktreeBroker::new())
    } else {
        tracing::warn!("git not found; workspace-backed sessions are disabled");
        Arc::new(StubWorktreeBroker::new())
    };

    let claude: Arc<dyn AgentBackend> =
        Arc::new(ClaudeSdkBackend::new(config.claude_sdk_bin.clone()));
    let pi: Arc<dyn AgentBackend> = Arc::new(PiSdkBackend::new(config.pi_sdk_bin.clone()));

    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store),
        vault,
        broker,
        claude,
        pi,
        ManagerSettings::from_config(&config),
    ));

    // Crash recovery: orphaned live sessions from a previous run are
    // demoted; resumable ones wait for an explicit connect.
    manager.restore_on_boot().await?;

    // Probe backend readiness; informational, not fatal.
    for (name, readiness) in manager.backend_readiness().await {
        if readiness.ready {
            tracing::info!(
                backend = name,
                path = ?readiness.resolved_path,
                "backend ready"
            );
        } else {
            tracing::warn!(backend = name, detail = ?readiness.detail, "backend not ready");
        }
    }

    let state = AppState {
        manager: Arc::clone(&manager),
        store,
        config: Arc::clone(&config),
    };
    let router = build_router(state);

    let shutdown_manager = Arc::clone(&manager);
    serve(&config.bind_addr(), router, async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_manager.terminate_all().await;
    })
    .await?;

    tracing::info!("gateway stopped");
    Ok(())
}

/// Provider keys in the gateway's own environment are a foot-gun: they are
/// never forwarded to sessions, so their presence usually means someone
/// expected them to be.
fn warn_on_ambient_secrets() {
    for (name, _) in std::env::vars() {
        if is_provider_secret(&name) {
            tracing::warn!(
                variable = %name,
                "provider secret present in gateway environment; it will NOT be forwarded to sessions"
            );
        }
    }
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
