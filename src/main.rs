use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cland_chat::config::AppConfig;
use cland_chat::repository::memory::{
    MemoryMessageRepository, MemorySessionRepository, MemoryUserRepository,
};
use cland_chat::repository::sqlite::SqliteRepository;
use cland_chat::repository::{SharedMessageRepo, SharedSessionRepo, SharedUserRepo};
use cland_chat::{build_router, build_state, telemetry};

/// Window granted to in-flight handlers after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    telemetry::init(&config.log).context("failed to initialise logging")?;

    info!(
        mode = %config.server.mode,
        driver = %config.db.driver,
        "starting cland-chat on {}",
        config.bind_addr()
    );

    let shutdown = install_signal_handler();

    let (messages, sessions, users): (SharedMessageRepo, SharedSessionRepo, SharedUserRepo) =
        match config.db.driver.as_str() {
            "sqlite" => {
                let repo = SqliteRepository::connect(&config.db.path)
                    .await
                    .context("failed to open sqlite database")?;
                (
                    Arc::new(repo.clone()),
                    Arc::new(repo.clone()),
                    Arc::new(repo),
                )
            }
            "memory" => (
                Arc::new(MemoryMessageRepository::new()),
                Arc::new(MemorySessionRepository::new()),
                Arc::new(MemoryUserRepository::new()),
            ),
            other => anyhow::bail!("unknown db driver {other:?} (expected memory or sqlite)"),
        };

    let state = build_state(messages, sessions, users, shutdown.clone());
    let registry = state.registry.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!("listening on {}", config.bind_addr());

    let server_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    tokio::select! {
        result = serve => {
            result.context("server error")?;
        }
        _ = wait_for_drain(shutdown.clone()) => {}
    }

    registry.close_all(1001, "server shutting down");
    info!("server stopped");
    Ok(())
}

/// Cancel the root token on SIGINT or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!(%err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    signal_token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c, shutting down");
        }

        signal_token.cancel();
    });

    token
}

/// After the shutdown signal, give in-flight handlers a bounded window
/// before the remaining connections are force-closed.
async fn wait_for_drain(shutdown: CancellationToken) {
    shutdown.cancelled().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}
