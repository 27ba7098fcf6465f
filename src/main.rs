use backon::{ExponentialBuilder, Retryable};
use mimalloc::MiMalloc;
use std::sync::Arc;
use std::time::Duration;
use tempdb::config::Config;
use tempdb::service::sweeper::Sweeper;
use tempdb::{Backend, OpContext, PostgresBackend, Registry, TempDbError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn connect_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(5)
        .with_jitter()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        listen_addr = %cfg.listen_addr,
        default_ttl = ?cfg.default_ttl,
        sweep_interval = ?cfg.sweep_interval,
        backends = cfg.backends.len(),
        loglevel = %cfg.loglevel
    );

    let shutdown = CancellationToken::new();
    let registry = Arc::new(Registry::new());

    for (name, pg) in &cfg.backends {
        let backend = Arc::new(PostgresBackend::new(pg.clone())?);
        let ctx = OpContext::with_cancellation(shutdown.child_token());

        (|| async { backend.connect(&ctx).await })
            .retry(connect_retry_policy())
            .when(|e: &TempDbError| e.is_retryable())
            .notify(|err, dur: Duration| {
                warn!(backend = %name, error = %err, retry_in = ?dur, "connect failed, retrying");
            })
            .await?;

        backend.init(&ctx).await?;
        registry.register(name.clone(), backend)?;
        info!(backend = %name, server = %pg.target(&pg.root_database), "backend registered");
    }

    let sweeper = cfg.sweep_interval.map(|interval| {
        Sweeper::new(registry.clone(), interval, cfg.request_timeout).spawn(shutdown.clone())
    });

    let state = tempdb::router::TempDbState::new(registry.clone(), &cfg)
        .with_shutdown(shutdown.clone());
    let app = tempdb::router::tempdb_router(state);

    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    info!("HTTP server listening on {}", cfg.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(handle) = sweeper
        && let Err(e) = handle.await
    {
        warn!(error = %e, "sweeper task ended abnormally");
    }

    for (name, backend) in registry.entries() {
        if let Err(e) = backend.disconnect().await {
            warn!(backend = %name, error = %e, "disconnect failed");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "cannot listen for ctrl-c");
                shutdown.cancelled().await;
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("shutdown signal received");
}
