use clap::Parser;
use ticketer::{Allocator, ContentionPolicy, MemoryRangeStore, RangeStore};
use ticketer_server::server::config::{BackendConfig, CliArgs, ServerConfig};
use ticketer_server::server::telemetry::init_telemetry;
use ticketer_server::{AppState, router};
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(&config.service_name)?;
    log_startup_info(&config);

    let result = match config.backend.clone() {
        #[cfg(feature = "postgres")]
        BackendConfig::Postgres {
            url,
            pool,
            run_migrations,
        } => {
            let store =
                ticketer::PostgresRangeStore::connect(&url, &pool, config.contention_policy)
                    .await?;
            if run_migrations {
                store.migrate().await?;
                tracing::info!("ranges schema is up to date");
            }
            let served = serve(store.clone(), &config).await;
            store.close().await;
            served
        }
        BackendConfig::Memory { ranges, range_size } => {
            let store = seed_memory(config.contention_policy, ranges, range_size)?;
            serve(store, &config).await
        }
    };

    providers.shutdown();
    result
}

async fn serve<S>(store: S, config: &ServerConfig) -> anyhow::Result<()>
where
    S: RangeStore + 'static,
{
    let allocator = Allocator::new(store, config.allocator.clone());
    let app = router(
        AppState::new(allocator, config.database_id),
        config.cors_origin.clone(),
    );

    let listener = TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

/// Provisions `ranges` back-to-back ranges of `range_size` tickets each,
/// starting at zero.
fn seed_memory(
    policy: ContentionPolicy,
    ranges: i64,
    range_size: i64,
) -> anyhow::Result<MemoryRangeStore> {
    let store = MemoryRangeStore::new(policy);
    for i in 0..ranges {
        let start = i * range_size;
        store.provision(start, start + range_size)?;
    }
    tracing::warn!(
        ranges,
        range_size,
        "using the in-memory backend; tickets are not persisted across restarts"
    );
    Ok(store)
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting ticket service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting ticket service on {} (policy {}, claim timeout {:?})",
            config.server_addr,
            config.contention_policy,
            config.allocator.claim_timeout
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, draining in-flight requests...");
}
