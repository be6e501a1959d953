use anyhow::{Context, Result};
use clap::Parser;
use map_warper::services::tools::GdalTools;
use map_warper::{cli, config, db, openapi, routes, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind map-warper listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind map-warper listener on {addr}"))
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::WarperConfig::from_env()?;
    config.ensure_storage_dirs()?;

    let pool = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::connect_lazy(url)?;
            db::ensure_schema(&pool).await?;
            Some(pool)
        }
        None => {
            tracing::info!("no database configured; maps are kept in memory only");
            None
        }
    };

    let cancel = CancellationToken::new();
    let tools = Arc::new(GdalTools::new(
        config.gdal_bin_dir.clone(),
        Duration::from_secs(config.warp_timeout_seconds),
        cancel.clone(),
    ));
    let state = state::AppState::new(config.clone(), pool.clone(), tools, cancel.clone());

    if let Some(pool) = &pool {
        let records = db::load_maps(pool).await?;
        tracing::info!(count = records.len(), "loaded persisted maps");
        for record in records {
            state.maps.insert(record);
        }
    }
    let recovered = state.rectifier.recover_interrupted();
    if recovered > 0 {
        tracing::warn!(count = recovered, "marked interrupted warps as failed");
    }
    state.publisher.resume_publishing();

    let maps = state.maps.clone();
    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "map-warper listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;
    cancel.cancel();
    maps.flush().await;
    Ok(())
}
