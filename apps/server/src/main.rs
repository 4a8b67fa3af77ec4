use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use flashsale_api::config::Config;
use flashsale_api::state::State;
use flashsale_api::{construct_router, warn_env_filter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(warn_env_filter())
        .init();

    tracing::info!("Starting flash sale service");

    let config = Config::from_env().context("invalid configuration")?;
    let port = config.port;
    tracing::info!(
        port,
        items_per_sale = config.items_per_sale,
        user_limit = config.user_limit,
        sale_window_secs = config.sale_window.as_secs(),
        "configuration loaded"
    );

    let state = Arc::new(
        State::new(config)
            .await
            .context("failed to initialise state")?,
    );

    // One scheduler task per instance; cross-instance safety lives in the
    // store's uniqueness constraints, not here.
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move { scheduler.run().await });

    let app = construct_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    tracing::info!("server exited cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}
