use anyhow::Context;
use tracing::{info, warn};

use backoffice_api::app::{self, services};
use backoffice_infra::config::SettingsLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsLoader::new()
        .load()
        .context("failed to load configuration")?;
    backoffice_observability::init_with(&settings.logging);

    let runtime = services::build(&settings).await?;
    let router = app::build_app(runtime.services.clone());

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind_address))?;
    info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("draining worker pool");
    if tokio::time::timeout(settings.server.shutdown_grace(), runtime.workers.shutdown())
        .await
        .is_err()
    {
        warn!(
            grace_ms = settings.server.shutdown_grace_ms,
            "worker pool did not drain before the grace period"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
