use stackd_core::{observability, Config, ProcessRunner, SecretStore, StackInventory, StackManager};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    observability::init(&config.log_level)?;

    info!(
        runtime = %config.runtime_bin,
        env_file = %config.env_file,
        "stackd starting"
    );

    let runner = Arc::new(ProcessRunner);
    let secrets = Arc::new(SecretStore::new(&config.env_file));
    let manager = Arc::new(StackManager::new(
        runner.clone(),
        secrets,
        config.runtime_bin.clone(),
        config.compose_command.clone(),
        config.routing(),
    ));
    let inventory = Arc::new(StackInventory::new(runner, config.runtime_bin.clone()));

    let app = api::router(manager, inventory);
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "stackd listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("stackd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Received shutdown signal");
}
