use gateway::collaborators::{
    DirDeviceKeystore, DirFirmwareStore, LoggingApiClient, MemoryAttributeStore,
};
use gateway::publisher::LocalPublisher;
use gateway::state::GatewayState;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match env::var("GATEWAY_CONFIG") {
        Ok(path) => gateway::load_config_from_path(Path::new(&path)),
        Err(_) => gateway::load_config(),
    }
    .expect("failed to load gateway config");

    let server_key_pem = std::fs::read_to_string(&config.keys.server_key_file)
        .expect("failed to read server key file");
    let server_key =
        cl_crypto::private_key_from_pem(&server_key_pem).expect("failed to parse server key");

    let keystore = DirDeviceKeystore::new(&config.keys.device_keys_dir);
    let firmware = DirFirmwareStore::new(&config.firmware.dir);

    let bind = config.server.bind.clone();
    let environment = config.logging.environment.clone();
    let state = GatewayState::new(
        config,
        server_key,
        Arc::new(LocalPublisher::new()),
        Arc::new(MemoryAttributeStore::new()),
        Arc::new(LoggingApiClient),
        Arc::new(firmware),
        Arc::new(keystore),
    );

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("failed to bind");
    info!(addr = %bind, environment = %environment, "gateway listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    gateway::serve(listener, state, shutdown_rx).await;
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
