use crate::api::ApiServer;
use crate::config::Config;
use crate::error::Result;
use crate::fanout::FanoutBus;
use crate::realtime::RealtimeListener;
use crate::server::Server;
use crate::storage::SqliteStorage;
use crate::wrapper::ServerWrapper;
use std::sync::Arc;
use tracing::{error, info};

/// Validate keys, open storage and build the shared wrapper
///
/// Fails before anything is bound if the key material is bad or a stored
/// record does not decrypt.
pub async fn open(config: &Config) -> Result<Arc<ServerWrapper<SqliteStorage>>> {
    let cipher = config.security.cipher()?;
    let auth = Arc::new(config.security.authenticator()?);

    // Ensure data directory exists
    if let Some(parent) = config.server.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("Opening database at: {:?}", config.server.db_path);
    let storage = Arc::new(SqliteStorage::open(
        &config.server.db_path,
        &config.storage,
    )?);

    let server = Arc::new(Server::new(storage, cipher).await?);
    info!("Core server initialized");

    let bus = FanoutBus::new(config.realtime.subscriber_buffer);
    Ok(Arc::new(ServerWrapper::new(server, bus, auth)))
}

/// Run the settings API and the realtime endpoint until either stops
pub async fn run(config: &Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let wrapper = open(config).await?;
    let max_bytes = config.realtime.max_frame_bytes;

    // Start API server (RESP/TCP)
    let api_server = ApiServer::new(Arc::clone(&wrapper), max_bytes);
    let api_addr = config.server.api_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run(&api_addr).await {
            error!("API server error: {}", e);
        }
    });

    // Start realtime endpoint (protobuf/TCP)
    let realtime = RealtimeListener::new(Arc::clone(&wrapper), max_bytes);
    let realtime_addr = config.server.realtime_addr.clone();
    let realtime_handle = tokio::spawn(async move {
        if let Err(e) = realtime.run(&realtime_addr).await {
            error!("Realtime server error: {}", e);
        }
    });

    info!(
        "Settingsync running: API={}, realtime={}",
        config.server.api_addr, config.server.realtime_addr
    );

    // Wait for both endpoint servers
    tokio::try_join!(api_handle, realtime_handle)?;
    Ok(())
}
