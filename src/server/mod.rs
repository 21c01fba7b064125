mod connection;

use crate::config::Config;

use std::sync::Arc;

use anyhow::Result;
use codec::crypto::SecretKey;
use service::path::PathRegistry;
use tokio::net::TcpListener;

/// State shared by every connection: the configuration, the path registry
/// and the advertised server permanent keys.
pub struct Server {
    pub config: Arc<Config>,
    pub registry: Arc<PathRegistry>,
    pub keys: Arc<Vec<SecretKey>>,
}

/// Run the accept loop. Each accepted connection is served by its own task.
pub async fn start(
    config: Arc<Config>,
    registry: Arc<PathRegistry>,
    keys: Arc<Vec<SecretKey>>,
) -> Result<()> {
    let listener = TcpListener::bind(config.signaling.listen).await?;

    log::info!("signaling server listening: {}", config.signaling.listen);

    let server = Arc::new(Server {
        config,
        registry,
        keys,
    });

    while let Ok((stream, addr)) = listener.accept().await {
        log::info!("websocket connection accept: addr={:?}", addr);

        tokio::spawn(connection::launch(server.clone(), stream, addr));
    }

    Ok(())
}
