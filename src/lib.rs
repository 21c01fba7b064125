pub mod config;
pub mod server;

use std::sync::Arc;

use self::config::Config;

use anyhow::{Result, anyhow};
use base64::{Engine, prelude::BASE64_STANDARD};
use codec::crypto::{SECRET_KEY_LENGTH, SecretKey};
use service::path::PathRegistry;

/// In order to let the integration test directly use the salty-server crate
/// and start the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    let mut keys = Vec::with_capacity(config.signaling.keys.len());
    for encoded in &config.signaling.keys {
        let bytes = BASE64_STANDARD.decode(encoded)?;
        let secret: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("server permanent keys must be 32 bytes"))?;

        keys.push(SecretKey::from_bytes(secret));
    }

    // Without a configured key the server still works, but clients cannot
    // pin it across restarts.
    if keys.is_empty() {
        let key = SecretKey::generate();
        log::warn!(
            "no server permanent key configured, generated an ephemeral one: {}",
            BASE64_STANDARD.encode(key.public_key().as_bytes())
        );

        keys.push(key);
    }

    server::start(config, Arc::new(PathRegistry::new()), Arc::new(keys)).await
}
