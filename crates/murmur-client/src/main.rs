//! Headless murmur client.
//!
//! Connects to the configured server, keeps the chat state in sync and logs
//! a summary whenever it changes, until Ctrl+C.

use std::sync::Arc;

use murmur_client::{ChatClient, ClientConfig};
use murmur_net::{ChatApi, ConnectionManager, HttpChatApi, WsConnector};
use murmur_shared::constants::APP_NAME;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    murmur_client::init_tracing();

    info!("Starting {APP_NAME} v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(
        api = %config.api_url,
        stream = %config.stream_url,
        user = ?config.user_id,
        api_key_set = config.api_key.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Build the network layer
    // -----------------------------------------------------------------------
    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(config.api_config())?);
    let connection = ConnectionManager::new(
        Arc::new(WsConnector::new(config.stream_url.clone())),
        config.connection_config(),
    );

    // -----------------------------------------------------------------------
    // 4. Run the client until Ctrl+C
    // -----------------------------------------------------------------------
    let handle = ChatClient::spawn(config, connection.clone(), api);
    let mut updates = handle.watch();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                info!(
                    user = ?state.current_user.as_ref().map(|u| u.name.as_str()),
                    channels = state.channels.len(),
                    conversations = state.conversations.len(),
                    selection = ?state.selection,
                    visible_messages = state.selected_messages().len(),
                    typing = state.typing.len(),
                    "State updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    connection.disconnect().await;
    info!("Goodbye");
    Ok(())
}
