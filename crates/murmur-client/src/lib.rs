//! # murmur-client
//!
//! Client-side chat state: the store, selection handling, reconciliation of
//! fetch results and stream events, and the event loop tying them to the
//! network layer.

pub mod client;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod selection;
pub mod store;
pub mod sync;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::{ChatClient, ChatHandle};
pub use config::ClientConfig;
pub use error::ClientError;
pub use selection::{Selection, SelectionController};
pub use store::{ChatState, MessageOrigin, Store};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("murmur_client=debug,murmur_net=debug,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
