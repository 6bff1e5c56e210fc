// Network layer: the shared event-stream connection and the data-fetch API.

pub mod api;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod transport;

pub use api::{ApiConfig, ChatApi, HttpChatApi};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::NetError;
pub use listeners::{Handler, Subscription};
pub use transport::{Connector, Link, WsConnector};
