//! Stream transports.
//!
//! A [`Connector`] opens one [`Link`]: a sink of outbound text frames and a
//! stream of inbound ones. The connection manager only ever sees this pair,
//! so tests drive it with in-memory channels instead of a socket.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::NetError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = NetError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, NetError>> + Send>>;

/// One open transport connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = NetError> + Send + 'static,
        St: Stream<Item = Result<String, NetError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh link. Called again by the connection manager after every
    /// connection loss.
    async fn connect(&self) -> Result<Link, NetError>;
}

/// WebSocket transport carrying one JSON envelope per text frame.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, NetError> {
        let (ws, response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(NetError::from)
            .with(|frame: String| future::ready(Ok::<_, NetError>(WsMessage::text(frame))));

        // Control frames are answered by tungstenite itself; binary frames are
        // not part of the protocol.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(NetError::from(e))),
            })
        });

        Ok(Link::new(sink, stream))
    }
}
