//! Socket transport behind the connection manager.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tw_common::TransportError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One open socket, split into text-frame halves. The stream ends (or
/// yields an error) when the socket closes.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links. The production implementation is [`WsConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

/// WebSocket connector built on `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;
        tracing::debug!(url, "WebSocket handshake complete");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(Message::Text(frame))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("Dropping non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    Some(Err(TransportError::Closed(reason)))
                }
                // Pings are answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Closed(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
