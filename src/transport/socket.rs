//! Duplex socket seam.
//!
//! The transport speaks to a WebSocket-class persistent byte stream through
//! the [`SocketSink`]/[`SocketStream`] halves, so the connection machinery
//! can be driven against an in-memory pair in tests. The production
//! implementation rides `tokio-tungstenite` binary messages.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// Write half of a duplex byte stream.
#[async_trait]
pub trait SocketSink: Send {
    /// Send one binary message.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;
    /// Close the stream.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a duplex byte stream.
#[async_trait]
pub trait SocketStream: Send {
    /// Receive the next binary message; `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink(SplitSink<WsStream, Message>);
struct WsRecv(SplitStream<WsStream>);

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.0
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| ClientError::Websocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.0
            .close()
            .await
            .map_err(|e| ClientError::Websocket(e.to_string()))
    }
}

#[async_trait]
impl SocketStream for WsRecv {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes)),
                // pings are answered by tungstenite on flush; nothing here
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Text(text)) => {
                    trace!(len = text.len(), "ignoring unexpected text message");
                    continue;
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket close frame");
                    return None;
                }
                Err(e) => return Some(Err(ClientError::Websocket(e.to_string()))),
            }
        }
    }
}

/// Open a WebSocket connection to the endpoint.
pub async fn connect_websocket(
    endpoint: &str,
) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)> {
    let (ws, response) = connect_async(endpoint)
        .await
        .map_err(|e| ClientError::Websocket(e.to_string()))?;
    debug!(status = %response.status(), "websocket open");
    let (sink, stream) = ws.split();
    Ok((Box::new(WsSink(sink)), Box::new(WsRecv(stream))))
}

// ---- in-memory socket for tests and loopback tooling ----

struct MemorySink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl SocketSink for MemorySink {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(bytes)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        // dropping the sender ends the peer's stream
        let (tx, _) = mpsc::unbounded_channel();
        self.tx = tx;
        Ok(())
    }
}

#[async_trait]
impl SocketStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Two connected in-memory sockets: `(client half, server half)`.
///
/// Each half is a `(sink, stream)` pair; bytes sent on one half arrive on
/// the other. Used by the test suite in place of a live gateway.
#[allow(clippy::type_complexity)]
pub fn memory_socket_pair() -> (
    (Box<dyn SocketSink>, Box<dyn SocketStream>),
    (Box<dyn SocketSink>, Box<dyn SocketStream>),
) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        (
            Box::new(MemorySink { tx: client_tx }),
            Box::new(MemoryStream { rx: client_rx }),
        ),
        (
            Box::new(MemorySink { tx: server_tx }),
            Box::new(MemoryStream { rx: server_rx }),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_is_full_duplex() {
        let ((mut ctx, mut crx), (mut stx, mut srx)) = memory_socket_pair();

        ctx.send(vec![1, 2]).await.unwrap();
        assert_eq!(srx.recv().await.unwrap().unwrap(), vec![1, 2]);

        stx.send(vec![3]).await.unwrap();
        assert_eq!(crx.recv().await.unwrap().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn closing_sink_ends_peer_stream() {
        let ((mut ctx, _crx), (_stx, mut srx)) = memory_socket_pair();
        ctx.close().await.unwrap();
        assert!(srx.recv().await.is_none());
    }
}
