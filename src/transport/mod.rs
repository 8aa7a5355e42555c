//! # Transport
//!
//! Ownership of the socket send path and the per-connection crypto state.
//!
//! A `Transport` owns exactly one [`HandshakeEngine`] and one
//! [`FrameCodec`]; both live and die with the connection and are never
//! reused across reconnects. All outbound frames funnel through a single
//! async-mutexed send path so the AEAD write counter always matches the
//! order frames hit the wire; the receive path feeds bytes into the codec
//! strictly in arrival order.

pub mod socket;

use crate::core::framing::FrameCodec;
use crate::core::node::{Node, NodeCodec};
use crate::error::Result;
use crate::protocol::handshake::HandshakeEngine;
use socket::SocketSink;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Send half plus crypto state of one connection.
pub struct Transport {
    /// Serializes encode+send so frame order matches counter order.
    sink: tokio::sync::Mutex<Box<dyn SocketSink>>,
    noise: Mutex<HandshakeEngine>,
    framer: Mutex<FrameCodec>,
    codec: Arc<dyn NodeCodec>,
}

impl Transport {
    /// Assemble a transport around an open socket sink.
    pub fn new(
        sink: Box<dyn SocketSink>,
        noise: HandshakeEngine,
        framer: FrameCodec,
        codec: Arc<dyn NodeCodec>,
    ) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            noise: Mutex::new(noise),
            framer: Mutex::new(framer),
            codec,
        }
    }

    /// Send a raw payload as one frame.
    pub async fn send_raw(&self, payload: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().await;
        // encode under the sink lock: counter order == wire order
        let frame = {
            let mut noise = self.noise.lock().unwrap_or_else(|e| e.into_inner());
            let mut framer = self.framer.lock().unwrap_or_else(|e| e.into_inner());
            framer.encode_frame(&mut noise, payload)?
        };
        trace!(len = frame.len(), "sending frame");
        sink.send(frame).await
    }

    /// Encode and send a node.
    pub async fn send_node(&self, node: &Node) -> Result<()> {
        let payload = self.codec.encode(node);
        self.send_raw(&payload).await
    }

    /// Feed received bytes into the codec, returning every completed frame
    /// in order (decrypted and decoded once the handshake is finished).
    pub fn receive(&self, bytes: &[u8]) -> Result<Vec<(Vec<u8>, Option<Node>)>> {
        let mut noise = self.noise.lock().unwrap_or_else(|e| e.into_inner());
        let mut framer = self.framer.lock().unwrap_or_else(|e| e.into_inner());
        let mut frames = Vec::new();
        framer.decode_frames(&mut noise, self.codec.as_ref(), bytes, |raw, node| {
            frames.push((raw, node));
        })?;
        Ok(frames)
    }

    /// Run a closure against the handshake engine.
    pub fn with_noise<T>(&self, f: impl FnOnce(&mut HandshakeEngine) -> T) -> T {
        let mut noise = self.noise.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut noise)
    }

    /// Node codec shared with the dispatch layer.
    pub fn codec(&self) -> Arc<dyn NodeCodec> {
        self.codec.clone()
    }

    /// Close the underlying socket.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}
