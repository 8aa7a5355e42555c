//! # msgwire
//!
//! Secure transport core for a multi-device messaging network: an
//! encrypted WebSocket channel established with a Noise-style XX
//! handshake, length-prefixed binary framing, tagged request/response
//! correlation, device pairing, and a keepalive-supervised connection
//! lifecycle.
//!
//! ## Layers
//!
//! - [`core`]: the [`Node`](core::node::Node) tree, its codec seam, and
//!   the 24-bit length-prefixed frame codec
//! - [`protocol`]: handshake engine, minimal protobuf wire codec, and the
//!   inbound-node dispatcher
//! - [`transport`]: socket seam plus the ordered encrypt-and-send path
//! - [`service`]: the [`Client`] lifecycle state machine and pairing
//! - [`auth`]: key material and credentials
//!
//! ## Quick Start
//!
//! ```no_run
//! use msgwire::{Client, ClientConfig, Credentials, SimpleCodec};
//! use std::sync::Arc;
//!
//! # async fn run() -> msgwire::Result<()> {
//! let config = ClientConfig::default();
//! let creds = Credentials::generate();
//! let client = Client::connect(config, Arc::new(SimpleCodec), creds).await?;
//!
//! let mut updates = client.updates();
//! while let Ok(update) = updates.recv().await {
//!     if let Some(qr) = &update.pairing_ref {
//!         println!("scan to pair: {qr}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! A connection is single-use: once it closes, build a new `Client` with
//! the (possibly updated) credentials. A close reason of
//! [`RestartRequired`](error::DisconnectReason::RestartRequired) after a
//! pairing is the expected success path, not a failure.

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use auth::{Credentials, KeyPair};
pub use config::ClientConfig;
pub use core::node::{Node, NodeCodec, NodeContent, SimpleCodec};
pub use error::{ClientError, DisconnectReason, Result};
pub use protocol::dispatcher::{ListenerId, ListenerKey};
pub use service::lifecycle::{Client, ConnectionState, ConnectionUpdate};
