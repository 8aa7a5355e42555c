//! # Core Components
//!
//! The application node shape and the encrypted frame layer.
//!
//! ## Components
//! - **Node**: the tag/attributes/content tree every application payload
//!   decodes to, plus the [`node::NodeCodec`] seam for the external binary
//!   tree codec
//! - **Framing**: 24-bit length-prefixed frames with a one-time connection
//!   intro, encrypted once the handshake is finished

pub mod framing;
pub mod node;
