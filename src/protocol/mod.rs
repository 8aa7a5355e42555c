//! # Protocol Components
//!
//! The cryptographic handshake, the handshake/auth message wire codec and
//! the request/response dispatch engine.
//!
//! ## Components
//! - **Handshake**: transcript-hashed key exchange deriving the AEAD channel
//! - **Wire**: minimal varint/length-delimited codec for handshake and auth
//!   messages
//! - **Dispatcher**: correlation-id waiters and pattern listeners

pub mod dispatcher;
pub mod handshake;
pub mod wire;
