//! # Connection Services
//!
//! The connection lifecycle state machine and the device-pairing bootstrap
//! layered on top of it.
//!
//! ## Components
//! - **Lifecycle**: connect → handshake → authenticate → open, keepalive
//!   watchdog, query correlation, logout and idempotent teardown
//! - **Pairing**: QR/linking-code bootstrap while unauthenticated

pub mod lifecycle;
pub mod pairing;
