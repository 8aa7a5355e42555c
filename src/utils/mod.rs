//! # Utility Modules
//!
//! Supporting utilities for cryptography and timing.
//!
//! ## Components
//! - **Crypto**: SHA-256 / HKDF / HMAC / AES-256-GCM wrappers and secure
//!   random generation
//! - **Timeout**: async timeout wrappers mapping deadline expiry to
//!   `ClientError::Timeout`

pub mod crypto;
pub mod timeout;
