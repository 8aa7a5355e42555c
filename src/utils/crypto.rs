//! Cryptographic primitive wrappers.
//!
//! Thin, infallible-where-possible wrappers over the RustCrypto stack so the
//! protocol modules read as operations rather than cipher plumbing. AEAD is
//! AES-256-GCM with the 16-byte tag appended to the ciphertext.

use crate::error::{ClientError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HKDF-SHA256 expansion of `ikm` with the given salt and empty info.
pub fn hkdf_expand(ikm: &[u8], salt: Option<&[u8]>, len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = vec![0u8; len];
    // expand only fails for absurd output lengths (> 255 * 32 bytes)
    hk.expand(&[], &mut okm)
        .unwrap_or_else(|_| unreachable!("HKDF output length within bounds"));
    okm
}

/// HMAC-SHA256 over `data` with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// AES-256-GCM encryption; the authentication tag is appended.
pub fn aes_gcm_encrypt(key: &[u8; 32], iv: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ClientError::Crypto)?;
    cipher
        .encrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| ClientError::Crypto)
}

/// AES-256-GCM decryption; expects the tag appended to the ciphertext.
pub fn aes_gcm_decrypt(key: &[u8; 32], iv: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ClientError::Crypto)?;
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ClientError::Crypto)
}

/// Cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}
