//! Noise-style handshake engine.
//!
//! Derives the authenticated channel for one connection: a running
//! transcript hash over the handshake messages, two Diffie-Hellman mixes for
//! the server and one for our static key, HKDF-SHA256 key expansion, and a
//! pinned-issuer check on the server certificate.
//!
//! **Counter discipline.** Before [`HandshakeEngine::finish`] both directions
//! advance a single shared AEAD counter (the hello exchange is strictly
//! alternating, so one counter suffices and the server depends on it). After
//! `finish`, write and read counters advance independently. The two regimes
//! are an explicit [`CounterMode`], not a flag to misread.
//!
//! Failures here (bad AEAD tag, certificate mismatch) are fatal to the
//! connection and never retried internally.

use crate::auth::KeyPair;
use crate::config::{CERT_ISSUER_SERIAL, CONN_HEADER};
use crate::error::{ClientError, Result};
use crate::protocol::wire::{self, ServerHello};
use crate::utils::crypto::{aes_gcm_decrypt, aes_gcm_encrypt, hkdf_expand, sha256};
use tracing::{debug, trace};
use zeroize::Zeroize;

/// AEAD counter state; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// Pre-completion: both directions share one counter.
    Handshake(u32),
    /// Post-completion: independent monotone counters.
    Transport {
        /// Outbound frame counter.
        write: u32,
        /// Inbound frame counter.
        read: u32,
    },
}

/// Live crypto state of one connection.
///
/// Created at connect, destroyed at close; never reused across reconnects.
pub struct HandshakeEngine {
    ephemeral: KeyPair,
    /// Transcript hash; cleared (empty AAD) once finished.
    hash: Vec<u8>,
    salt: [u8; 32],
    enc_key: [u8; 32],
    dec_key: [u8; 32],
    counters: CounterMode,
    finished: bool,
}

impl Drop for HandshakeEngine {
    fn drop(&mut self) {
        self.salt.zeroize();
        self.enc_key.zeroize();
        self.dec_key.zeroize();
    }
}

fn generate_iv(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

impl HandshakeEngine {
    /// Initialize for a new connection.
    ///
    /// The transcript starts as the protocol name (hashed down to 32 bytes
    /// if it is not exactly 32 already), then mixes in the fixed connection
    /// header and our ephemeral public key.
    pub fn new(protocol_name: &[u8], ephemeral: KeyPair) -> Self {
        let hash: [u8; 32] = if protocol_name.len() == 32 {
            let mut h = [0u8; 32];
            h.copy_from_slice(protocol_name);
            h
        } else {
            sha256(protocol_name)
        };

        let mut engine = Self {
            ephemeral,
            hash: hash.to_vec(),
            salt: hash,
            enc_key: hash,
            dec_key: hash,
            counters: CounterMode::Handshake(0),
            finished: false,
        };
        engine.mix_transcript(&CONN_HEADER);
        let ephemeral_public = engine.ephemeral.public_bytes();
        engine.mix_transcript(&ephemeral_public);
        engine
    }

    /// Our ephemeral public key, sent in the client hello.
    pub fn ephemeral_public(&self) -> [u8; 32] {
        self.ephemeral.public_bytes()
    }

    /// Whether `finish` has run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fold data into the transcript hash (no-op once finished).
    fn mix_transcript(&mut self, data: &[u8]) {
        if !self.finished {
            let mut input = Vec::with_capacity(self.hash.len() + data.len());
            input.extend_from_slice(&self.hash);
            input.extend_from_slice(data);
            self.hash = sha256(&input).to_vec();
        }
    }

    /// HKDF the input into a new salt and a fresh directionless key.
    fn mix_into_key(&mut self, input: &[u8]) {
        let mut okm = hkdf_expand(input, Some(&self.salt), 64);
        self.salt.copy_from_slice(&okm[..32]);
        self.enc_key.copy_from_slice(&okm[32..]);
        self.dec_key.copy_from_slice(&okm[32..]);
        okm.zeroize();
        self.counters = CounterMode::Handshake(0);
    }

    /// Encrypt a payload with the current write counter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = match &mut self.counters {
            CounterMode::Handshake(c) => {
                let used = *c;
                *c += 1;
                used
            }
            CounterMode::Transport { write, .. } => {
                let used = *write;
                *write += 1;
                used
            }
        };

        let iv = generate_iv(counter);
        let ciphertext = aes_gcm_encrypt(&self.enc_key, &iv, &self.hash, plaintext)?;
        self.mix_transcript(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt a payload with the current read counter.
    ///
    /// Pre-completion this advances the same counter `encrypt` uses.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let counter = match &mut self.counters {
            CounterMode::Handshake(c) => {
                let used = *c;
                *c += 1;
                used
            }
            CounterMode::Transport { read, .. } => {
                let used = *read;
                *read += 1;
                used
            }
        };

        let iv = generate_iv(counter);
        let plaintext = aes_gcm_decrypt(&self.dec_key, &iv, &self.hash, ciphertext)?;
        self.mix_transcript(ciphertext);
        Ok(plaintext)
    }

    /// Process the server hello: two DH mixes for the server's keys, the
    /// pinned certificate check, and the third mix for our static key.
    ///
    /// Returns our encrypted static public key for the client finish.
    pub fn process_server_hello(
        &mut self,
        hello: &ServerHello,
        static_key: &KeyPair,
    ) -> Result<Vec<u8>> {
        let server_ephemeral: [u8; 32] = hello
            .ephemeral
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::HandshakeFailed("bad server ephemeral".into()))?;

        self.mix_transcript(&server_ephemeral);
        self.mix_into_key(&self.ephemeral.dh(&server_ephemeral));

        let server_static: [u8; 32] = self
            .decrypt(&hello.static_enc)
            .map_err(|_| ClientError::HandshakeFailed("server static AEAD failure".into()))?
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::HandshakeFailed("bad server static key".into()))?;
        self.mix_into_key(&self.ephemeral.dh(&server_static));

        let cert_payload = self
            .decrypt(&hello.payload)
            .map_err(|_| ClientError::HandshakeFailed("certificate AEAD failure".into()))?;
        let chain = wire::decode_cert_chain(&cert_payload)?;
        let details = wire::decode_cert_details(&chain.intermediate_details)?;
        if details.issuer_serial != CERT_ISSUER_SERIAL {
            debug!(
                issuer_serial = details.issuer_serial,
                "certificate issuer serial does not match pin"
            );
            return Err(ClientError::CertificateMismatch);
        }
        trace!(serial = details.serial, "server certificate accepted");

        let static_public = static_key.public_bytes();
        let key_enc = self.encrypt(&static_public)?;
        self.mix_into_key(&static_key.dh(&server_ephemeral));

        Ok(key_enc)
    }

    /// Derive the final directional keys and switch to transport counters.
    pub fn finish(&mut self) {
        let mut okm = hkdf_expand(&[], Some(&self.salt), 64);
        self.enc_key.copy_from_slice(&okm[..32]);
        self.dec_key.copy_from_slice(&okm[32..]);
        okm.zeroize();
        self.hash.clear();
        self.counters = CounterMode::Transport { write: 0, read: 0 };
        self.finished = true;
        debug!("handshake finished, switching to transport keys");
    }

    /// Current counter state, for tests and diagnostics.
    pub fn counters(&self) -> CounterMode {
        self.counters
    }

    /// Swap encryption and decryption keys, turning this engine into its
    /// peer's view of the channel. Test-only.
    #[cfg(test)]
    pub(crate) fn swap_directions(&mut self) {
        std::mem::swap(&mut self.enc_key, &mut self.dec_key);
    }
}
