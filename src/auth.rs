//! # Credentials & Key Material
//!
//! Key pairs and account state for one device: the noise static key, the
//! signing identity, the signed pre-key bundle and one-time pre-key
//! bookkeeping. Persistence of this state is the caller's concern; the crate
//! only mutates it (pairing absorbs the server credential bundle, pre-key
//! counters advance on upload).

use crate::utils::crypto::random_bytes;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Version byte prefixed to public keys in signed bundles.
pub const KEY_BUNDLE_TYPE: u8 = 5;

/// An x25519 key pair.
///
/// The secret half zeroizes on drop (via `x25519-dalek`).
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Diffie-Hellman agreement with a raw peer public key.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their = PublicKey::from(*their_public);
        self.secret.diffie_hellman(&their).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the secret half
        f.debug_struct("KeyPair")
            .field("public", &self.public_bytes())
            .finish_non_exhaustive()
    }
}

/// A pre-key signed by the device identity.
#[derive(Debug, Clone)]
pub struct SignedKeyPair {
    /// The signed x25519 key pair.
    pub key_pair: KeyPair,
    /// Bundle key id.
    pub key_id: u32,
    /// Ed25519 signature over the versioned public key.
    pub signature: Vec<u8>,
}

/// Identity the server bound to this device during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundIdentity {
    /// Full device address on the network.
    pub jid: String,
    /// Display name, if the server supplied one.
    pub name: String,
}

/// Account credential bundle received on pair-success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Raw signed device-identity details.
    pub details: Vec<u8>,
    /// Server account signing key.
    pub account_signature_key: Vec<u8>,
    /// Server signature binding our identity to the account.
    pub account_signature: Vec<u8>,
    /// Our signature over the binding.
    pub device_signature: Vec<u8>,
}

/// Full credential state of one device.
pub struct Credentials {
    /// Static noise key, mixed into the handshake.
    pub noise_key: KeyPair,
    /// Ed25519 signing identity.
    pub identity_key: SigningKey,
    /// Signed pre-key uploaded with the bundle.
    pub signed_pre_key: SignedKeyPair,
    /// Registration id (14 bits).
    pub registration_id: u16,
    /// Advertising secret shared with the primary device via the QR payload,
    /// base64-encoded.
    pub adv_secret_key: String,
    /// Next pre-key id to allocate.
    pub next_pre_key_id: u32,
    /// First pre-key id not yet uploaded.
    pub first_unuploaded_pre_key_id: u32,
    /// Whether a pre-key batch was ever uploaded.
    pub server_has_pre_keys: bool,
    /// Bound identity after pairing, `None` while unregistered.
    pub me: Option<BoundIdentity>,
    /// Account bundle after pairing.
    pub account: Option<Account>,
}

impl Credentials {
    /// Fresh, unregistered credentials.
    pub fn generate() -> Self {
        let identity_key = SigningKey::generate(&mut OsRng);
        let signed_pre_key = Self::signed_key_pair(&identity_key, 1);
        let registration_id = u16::from_be_bytes(random_bytes::<2>()) & 0x3fff;
        let adv_secret_key = BASE64.encode(random_bytes::<32>());

        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            registration_id,
            adv_secret_key,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            server_has_pre_keys: false,
            me: None,
            account: None,
        }
    }

    /// Generate and sign a pre-key under the given identity.
    pub fn signed_key_pair(identity: &SigningKey, key_id: u32) -> SignedKeyPair {
        let key_pair = KeyPair::generate();
        let signature = identity
            .sign(&versioned_public(&key_pair.public_bytes()))
            .to_bytes()
            .to_vec();
        SignedKeyPair {
            key_pair,
            key_id,
            signature,
        }
    }

    /// Public identity key bytes.
    pub fn identity_public(&self) -> [u8; 32] {
        self.identity_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes with the identity key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.identity_key.sign(data).to_bytes()
    }

    /// Advertising secret as raw bytes.
    pub fn adv_secret_bytes(&self) -> Vec<u8> {
        BASE64.decode(&self.adv_secret_key).unwrap_or_default()
    }

    /// Allocate the next `count` one-time pre-keys.
    ///
    /// Advances `next_pre_key_id`; the caller marks them uploaded by calling
    /// [`Credentials::mark_pre_keys_uploaded`] once the server accepted them.
    pub fn generate_pre_keys(&mut self, count: u32) -> Vec<(u32, KeyPair)> {
        let start = self.next_pre_key_id;
        let keys: Vec<(u32, KeyPair)> = (start..start + count)
            .map(|id| (id, KeyPair::generate()))
            .collect();
        self.next_pre_key_id = start + count;
        keys
    }

    /// Record that all allocated pre-keys made it to the server.
    pub fn mark_pre_keys_uploaded(&mut self, last_id: u32) {
        self.server_has_pre_keys = true;
        self.first_unuploaded_pre_key_id = self.first_unuploaded_pre_key_id.max(last_id + 1);
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("registration_id", &self.registration_id)
            .field("me", &self.me)
            .field("server_has_pre_keys", &self.server_has_pre_keys)
            .field("next_pre_key_id", &self.next_pre_key_id)
            .finish_non_exhaustive()
    }
}

/// Prefix the version byte expected by signed key bundles.
pub fn versioned_public(public: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = KEY_BUNDLE_TYPE;
    out[1..].copy_from_slice(public);
    out
}

/// Verify an Ed25519 signature against a raw public key.
pub fn verify_signature(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}
