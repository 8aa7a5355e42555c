//! Handshake and auth message codec.
//!
//! These messages ride a generic structured-message wire format (varint /
//! length-delimited fields, protobuf-compatible). The handful of message
//! shapes the transport needs is small enough that the crate carries a
//! hand-rolled writer/reader instead of generated code.

use crate::error::{ClientError, Result};

// ---- low-level wire primitives ----

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn write_bytes_field(out: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    write_varint(out, u64::from(field << 3 | 2));
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn write_varint_field(out: &mut Vec<u8>, field: u32, value: u64) {
    write_varint(out, u64::from(field << 3));
    write_varint(out, value);
}

/// One decoded field value.
enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Cursor over an encoded message.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| ClientError::Codec("truncated varint".into()))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(ClientError::Codec("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Next (field number, value), skipping fixed-width wire types.
    fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>> {
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        match key & 0x7 {
            0 => Ok(Some((field, FieldValue::Varint(self.read_varint()?)))),
            2 => {
                let len = self.read_varint()? as usize;
                let end = self
                    .pos
                    .checked_add(len)
                    .filter(|&e| e <= self.bytes.len())
                    .ok_or_else(|| ClientError::Codec("truncated field".into()))?;
                let bytes = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(Some((field, FieldValue::Bytes(bytes))))
            }
            1 => {
                self.pos = self
                    .pos
                    .checked_add(8)
                    .filter(|&e| e <= self.bytes.len())
                    .ok_or_else(|| ClientError::Codec("truncated fixed64".into()))?;
                self.next_field()
            }
            5 => {
                self.pos = self
                    .pos
                    .checked_add(4)
                    .filter(|&e| e <= self.bytes.len())
                    .ok_or_else(|| ClientError::Codec("truncated fixed32".into()))?;
                self.next_field()
            }
            other => Err(ClientError::Codec(format!("unsupported wire type {other}"))),
        }
    }
}

// ---- handshake messages ----

/// Server half of the hello exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHello {
    /// Server ephemeral public key.
    pub ephemeral: Vec<u8>,
    /// Encrypted server static public key.
    pub static_enc: Vec<u8>,
    /// Encrypted certificate payload.
    pub payload: Vec<u8>,
}

const HS_CLIENT_HELLO: u32 = 2;
const HS_SERVER_HELLO: u32 = 3;
const HS_CLIENT_FINISH: u32 = 4;

/// Encode `clientHello { ephemeral }`.
pub fn encode_client_hello(ephemeral: &[u8]) -> Vec<u8> {
    let mut hello = Vec::new();
    write_bytes_field(&mut hello, 1, ephemeral);

    let mut out = Vec::new();
    write_bytes_field(&mut out, HS_CLIENT_HELLO, &hello);
    out
}

/// Encode `clientFinish { static, payload }`.
pub fn encode_client_finish(static_enc: &[u8], payload_enc: &[u8]) -> Vec<u8> {
    let mut finish = Vec::new();
    write_bytes_field(&mut finish, 1, static_enc);
    write_bytes_field(&mut finish, 2, payload_enc);

    let mut out = Vec::new();
    write_bytes_field(&mut out, HS_CLIENT_FINISH, &finish);
    out
}

/// Decode the `serverHello` branch of a handshake message.
pub fn decode_server_hello(bytes: &[u8]) -> Result<ServerHello> {
    let mut reader = Reader::new(bytes);
    let mut server_hello = None;
    while let Some((field, value)) = reader.next_field()? {
        if field == HS_SERVER_HELLO {
            if let FieldValue::Bytes(inner) = value {
                server_hello = Some(inner);
            }
        }
    }
    let inner = server_hello
        .ok_or_else(|| ClientError::HandshakeFailed("missing serverHello".into()))?;

    let mut hello = ServerHello::default();
    let mut reader = Reader::new(inner);
    while let Some((field, value)) = reader.next_field()? {
        if let FieldValue::Bytes(bytes) = value {
            match field {
                1 => hello.ephemeral = bytes.to_vec(),
                2 => hello.static_enc = bytes.to_vec(),
                3 => hello.payload = bytes.to_vec(),
                _ => {}
            }
        }
    }
    if hello.ephemeral.len() != 32 {
        return Err(ClientError::HandshakeFailed(
            "serverHello ephemeral must be 32 bytes".into(),
        ));
    }
    Ok(hello)
}

/// Client half of the finish exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFinish {
    /// Encrypted client static public key.
    pub static_enc: Vec<u8>,
    /// Encrypted auth payload.
    pub payload: Vec<u8>,
}

/// Encode `serverHello { ephemeral, static, payload }`.
///
/// The server side of the exchange; the crate uses it to play the peer in
/// loopback tests.
pub fn encode_server_hello(hello: &ServerHello) -> Vec<u8> {
    let mut inner = Vec::new();
    write_bytes_field(&mut inner, 1, &hello.ephemeral);
    write_bytes_field(&mut inner, 2, &hello.static_enc);
    write_bytes_field(&mut inner, 3, &hello.payload);

    let mut out = Vec::new();
    write_bytes_field(&mut out, HS_SERVER_HELLO, &inner);
    out
}

/// Decode the `clientHello` branch: the bare ephemeral key.
pub fn decode_client_hello(bytes: &[u8]) -> Result<[u8; 32]> {
    let inner = single_bytes_field(bytes, HS_CLIENT_HELLO)
        .ok_or_else(|| ClientError::HandshakeFailed("missing clientHello".into()))?;
    let ephemeral = single_bytes_field(&inner, 1)
        .ok_or_else(|| ClientError::HandshakeFailed("missing client ephemeral".into()))?;
    ephemeral
        .as_slice()
        .try_into()
        .map_err(|_| ClientError::HandshakeFailed("client ephemeral must be 32 bytes".into()))
}

/// Decode the `clientFinish` branch.
pub fn decode_client_finish(bytes: &[u8]) -> Result<ClientFinish> {
    let inner = single_bytes_field(bytes, HS_CLIENT_FINISH)
        .ok_or_else(|| ClientError::HandshakeFailed("missing clientFinish".into()))?;
    let mut finish = ClientFinish::default();
    let mut reader = Reader::new(&inner);
    while let Some((field, value)) = reader.next_field()? {
        if let FieldValue::Bytes(bytes) = value {
            match field {
                1 => finish.static_enc = bytes.to_vec(),
                2 => finish.payload = bytes.to_vec(),
                _ => {}
            }
        }
    }
    Ok(finish)
}

/// First length-delimited occurrence of `field`, if any.
fn single_bytes_field(bytes: &[u8], field: u32) -> Option<Vec<u8>> {
    let mut reader = Reader::new(bytes);
    while let Ok(Some((f, value))) = reader.next_field() {
        if f == field {
            if let FieldValue::Bytes(bytes) = value {
                return Some(bytes.to_vec());
            }
        }
    }
    None
}

// ---- certificate chain ----

/// Decoded certificate details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertDetails {
    /// Certificate serial.
    pub serial: u32,
    /// Issuer serial, checked against the pinned constant.
    pub issuer_serial: u32,
    /// Certified public key.
    pub key: Vec<u8>,
    /// Validity start, seconds since the epoch (0 when absent).
    pub not_before: u64,
    /// Validity end, seconds since the epoch (0 when absent).
    pub not_after: u64,
}

/// Certificate chain carried in the encrypted server hello payload.
#[derive(Debug, Clone, Default)]
pub struct CertChain {
    /// Leaf certificate details (raw).
    pub leaf_details: Vec<u8>,
    /// Intermediate certificate details (raw).
    pub intermediate_details: Vec<u8>,
}

fn decode_certificate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::new(bytes);
    let mut details = Vec::new();
    while let Some((field, value)) = reader.next_field()? {
        if field == 1 {
            if let FieldValue::Bytes(bytes) = value {
                details = bytes.to_vec();
            }
        }
    }
    Ok(details)
}

/// Decode the certificate chain.
pub fn decode_cert_chain(bytes: &[u8]) -> Result<CertChain> {
    let mut chain = CertChain::default();
    let mut reader = Reader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        if let FieldValue::Bytes(cert) = value {
            match field {
                1 => chain.leaf_details = decode_certificate(cert)?,
                2 => chain.intermediate_details = decode_certificate(cert)?,
                _ => {}
            }
        }
    }
    if chain.intermediate_details.is_empty() {
        return Err(ClientError::HandshakeFailed(
            "certificate chain missing intermediate".into(),
        ));
    }
    Ok(chain)
}

/// Decode certificate details.
pub fn decode_cert_details(bytes: &[u8]) -> Result<CertDetails> {
    let mut details = CertDetails::default();
    let mut reader = Reader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (1, FieldValue::Varint(v)) => details.serial = v as u32,
            (2, FieldValue::Varint(v)) => details.issuer_serial = v as u32,
            (3, FieldValue::Bytes(b)) => details.key = b.to_vec(),
            (4, FieldValue::Varint(v)) => details.not_before = v,
            (5, FieldValue::Varint(v)) => details.not_after = v,
            _ => {}
        }
    }
    Ok(details)
}

/// Encode a certificate chain (test servers need to produce one).
pub fn encode_cert_chain(leaf_details: &[u8], intermediate_details: &[u8]) -> Vec<u8> {
    let mut leaf = Vec::new();
    write_bytes_field(&mut leaf, 1, leaf_details);
    let mut intermediate = Vec::new();
    write_bytes_field(&mut intermediate, 1, intermediate_details);

    let mut out = Vec::new();
    write_bytes_field(&mut out, 1, &leaf);
    write_bytes_field(&mut out, 2, &intermediate);
    out
}

/// Encode certificate details.
pub fn encode_cert_details(details: &CertDetails) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint_field(&mut out, 1, u64::from(details.serial));
    write_varint_field(&mut out, 2, u64::from(details.issuer_serial));
    write_bytes_field(&mut out, 3, &details.key);
    if details.not_before != 0 {
        write_varint_field(&mut out, 4, details.not_before);
    }
    if details.not_after != 0 {
        write_varint_field(&mut out, 5, details.not_after);
    }
    out
}

// ---- auth payloads ----

/// Device-pairing registration data inside the registration payload.
#[derive(Debug, Clone)]
pub struct RegistrationData {
    /// Registration id, big-endian encoded.
    pub registration_id: u32,
    /// Identity public key.
    pub identity_key: [u8; 32],
    /// Signed pre-key id.
    pub signed_pre_key_id: u32,
    /// Signed pre-key public key.
    pub signed_pre_key: [u8; 32],
    /// Signature over the versioned signed pre-key.
    pub signed_pre_key_signature: Vec<u8>,
    /// Client build hash, identifying the software revision to the server.
    pub build_hash: Vec<u8>,
}

const CP_USERNAME: u32 = 1;
const CP_PASSIVE: u32 = 3;
const CP_DEVICE: u32 = 18;
const CP_REG_DATA: u32 = 19;

const KEY_TYPE_CURVE25519: u32 = 5;

/// Encode the registration payload sent when no identity is bound yet.
pub fn encode_registration_payload(data: &RegistrationData) -> Vec<u8> {
    let mut reg = Vec::new();
    write_bytes_field(&mut reg, 1, &data.registration_id.to_be_bytes());
    write_bytes_field(&mut reg, 2, &KEY_TYPE_CURVE25519.to_be_bytes()[3..]);
    write_bytes_field(&mut reg, 3, &data.identity_key);
    write_bytes_field(&mut reg, 4, &data.signed_pre_key_id.to_be_bytes()[1..]);
    write_bytes_field(&mut reg, 5, &data.signed_pre_key);
    write_bytes_field(&mut reg, 6, &data.signed_pre_key_signature);
    if !data.build_hash.is_empty() {
        write_bytes_field(&mut reg, 7, &data.build_hash);
    }

    let mut out = Vec::new();
    write_varint_field(&mut out, CP_PASSIVE, 0);
    write_bytes_field(&mut out, CP_REG_DATA, &reg);
    out
}

/// Encode the login payload sent when an identity is already bound.
///
/// `jid` has the shape `user.agent:device@server`; the numeric user part and
/// the device index are what the server routes on.
pub fn encode_login_payload(jid: &str) -> Result<Vec<u8>> {
    let (user_part, _server) = jid
        .split_once('@')
        .ok_or_else(|| ClientError::Codec(format!("malformed jid: {jid}")))?;
    let (user, device) = match user_part.split_once(':') {
        Some((user, device)) => (
            user,
            device
                .parse::<u32>()
                .map_err(|_| ClientError::Codec(format!("malformed device in jid: {jid}")))?,
        ),
        None => (user_part, 0),
    };
    let user = user.split('.').next().unwrap_or(user);
    let username: u64 = user
        .parse()
        .map_err(|_| ClientError::Codec(format!("non-numeric user in jid: {jid}")))?;

    let mut out = Vec::new();
    write_varint_field(&mut out, CP_USERNAME, username);
    write_varint_field(&mut out, CP_PASSIVE, 1);
    write_varint_field(&mut out, CP_DEVICE, u64::from(device));
    Ok(out)
}

// ---- pairing device identity ----

/// HMAC-wrapped signed device identity from the pair-success node.
#[derive(Debug, Clone, Default)]
pub struct SignedDeviceIdentityHmac {
    /// Encoded [`SignedDeviceIdentity`].
    pub details: Vec<u8>,
    /// HMAC-SHA256 over `details` keyed with the advertising secret.
    pub hmac: Vec<u8>,
}

/// Signed device identity binding this device to the account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedDeviceIdentity {
    /// Encoded [`DeviceIdentity`].
    pub details: Vec<u8>,
    /// Account signing key.
    pub account_signature_key: Vec<u8>,
    /// Account signature over (tag ‖ details ‖ device identity key).
    pub account_signature: Vec<u8>,
    /// Device signature over (tag ‖ details ‖ device identity key ‖ account key).
    pub device_signature: Vec<u8>,
}

/// Inner device identity details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Raw device id.
    pub raw_id: u32,
    /// Server timestamp.
    pub timestamp: u64,
    /// Key index, repeated back in the signed reply.
    pub key_index: u32,
}

/// Decode the HMAC wrapper.
pub fn decode_identity_hmac(bytes: &[u8]) -> Result<SignedDeviceIdentityHmac> {
    let mut out = SignedDeviceIdentityHmac::default();
    let mut reader = Reader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        if let FieldValue::Bytes(b) = value {
            match field {
                1 => out.details = b.to_vec(),
                2 => out.hmac = b.to_vec(),
                _ => {}
            }
        }
    }
    if out.details.is_empty() || out.hmac.is_empty() {
        return Err(ClientError::PairingFailed(
            "device identity HMAC wrapper incomplete".into(),
        ));
    }
    Ok(out)
}

/// Encode the HMAC wrapper (used by test servers).
pub fn encode_identity_hmac(identity: &SignedDeviceIdentityHmac) -> Vec<u8> {
    let mut out = Vec::new();
    write_bytes_field(&mut out, 1, &identity.details);
    write_bytes_field(&mut out, 2, &identity.hmac);
    out
}

/// Decode a signed device identity.
pub fn decode_signed_identity(bytes: &[u8]) -> Result<SignedDeviceIdentity> {
    let mut out = SignedDeviceIdentity::default();
    let mut reader = Reader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        if let FieldValue::Bytes(b) = value {
            match field {
                1 => out.details = b.to_vec(),
                2 => out.account_signature_key = b.to_vec(),
                3 => out.account_signature = b.to_vec(),
                4 => out.device_signature = b.to_vec(),
                _ => {}
            }
        }
    }
    if out.details.is_empty() || out.account_signature.is_empty() {
        return Err(ClientError::PairingFailed(
            "signed device identity incomplete".into(),
        ));
    }
    Ok(out)
}

/// Encode a signed device identity.
///
/// The reply to the server omits the account signature key; pass an empty
/// slice there to skip the field.
pub fn encode_signed_identity(identity: &SignedDeviceIdentity) -> Vec<u8> {
    let mut out = Vec::new();
    write_bytes_field(&mut out, 1, &identity.details);
    if !identity.account_signature_key.is_empty() {
        write_bytes_field(&mut out, 2, &identity.account_signature_key);
    }
    write_bytes_field(&mut out, 3, &identity.account_signature);
    if !identity.device_signature.is_empty() {
        write_bytes_field(&mut out, 4, &identity.device_signature);
    }
    out
}

/// Decode the inner device identity details.
pub fn decode_device_identity(bytes: &[u8]) -> Result<DeviceIdentity> {
    let mut out = DeviceIdentity::default();
    let mut reader = Reader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        if let FieldValue::Varint(v) = value {
            match field {
                1 => out.raw_id = v as u32,
                2 => out.timestamp = v,
                3 => out.key_index = v as u32,
                _ => {}
            }
        }
    }
    Ok(out)
}

/// Encode device identity details.
pub fn encode_device_identity(identity: &DeviceIdentity) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint_field(&mut out, 1, u64::from(identity.raw_id));
    write_varint_field(&mut out, 2, identity.timestamp);
    write_varint_field(&mut out, 3, u64::from(identity.key_index));
    out
}
