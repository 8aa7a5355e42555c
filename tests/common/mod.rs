//! In-process peer for the integration tests.
//!
//! [`Peer`] speaks the server side of the protocol over one half of a
//! memory socket pair: it accepts the three-message handshake, derives the
//! mirrored transport keys, and then exchanges encrypted frames, so a real
//! `Client` can be driven end to end without a network.

// not every test binary uses the whole peer surface
#![allow(dead_code)]

use msgwire::auth::KeyPair;
use msgwire::config::{CONN_HEADER, PROTOCOL_NAME};
use msgwire::core::node::{Node, NodeCodec, SimpleCodec};
use msgwire::protocol::wire;
use msgwire::transport::socket::{SocketSink, SocketStream};
use msgwire::utils::crypto::{aes_gcm_decrypt, aes_gcm_encrypt, hkdf_expand, sha256};

/// Mirror of the connection crypto, seen from the server.
struct PeerCrypto {
    hash: Vec<u8>,
    salt: [u8; 32],
    enc_key: [u8; 32],
    dec_key: [u8; 32],
    counter: u32,
    write: u32,
    read: u32,
    finished: bool,
}

fn iv_for(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

impl PeerCrypto {
    fn new() -> Self {
        let mut crypto = Self {
            hash: PROTOCOL_NAME.to_vec(),
            salt: *PROTOCOL_NAME,
            enc_key: *PROTOCOL_NAME,
            dec_key: *PROTOCOL_NAME,
            counter: 0,
            write: 0,
            read: 0,
            finished: false,
        };
        crypto.mix(&CONN_HEADER);
        crypto
    }

    fn mix(&mut self, data: &[u8]) {
        if !self.finished {
            let mut input = self.hash.clone();
            input.extend_from_slice(data);
            self.hash = sha256(&input).to_vec();
        }
    }

    fn mix_key(&mut self, input: &[u8]) {
        let okm = hkdf_expand(input, Some(&self.salt), 64);
        self.salt.copy_from_slice(&okm[..32]);
        self.enc_key.copy_from_slice(&okm[32..]);
        self.dec_key.copy_from_slice(&okm[32..]);
        self.counter = 0;
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let counter = if self.finished {
            let c = self.write;
            self.write += 1;
            c
        } else {
            let c = self.counter;
            self.counter += 1;
            c
        };
        let ct = aes_gcm_encrypt(&self.enc_key, &iv_for(counter), &self.hash, plaintext)
            .expect("peer encrypt");
        self.mix(&ct);
        ct
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let counter = if self.finished {
            let c = self.read;
            self.read += 1;
            c
        } else {
            let c = self.counter;
            self.counter += 1;
            c
        };
        let pt = aes_gcm_decrypt(&self.dec_key, &iv_for(counter), &self.hash, ciphertext)
            .expect("peer decrypt");
        self.mix(ciphertext);
        pt
    }

    /// Mirrored final key split: the client's write key is our read key.
    fn finish(&mut self) {
        let okm = hkdf_expand(&[], Some(&self.salt), 64);
        self.dec_key.copy_from_slice(&okm[..32]);
        self.enc_key.copy_from_slice(&okm[32..]);
        self.hash.clear();
        self.write = 0;
        self.read = 0;
        self.finished = true;
    }
}

/// Scripted server over one half of a memory socket pair.
pub struct Peer {
    sink: Box<dyn SocketSink>,
    stream: Box<dyn SocketStream>,
    crypto: PeerCrypto,
    buffer: Vec<u8>,
    intro_seen: bool,
}

impl Peer {
    pub fn new(sink: Box<dyn SocketSink>, stream: Box<dyn SocketStream>) -> Self {
        Self {
            sink,
            stream,
            crypto: PeerCrypto::new(),
            buffer: Vec::new(),
            intro_seen: false,
        }
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if !self.intro_seen {
            if self.buffer.len() < CONN_HEADER.len() {
                return None;
            }
            assert_eq!(&self.buffer[..4], &CONN_HEADER, "client intro");
            self.buffer.drain(..4);
            self.intro_seen = true;
        }
        if self.buffer.len() < 3 {
            return None;
        }
        let len = (usize::from(self.buffer[0]) << 16)
            | (usize::from(self.buffer[1]) << 8)
            | usize::from(self.buffer[2]);
        if self.buffer.len() < 3 + len {
            return None;
        }
        self.buffer.drain(..3);
        Some(self.buffer.drain(..len).collect())
    }

    /// Next complete frame off the wire, raw.
    pub async fn recv_frame(&mut self) -> Vec<u8> {
        loop {
            if let Some(frame) = self.take_frame() {
                return frame;
            }
            let bytes = self
                .stream
                .recv()
                .await
                .expect("client hung up")
                .expect("peer recv");
            self.buffer.extend_from_slice(&bytes);
        }
    }

    /// Send one frame, encrypting once the handshake is done.
    pub async fn send_frame(&mut self, payload: &[u8]) {
        let data = if self.crypto.finished {
            self.crypto.encrypt(payload)
        } else {
            payload.to_vec()
        };
        let mut frame = vec![(data.len() >> 16) as u8, (data.len() >> 8) as u8, data.len() as u8];
        frame.extend_from_slice(&data);
        self.sink.send(frame).await.expect("peer send");
    }

    /// Run the server side of the handshake.
    ///
    /// Returns the decrypted client auth payload; afterwards the channel is
    /// fully encrypted and [`Peer::recv_node`]/[`Peer::send_node`] work.
    pub async fn accept(&mut self) -> Vec<u8> {
        let hello = self.recv_frame().await;
        let client_ephemeral = wire::decode_client_hello(&hello).expect("client hello");
        self.crypto.mix(&client_ephemeral);

        let ephemeral = KeyPair::generate();
        let static_kp = KeyPair::generate();
        self.crypto.mix(&ephemeral.public_bytes());
        self.crypto.mix_key(&ephemeral.dh(&client_ephemeral));
        let static_enc = self.crypto.encrypt(&static_kp.public_bytes());
        self.crypto.mix_key(&static_kp.dh(&client_ephemeral));

        let details = wire::encode_cert_details(&wire::CertDetails {
            serial: 7,
            issuer_serial: 0,
            key: static_kp.public_bytes().to_vec(),
            ..Default::default()
        });
        let payload = self.crypto.encrypt(&wire::encode_cert_chain(&details, &details));

        self.send_frame(&wire::encode_server_hello(&wire::ServerHello {
            ephemeral: ephemeral.public_bytes().to_vec(),
            static_enc,
            payload,
        }))
        .await;

        let finish = wire::decode_client_finish(&self.recv_frame().await).expect("client finish");
        let client_static: [u8; 32] = self
            .crypto
            .decrypt(&finish.static_enc)
            .as_slice()
            .try_into()
            .expect("client static key");
        self.crypto.mix_key(&ephemeral.dh(&client_static));
        let auth = self.crypto.decrypt(&finish.payload);
        self.crypto.finish();
        auth
    }

    pub async fn send_node(&mut self, node: &Node) {
        self.send_frame(&SimpleCodec.encode(node)).await;
    }

    pub async fn recv_node(&mut self) -> Node {
        let frame = self.recv_frame().await;
        let plaintext = self.crypto.decrypt(&frame);
        SimpleCodec.decode(&plaintext).expect("peer decode")
    }

    /// Reply `<iq type="result">` to a request, echoing its id.
    pub async fn reply_result(&mut self, request: &Node, children: Vec<Node>) {
        let id = request.id().expect("request id").to_string();
        let mut reply = Node::new("iq").attr("type", "result").attr("id", id);
        if !children.is_empty() {
            reply = reply.children(children);
        }
        self.send_node(&reply).await;
    }

    /// Serve iq requests until the client reaches `Open`: answer the
    /// pre-key upload (if any) and the active-mode toggle.
    pub async fn serve_until_open(&mut self) {
        self.send_node(&Node::new("success").attr("lid", "1234")).await;
        loop {
            let request = self.recv_node().await;
            let done = request
                .child("active")
                .is_some();
            self.reply_result(&request, Vec::new()).await;
            if done {
                return;
            }
        }
    }
}
