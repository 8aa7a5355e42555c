//! Encrypted frame codec.
//!
//! Every logical frame on the wire is a 24-bit big-endian length followed by
//! the payload: plaintext handshake bytes before the handshake finishes,
//! AEAD ciphertext afterwards. The very first outbound frame is preceded by
//! a one-time intro — the fixed magic+version header, or a multiplexing
//! header wrapping configured routing info.
//!
//! The decoder tolerates arbitrarily fragmented or batched input: bytes are
//! buffered and complete frames are sliced off strictly in arrival order,
//! which the AEAD counters and transcript hashing depend on.

use crate::config::{CONN_HEADER, EDGE_HEADER, FRAME_MAX_LEN};
use crate::core::node::{Node, NodeCodec};
use crate::error::{ClientError, Result};
use crate::protocol::handshake::HandshakeEngine;
use bytes::{Buf, BytesMut};
use tracing::trace;

const LEN_PREFIX: usize = 3;

fn push_len24(out: &mut Vec<u8>, len: usize) {
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
}

/// Stateful frame encoder/decoder for one connection.
pub struct FrameCodec {
    routing_info: Option<Vec<u8>>,
    sent_intro: bool,
    buffer: BytesMut,
}

impl FrameCodec {
    /// New codec; `routing_info` selects the multiplexing intro.
    pub fn new(routing_info: Option<Vec<u8>>) -> Self {
        Self {
            routing_info,
            sent_intro: false,
            buffer: BytesMut::new(),
        }
    }

    fn intro(&self) -> Vec<u8> {
        match &self.routing_info {
            Some(routing) => {
                let mut intro = Vec::with_capacity(EDGE_HEADER.len() + LEN_PREFIX + routing.len() + CONN_HEADER.len());
                intro.extend_from_slice(&EDGE_HEADER);
                push_len24(&mut intro, routing.len());
                intro.extend_from_slice(routing);
                intro.extend_from_slice(&CONN_HEADER);
                intro
            }
            None => CONN_HEADER.to_vec(),
        }
    }

    /// Encode one outbound frame, encrypting once the handshake is finished
    /// and prepending the intro exactly once per connection.
    pub fn encode_frame(&mut self, noise: &mut HandshakeEngine, payload: &[u8]) -> Result<Vec<u8>> {
        let data = if noise.is_finished() {
            noise.encrypt(payload)?
        } else {
            payload.to_vec()
        };

        if data.len() > FRAME_MAX_LEN {
            return Err(ClientError::FrameTooLarge(data.len()));
        }

        let mut frame = Vec::with_capacity(data.len() + LEN_PREFIX);
        if !self.sent_intro {
            frame.extend_from_slice(&self.intro());
            self.sent_intro = true;
        }
        push_len24(&mut frame, data.len());
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    fn pending_len(&self) -> Option<usize> {
        if self.buffer.len() < LEN_PREFIX {
            return None;
        }
        Some(
            (usize::from(self.buffer[0]) << 16)
                | (usize::from(self.buffer[1]) << 8)
                | usize::from(self.buffer[2]),
        )
    }

    /// Feed received bytes and invoke `on_frame` for every complete frame,
    /// in order. Once the handshake is finished the frame is decrypted and
    /// decoded to a [`Node`]; before that the raw handshake bytes are handed
    /// over undecoded.
    pub fn decode_frames<F>(
        &mut self,
        noise: &mut HandshakeEngine,
        codec: &dyn NodeCodec,
        bytes: &[u8],
        mut on_frame: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<u8>, Option<Node>),
    {
        self.buffer.extend_from_slice(bytes);
        trace!(
            received = bytes.len(),
            buffered = self.buffer.len(),
            "frame bytes received"
        );

        while let Some(size) = self.pending_len() {
            if self.buffer.len() < LEN_PREFIX + size {
                break;
            }
            self.buffer.advance(LEN_PREFIX);
            let frame = self.buffer.split_to(size).to_vec();

            let node = if noise.is_finished() {
                let plaintext = noise.decrypt(&frame)?;
                Some(codec.decode(&plaintext)?)
            } else {
                None
            };

            on_frame(frame, node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyPair;
    use crate::config::PROTOCOL_NAME;
    use crate::core::node::SimpleCodec;

    fn unfinished_noise() -> HandshakeEngine {
        HandshakeEngine::new(PROTOCOL_NAME, KeyPair::generate())
    }

    #[test]
    fn intro_sent_exactly_once() {
        let mut codec = FrameCodec::new(None);
        let mut noise = unfinished_noise();

        let first = codec.encode_frame(&mut noise, b"a").unwrap();
        let second = codec.encode_frame(&mut noise, b"b").unwrap();

        assert_eq!(&first[..4], &CONN_HEADER);
        assert_eq!(&first[4..7], &[0, 0, 1]);
        assert_eq!(&second[..3], &[0, 0, 1]);
    }

    #[test]
    fn routing_intro_wraps_payload() {
        let mut codec = FrameCodec::new(Some(vec![0xAA, 0xBB]));
        let mut noise = unfinished_noise();

        let frame = codec.encode_frame(&mut noise, b"x").unwrap();
        assert_eq!(&frame[..4], &EDGE_HEADER);
        assert_eq!(&frame[4..7], &[0, 0, 2]);
        assert_eq!(&frame[7..9], &[0xAA, 0xBB]);
        assert_eq!(&frame[9..13], &CONN_HEADER);
        assert_eq!(&frame[13..16], &[0, 0, 1]);
        assert_eq!(frame[16], b'x');
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut codec = FrameCodec::new(None);
        let mut noise = unfinished_noise();
        let huge = vec![0u8; FRAME_MAX_LEN + 1];
        assert!(matches!(
            codec.encode_frame(&mut noise, &huge),
            Err(ClientError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn reassembles_across_fragment_boundaries() {
        let mut enc = FrameCodec::new(None);
        let mut enc_noise = unfinished_noise();
        let mut dec = FrameCodec::new(None);
        let mut dec_noise = unfinished_noise();

        let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; usize::from(i) + 1]).collect();
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend(enc.encode_frame(&mut enc_noise, p).unwrap());
        }
        // sender intro is not part of the logical frame stream
        stream.drain(..CONN_HEADER.len());

        let mut recovered = Vec::new();
        for chunk in stream.chunks(1) {
            dec.decode_frames(&mut dec_noise, &SimpleCodec, chunk, |frame, node| {
                assert!(node.is_none());
                recovered.push(frame);
            })
            .unwrap();
        }
        assert_eq!(recovered, payloads);
    }

    #[test]
    fn batched_input_yields_all_frames() {
        let mut enc = FrameCodec::new(None);
        let mut enc_noise = unfinished_noise();
        let mut dec = FrameCodec::new(None);
        let mut dec_noise = unfinished_noise();

        let mut stream = Vec::new();
        for p in [&b"one"[..], b"two", b"three"] {
            stream.extend(enc.encode_frame(&mut enc_noise, p).unwrap());
        }
        stream.drain(..CONN_HEADER.len());

        let mut frames = Vec::new();
        dec.decode_frames(&mut dec_noise, &SimpleCodec, &stream, |frame, _| {
            frames.push(frame)
        })
        .unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn finished_frames_decrypt_and_decode() {
        let ephemeral = KeyPair::generate();
        let mut client_noise = HandshakeEngine::new(PROTOCOL_NAME, ephemeral.clone());
        let mut server_noise = HandshakeEngine::new(PROTOCOL_NAME, ephemeral);
        client_noise.finish();
        server_noise.finish();
        server_noise.swap_directions();

        let mut enc = FrameCodec::new(None);
        let mut dec = FrameCodec::new(None);

        let node = Node::new("iq").attr("id", "ab-1");
        let payload = SimpleCodec.encode(&node);
        let mut stream = enc.encode_frame(&mut client_noise, &payload).unwrap();
        stream.drain(..CONN_HEADER.len());

        let mut seen = Vec::new();
        dec.decode_frames(&mut server_noise, &SimpleCodec, &stream, |_, decoded| {
            seen.push(decoded.expect("finished frames decode to nodes"));
        })
        .unwrap();
        assert_eq!(seen, vec![node]);
    }

    #[test]
    fn corrupted_finished_frame_is_fatal() {
        let ephemeral = KeyPair::generate();
        let mut client_noise = HandshakeEngine::new(PROTOCOL_NAME, ephemeral.clone());
        let mut server_noise = HandshakeEngine::new(PROTOCOL_NAME, ephemeral);
        client_noise.finish();
        server_noise.finish();
        server_noise.swap_directions();

        let mut enc = FrameCodec::new(None);
        let mut dec = FrameCodec::new(None);

        let mut stream = enc
            .encode_frame(&mut client_noise, &SimpleCodec.encode(&Node::new("a")))
            .unwrap();
        stream.drain(..CONN_HEADER.len());
        let last = stream.len() - 1;
        stream[last] ^= 0x01;

        let result = dec.decode_frames(&mut server_noise, &SimpleCodec, &stream, |_, _| {});
        assert!(matches!(result, Err(ClientError::Crypto)));
    }
}
