// Library for concurrent I/O resource management using reactor pattern.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! RFC 6455 frame parsing and building, message assembly across fragments,
//! and the handshake key computation.
//!
//! The parser is incremental: with insufficient bytes it reports "need more"
//! and leaves the buffer intact. The SHA-1 and base64 routines exist solely
//! for the handshake accept key and are validated against the RFC test
//! vectors.

use super::{Opcode, WsFrame, CLOSE_NORMAL};

/// GUID appended to the client key in the handshake (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound for a single frame payload.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound for an assembled multi-fragment message.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Protocol violation detected while decoding frames.
///
/// The owning endpoint answers with a close frame carrying
/// [`FrameError::close_code`] and tears the connection down.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum FrameError {
    /// reserved frame bits are set but no extension was negotiated
    ReservedBits,

    /// unknown frame opcode {0:#x}
    Opcode(u8),

    /// fragmented control frame
    FragmentedControl,

    /// control frame payload exceeds 125 bytes
    OversizedControl,

    /// client-to-server frame is not masked
    UnmaskedFrame,

    /// server-to-client frame is masked
    MaskedFrame,

    /// continuation frame without a message in progress
    StrayContinuation,

    /// data frame interleaved into a fragmented message
    InterleavedData,

    /// frame or message exceeds the size limit
    TooBig,

    /// text message is not valid UTF-8
    Utf8,
}

impl FrameError {
    /// Close code to send when reporting this violation to the peer.
    pub fn close_code(self) -> u16 {
        match self {
            FrameError::TooBig => super::CLOSE_TOO_BIG,
            FrameError::Utf8 => super::CLOSE_INVALID_PAYLOAD,
            _ => super::CLOSE_PROTOCOL_ERROR,
        }
    }
}

/// Decodes one frame from the head of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame. Masked payloads come out
/// unmasked.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(WsFrame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let rsv = (buf[0] >> 4) & 0x07;
    if rsv != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = Opcode::from_bits(buf[0]).ok_or(FrameError::Opcode(buf[0] & 0x0F))?;

    let masked = buf[1] & 0x80 != 0;
    let len7 = buf[1] & 0x7F;

    let mut offset = 2usize;
    let payload_len = match len7 {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            let len = u64::from_be_bytes(bytes);
            offset += 8;
            if len > MAX_FRAME_SIZE as u64 {
                return Err(FrameError::TooBig);
            }
            len as usize
        }
        n => n as usize,
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if payload_len > 125 {
            return Err(FrameError::OversizedControl);
        }
    }
    if payload_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooBig);
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return Ok(None);
    }
    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        WsFrame {
            fin,
            rsv,
            opcode,
            masked,
            payload,
        },
        offset + payload_len,
    )))
}

/// XORs the payload with the mask key. Applying twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Serializes one frame.
///
/// `mask` must be `Some` for client-to-server frames and `None` for
/// server-to-client frames (RFC 6455 §5.1); extended payload lengths follow
/// the 126/127 thresholds.
pub fn build_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);

    let mut first = opcode.bits();
    if fin {
        first |= 0x80;
    }
    frame.push(first);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        frame.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            let start = frame.len();
            frame.extend_from_slice(payload);
            apply_mask(&mut frame[start..], key);
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

/// Builds the two-byte status code plus reason payload of a close frame.
pub(crate) fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload.truncate(125);
    payload
}

/// A complete incoming item produced by the decoder: either an assembled
/// message or a control frame, which may interleave with fragments.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16, String),
}

/// Incremental frame decoder with fragmented-message assembly.
///
/// The server flavor requires every incoming frame to be masked, the client
/// flavor rejects masked frames — violating either direction rule is a
/// protocol error per RFC 6455 §5.1.
#[derive(Debug, Default)]
pub struct WsDecoder {
    buf: Vec<u8>,
    require_masked: bool,
    forbid_masked: bool,
    fragment_opcode: Option<Opcode>,
    fragments: Vec<u8>,
}

impl WsDecoder {
    /// Decoder for a server endpoint (client-to-server frames are masked).
    pub fn server() -> Self {
        WsDecoder {
            require_masked: true,
            ..WsDecoder::default()
        }
    }

    /// Decoder for a client endpoint (server-to-client frames are unmasked).
    pub fn client() -> Self {
        WsDecoder {
            forbid_masked: true,
            ..WsDecoder::default()
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }

    /// Decodes the next complete item, or `None` when more bytes are needed.
    ///
    /// A fragmented message is delivered once, assembled in order, when its
    /// final frame arrives; control frames pass through between fragments.
    pub fn next(&mut self) -> Result<Option<Incoming>, FrameError> {
        loop {
            let (frame, consumed) = match parse_frame(&self.buf)? {
                None => return Ok(None),
                Some(parsed) => parsed,
            };
            if self.require_masked && !frame.masked {
                return Err(FrameError::UnmaskedFrame);
            }
            if self.forbid_masked && frame.masked {
                return Err(FrameError::MaskedFrame);
            }
            self.buf.drain(..consumed);

            if frame.opcode.is_control() {
                return Ok(Some(match frame.opcode {
                    Opcode::Close => {
                        let (code, reason) = parse_close_payload(&frame.payload);
                        Incoming::Close(code, reason)
                    }
                    Opcode::Ping => Incoming::Ping(frame.payload),
                    Opcode::Pong => Incoming::Pong(frame.payload),
                    _ => unreachable!("only close, ping and pong are control opcodes"),
                }));
            }

            match frame.opcode {
                Opcode::Continuation => {
                    if self.fragment_opcode.is_none() {
                        return Err(FrameError::StrayContinuation);
                    }
                    if self.fragments.len() + frame.payload.len() > MAX_MESSAGE_SIZE {
                        return Err(FrameError::TooBig);
                    }
                    self.fragments.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let opcode = self.fragment_opcode.take().expect("fragment in progress");
                        let payload = std::mem::take(&mut self.fragments);
                        return Ok(Some(assemble(opcode, payload)?));
                    }
                }
                Opcode::Text | Opcode::Binary => {
                    if self.fragment_opcode.is_some() {
                        return Err(FrameError::InterleavedData);
                    }
                    if frame.fin {
                        return Ok(Some(assemble(frame.opcode, frame.payload)?));
                    }
                    self.fragment_opcode = Some(frame.opcode);
                    self.fragments = frame.payload;
                }
                _ => unreachable!("control frames are handled above"),
            }
        }
    }
}

fn assemble(opcode: Opcode, payload: Vec<u8>) -> Result<Incoming, FrameError> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Incoming::Text)
            .map_err(|_| FrameError::Utf8),
        Opcode::Binary => Ok(Incoming::Binary(payload)),
        _ => unreachable!("only data opcodes are assembled"),
    }
}

/// Splits a close payload into status code and reason.
///
/// An empty (or single-byte) payload defaults to a normal closure with no
/// reason.
fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (CLOSE_NORMAL, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WS_GUID);
    base64_encode(&sha1(input.as_bytes()))
}

/// Generates a random 16-byte nonce, base64-encoded, for the client
/// handshake.
pub fn nonce_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64_encode(&nonce)
}

/// Fresh mask key for one client-to-server frame.
pub(crate) fn mask_key() -> [u8; 4] { rand::random() }

// SHA-1 (RFC 3174), used only for the handshake accept key.
fn sha1(data: &[u8]) -> [u8; 20] {
    let mut state: [u32; 5] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476, 0xC3D2_E1F0];

    let mut msg = data.to_vec();
    let bit_len = (data.len() as u64) * 8;
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0);
    }
    msg.extend_from_slice(&bit_len.to_be_bytes());

    for block in msg.chunks_exact(64) {
        let mut w = [0u32; 80];
        for (i, word) in w.iter_mut().take(16).enumerate() {
            *word = u32::from_be_bytes([
                block[i * 4],
                block[i * 4 + 1],
                block[i * 4 + 2],
                block[i * 4 + 3],
            ]);
        }
        for i in 16..80 {
            w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
        }

        let [mut a, mut b, mut c, mut d, mut e] = state;
        for (i, word) in w.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | (!b & d), 0x5A82_7999u32),
                20..=39 => (b ^ c ^ d, 0x6ED9_EBA1),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC),
                _ => (b ^ c ^ d, 0xCA62_C1D6),
            };
            let temp = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(*word);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = temp;
        }

        state[0] = state[0].wrapping_add(a);
        state[1] = state[1].wrapping_add(b);
        state[2] = state[2].wrapping_add(c);
        state[3] = state[3].wrapping_add(d);
        state[4] = state[4].wrapping_add(e);
    }

    let mut digest = [0u8; 20];
    for (i, word) in state.iter().enumerate() {
        digest[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    digest
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

// Base64 (RFC 4648), used only for the handshake keys.
fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(BASE64_ALPHABET[(triple >> 18 & 0x3F) as usize] as char);
        out.push(BASE64_ALPHABET[(triple >> 12 & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6 & 0x3F) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[(triple & 0x3F) as usize] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_rfc3174_vectors() {
        assert_eq!(sha1(b"abc"), [
            0xA9, 0x99, 0x3E, 0x36, 0x47, 0x06, 0x81, 0x6A, 0xBA, 0x3E, 0x25, 0x71, 0x78, 0x50,
            0xC2, 0x6C, 0x9C, 0xD0, 0xD8, 0x9D
        ]);
        assert_eq!(sha1(b""), [
            0xDA, 0x39, 0xA3, 0xEE, 0x5E, 0x6B, 0x4B, 0x0D, 0x32, 0x55, 0xBF, 0xEF, 0x95, 0x60,
            0x18, 0x90, 0xAF, 0xD8, 0x07, 0x09
        ]);
    }

    #[test]
    fn base64_rfc4648_vectors() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn accept_key_rfc6455_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn nonce_is_22_chars_plus_padding() {
        let key = nonce_key();
        assert_eq!(key.len(), 24);
        assert!(key.ends_with("=="));
        assert_ne!(nonce_key(), key);
    }

    #[test]
    fn frame_roundtrip_unmasked() {
        let wire = build_frame(true, Opcode::Text, b"ping", None);
        assert_eq!(wire, b"\x81\x04ping");
        let (frame, consumed) = parse_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(!frame.masked);
        assert_eq!(frame.payload, b"ping");
    }

    #[test]
    fn frame_roundtrip_masked() {
        let key = mask_key();
        let wire = build_frame(true, Opcode::Binary, b"payload bytes", Some(key));
        // Masked payload differs from the clear text on the wire
        assert_ne!(&wire[6..], b"payload bytes");
        let (frame, consumed) = parse_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert!(frame.masked);
        assert_eq!(frame.payload, b"payload bytes");
    }

    #[test]
    fn extended_lengths() {
        let medium = vec![0x5Au8; 300];
        let wire = build_frame(true, Opcode::Binary, &medium, None);
        assert_eq!(wire[1], 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 300);
        let (frame, _) = parse_frame(&wire).unwrap().unwrap();
        assert_eq!(frame.payload, medium);

        let large = vec![0xA5u8; 70_000];
        let wire = build_frame(true, Opcode::Binary, &large, None);
        assert_eq!(wire[1], 127);
        let (frame, consumed) = parse_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn incomplete_frames_need_more() {
        let wire = build_frame(true, Opcode::Text, b"hello", None);
        for cut in 0..wire.len() {
            assert!(parse_frame(&wire[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn protocol_violations() {
        // Reserved bit set
        assert_eq!(parse_frame(b"\xC1\x00"), Err(FrameError::ReservedBits));
        // Unknown opcode 0x3
        assert_eq!(parse_frame(b"\x83\x00"), Err(FrameError::Opcode(0x3)));
        // Fragmented ping
        assert_eq!(parse_frame(b"\x09\x00"), Err(FrameError::FragmentedControl));
        // Oversized close
        let mut oversized = build_frame(true, Opcode::Binary, &vec![0; 126], None);
        oversized[0] = 0x88;
        assert_eq!(parse_frame(&oversized), Err(FrameError::OversizedControl));
    }

    #[test]
    fn server_decoder_enforces_masking() {
        let mut decoder = WsDecoder::server();
        decoder.feed(&build_frame(true, Opcode::Text, b"x", None));
        assert_eq!(decoder.next(), Err(FrameError::UnmaskedFrame));

        let mut decoder = WsDecoder::server();
        decoder.feed(&build_frame(true, Opcode::Text, b"x", Some(mask_key())));
        assert_eq!(decoder.next(), Ok(Some(Incoming::Text(s!("x")))));
    }

    #[test]
    fn client_decoder_rejects_masked() {
        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(true, Opcode::Text, b"x", Some(mask_key())));
        assert_eq!(decoder.next(), Err(FrameError::MaskedFrame));
    }

    #[test]
    fn fragmented_text_is_assembled_in_order() {
        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(false, Opcode::Text, b"Hel", None));
        decoder.feed(&build_frame(false, Opcode::Continuation, b"lo ", None));
        assert_eq!(decoder.next(), Ok(None));
        decoder.feed(&build_frame(true, Opcode::Continuation, b"World", None));
        assert_eq!(decoder.next(), Ok(Some(Incoming::Text(s!("Hello World")))));
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(false, Opcode::Text, b"frag", None));
        decoder.feed(&build_frame(true, Opcode::Ping, b"alive?", None));
        decoder.feed(&build_frame(true, Opcode::Continuation, b"ment", None));

        assert_eq!(decoder.next(), Ok(Some(Incoming::Ping(b"alive?".to_vec()))));
        assert_eq!(decoder.next(), Ok(Some(Incoming::Text(s!("fragment")))));
    }

    #[test]
    fn fragmentation_misuse_is_rejected() {
        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(true, Opcode::Continuation, b"?", None));
        assert_eq!(decoder.next(), Err(FrameError::StrayContinuation));

        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(false, Opcode::Text, b"a", None));
        decoder.feed(&build_frame(true, Opcode::Text, b"b", None));
        assert_eq!(decoder.next(), Err(FrameError::InterleavedData));
    }

    #[test]
    fn close_payload_roundtrip() {
        let payload = close_payload(1000, "bye");
        let wire = build_frame(true, Opcode::Close, &payload, None);
        let mut decoder = WsDecoder::client();
        decoder.feed(&wire);
        assert_eq!(decoder.next(), Ok(Some(Incoming::Close(1000, s!("bye")))));

        // Empty close payload defaults to a normal closure
        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(true, Opcode::Close, b"", None));
        assert_eq!(decoder.next(), Ok(Some(Incoming::Close(1000, s!("")))));
    }

    #[test]
    fn invalid_utf8_text_is_a_protocol_error() {
        let mut decoder = WsDecoder::client();
        decoder.feed(&build_frame(true, Opcode::Text, &[0xFF, 0xFE], None));
        assert_eq!(decoder.next(), Err(FrameError::Utf8));
        assert_eq!(FrameError::Utf8.close_code(), 1007);
        assert_eq!(FrameError::TooBig.close_code(), 1009);
        assert_eq!(FrameError::ReservedBits.close_code(), 1002);
    }
}
