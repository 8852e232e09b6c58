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

//! RFC 6455 WebSocket framing and endpoints (version 13, no extensions).

mod client;
mod codec;
mod server;

pub use client::{WebSocketClient, WsClientSender};
pub use codec::{
    accept_key, build_frame, nonce_key, parse_frame, FrameError, Incoming, WsDecoder,
};
pub use server::{WebSocketServer, WsRoute, WsSender};

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for a protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code for an invalid (non-UTF-8) text payload.
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
/// Close code for an oversized message.
pub const CLOSE_TOO_BIG: u16 = 1009;
/// Close code reported locally for an abnormal closure. Never sent in a frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Frame opcode (RFC 6455 §5.2).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Decodes the low four bits of the first frame byte. Unknown opcodes
    /// (including the reserved ranges) yield `None`.
    pub fn from_bits(bits: u8) -> Option<Opcode> {
        match bits & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Close, ping and pong frames follow the control-frame rules: payload of
    /// at most 125 bytes and no fragmentation.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A single decoded WebSocket frame.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct WsFrame {
    pub fin: bool,
    /// The three reserved bits; must be zero with no extension negotiated.
    pub rsv: u8,
    pub opcode: Opcode,
    pub masked: bool,
    /// Payload with the mask already removed.
    pub payload: Vec<u8>,
}

/// Lifecycle of a WebSocket connection on either endpoint.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum WsState {
    /// TCP established, handshake not yet complete.
    #[display("connecting")]
    Connecting,
    /// Handshake done; data frames flow.
    #[display("open")]
    Open,
    /// A close frame was sent, the echo is awaited.
    #[display("closing")]
    Closing,
    /// Close handshake finished or connection torn down.
    #[display("closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bits_roundtrip() {
        for opcode in [
            Opcode::Continuation,
            Opcode::Text,
            Opcode::Binary,
            Opcode::Close,
            Opcode::Ping,
            Opcode::Pong,
        ] {
            assert_eq!(Opcode::from_bits(opcode.bits()), Some(opcode));
        }
        assert_eq!(Opcode::from_bits(0x3), None);
        assert_eq!(Opcode::from_bits(0xB), None);
        // High bits of the byte are not part of the opcode
        assert_eq!(Opcode::from_bits(0x81), Some(Opcode::Text));
    }

    #[test]
    fn control_classification() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }
}
