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

//! WebSocket client endpoint: handshake initiation, masked frames and the
//! close handshake from the connecting side.

use std::io;

use super::codec::{
    accept_key, build_frame, close_payload, mask_key, nonce_key, Incoming, WsDecoder,
};
use super::{Opcode, WsState, CLOSE_ABNORMAL};
use crate::http::{build_request, HttpRequest, ResponseCodec};
use crate::reactor::PollableId;
use crate::system::{Error, NetworkEvent, NetworkSystem};
use crate::timers::TimerId;

/// How long a proactive close waits for the server's echo.
const CLOSE_TIMEOUT_MS: u64 = 5000;

/// Handle passed into client callbacks for replying on the connection.
///
/// All frames sent through it are masked, as required for the
/// client-to-server direction.
pub struct WsClientSender<'a> {
    net: &'a mut NetworkSystem,
    socket: PollableId,
    state: &'a mut WsState,
    close_timer: &'a mut Option<TimerId>,
}

impl WsClientSender<'_> {
    pub fn state(&self) -> WsState { *self.state }

    /// Queues a masked TEXT frame. Ignored unless the connection is open.
    pub fn send_text(&mut self, text: &str) {
        if *self.state == WsState::Open {
            self.net.send(
                self.socket,
                &build_frame(true, Opcode::Text, text.as_bytes(), Some(mask_key())),
            );
        }
    }

    /// Queues a masked BINARY frame. Ignored unless the connection is open.
    pub fn send_binary(&mut self, data: &[u8]) {
        if *self.state == WsState::Open {
            self.net
                .send(self.socket, &build_frame(true, Opcode::Binary, data, Some(mask_key())));
        }
    }

    /// Starts the close handshake; the server is expected to echo.
    pub fn close(&mut self, code: u16, reason: &str) {
        if *self.state != WsState::Open {
            return;
        }
        self.net.send(
            self.socket,
            &build_frame(true, Opcode::Close, &close_payload(code, reason), Some(mask_key())),
        );
        *self.state = WsState::Closing;
        *self.close_timer = Some(self.net.create_timer(CLOSE_TIMEOUT_MS, false));
    }
}

/// RFC 6455 client endpoint over the network event stream.
///
/// Drives one connection: `ws://` URL parsing, the upgrade request with a
/// random nonce key, 101-response validation, masked data frames and the
/// close handshake with a timer fallback.
#[derive(Default)]
pub struct WebSocketClient {
    socket: Option<PollableId>,
    state: Option<WsState>,
    key: String,
    http: ResponseCodec,
    decoder: WsDecoder,
    close_timer: Option<TimerId>,
    on_open: Option<Box<dyn FnMut(&mut WsClientSender)>>,
    on_message: Option<Box<dyn FnMut(&mut WsClientSender, &str)>>,
    on_binary: Option<Box<dyn FnMut(&mut WsClientSender, &[u8])>>,
    on_close: Option<Box<dyn FnMut(u16, &str)>>,
    on_error: Option<Box<dyn FnMut(&str)>>,
}

impl WebSocketClient {
    pub fn new() -> Self { WebSocketClient::default() }

    pub fn on_open(&mut self, f: impl FnMut(&mut WsClientSender) + 'static) -> &mut Self {
        self.on_open = Some(Box::new(f));
        self
    }

    pub fn on_message(&mut self, f: impl FnMut(&mut WsClientSender, &str) + 'static) -> &mut Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_binary(&mut self, f: impl FnMut(&mut WsClientSender, &[u8]) + 'static) -> &mut Self {
        self.on_binary = Some(Box::new(f));
        self
    }

    pub fn on_close(&mut self, f: impl FnMut(u16, &str) + 'static) -> &mut Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn on_error(&mut self, f: impl FnMut(&str) + 'static) -> &mut Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> WsState { self.state.unwrap_or(WsState::Closed) }

    pub fn socket(&self) -> Option<PollableId> { self.socket }

    /// Opens the TCP connection and sends the upgrade request.
    ///
    /// Only `ws://` URLs are accepted — the wire is plain TCP.
    pub fn connect(&mut self, net: &mut NetworkSystem, url: &str) -> Result<(), Error> {
        let (host, port, path) = parse_ws_url(url).map_err(|err| Error::Connect {
            host: url.to_owned(),
            port: 0,
            err,
        })?;
        let socket = net.create_socket(&host, port)?;

        self.key = nonce_key();
        let mut request = HttpRequest {
            url: url.to_owned(),
            path,
            ..HttpRequest::default()
        };
        request.headers.insert("Upgrade", "websocket");
        request.headers.insert("Connection", "Upgrade");
        request.headers.insert("Sec-WebSocket-Key", self.key.clone());
        request.headers.insert("Sec-WebSocket-Version", "13");
        net.send(socket, &build_request(&request, &host, port));

        #[cfg(feature = "log")]
        log::debug!(target: "ws", "Handshake sent to {url} on socket {socket}");

        self.socket = Some(socket);
        self.state = Some(WsState::Connecting);
        self.http = ResponseCodec::new();
        self.decoder = WsDecoder::client();
        Ok(())
    }

    /// Queues a masked TEXT message on the open connection.
    pub fn send_text(&mut self, net: &mut NetworkSystem, text: &str) -> bool {
        match (self.socket, self.state()) {
            (Some(socket), WsState::Open) => {
                net.send(socket, &build_frame(true, Opcode::Text, text.as_bytes(), Some(mask_key())));
                true
            }
            _ => false,
        }
    }

    /// Queues a masked BINARY message on the open connection.
    pub fn send_binary(&mut self, net: &mut NetworkSystem, data: &[u8]) -> bool {
        match (self.socket, self.state()) {
            (Some(socket), WsState::Open) => {
                net.send(socket, &build_frame(true, Opcode::Binary, data, Some(mask_key())));
                true
            }
            _ => false,
        }
    }

    /// Starts the close handshake and arms the echo-timeout timer.
    pub fn close(&mut self, net: &mut NetworkSystem, code: u16, reason: &str) {
        let (Some(socket), WsState::Open) = (self.socket, self.state()) else {
            return;
        };
        net.send(
            socket,
            &build_frame(true, Opcode::Close, &close_payload(code, reason), Some(mask_key())),
        );
        self.state = Some(WsState::Closing);
        self.close_timer = Some(net.create_timer(CLOSE_TIMEOUT_MS, false));
    }

    /// Processes one tick's events and the close-timeout flag.
    pub fn handle(&mut self, net: &mut NetworkSystem, events: &[NetworkEvent]) {
        let Some(socket) = self.socket else {
            return;
        };

        if self.state() == WsState::Closing {
            if let Some(timer) = self.close_timer {
                if net.is_timer_expired(timer) {
                    #[cfg(feature = "log")]
                    log::debug!(target: "ws", "Close echo timed out on {socket}");
                    net.destroy_timer(timer);
                    self.close_timer = None;
                    net.remove(socket);
                    self.finish(CLOSE_ABNORMAL, "close timeout");
                    return;
                }
            }
        }

        for event in events {
            if event.socket() != socket {
                continue;
            }
            match event {
                NetworkEvent::SocketData(_) => {
                    let bytes = net.read_to_vec(socket);
                    if self.state() == WsState::Connecting {
                        self.handle_handshake(net, socket, &bytes);
                    } else {
                        self.decoder.feed(&bytes);
                        self.drain_frames(net, socket);
                    }
                }
                NetworkEvent::SocketClosed(_) => {
                    if let Some(timer) = self.close_timer.take() {
                        net.destroy_timer(timer);
                    }
                    if self.state() != WsState::Closed {
                        self.finish(CLOSE_ABNORMAL, "");
                    }
                }
                NetworkEvent::SocketError(_) => {
                    if let Some(timer) = self.close_timer.take() {
                        net.destroy_timer(timer);
                    }
                    self.notify_error("socket error");
                    if self.state() != WsState::Closed {
                        self.finish(CLOSE_ABNORMAL, "");
                    }
                }
                NetworkEvent::Accepted { .. } => {}
            }
        }
    }

    fn handle_handshake(&mut self, net: &mut NetworkSystem, socket: PollableId, bytes: &[u8]) {
        self.http.feed(bytes);
        let response = match self.http.advance() {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(err) => {
                self.abort(net, socket, &format!("malformed handshake response: {err}"));
                return;
            }
        };

        let valid = response.status_code == 101
            && response.headers.contains_token("Upgrade", "websocket")
            && response.headers.contains_token("Connection", "upgrade")
            && response.headers.get("Sec-WebSocket-Accept").map(str::trim)
                == Some(accept_key(&self.key).as_str());
        if !valid {
            self.abort(net, socket, &format!(
                "handshake rejected with status {}",
                response.status_code
            ));
            return;
        }

        #[cfg(feature = "log")]
        log::debug!(target: "ws", "Connection {socket} open");

        self.state = Some(WsState::Open);
        if let Some(on_open) = self.on_open.as_mut() {
            let mut sender = WsClientSender {
                net,
                socket,
                state: self.state.as_mut().expect("state set above"),
                close_timer: &mut self.close_timer,
            };
            on_open(&mut sender);
        }

        // Frames may have followed the 101 response in the same read
        let remainder = self.http.take_remainder();
        self.decoder.feed(&remainder);
        self.drain_frames(net, socket);
    }

    fn drain_frames(&mut self, net: &mut NetworkSystem, socket: PollableId) {
        loop {
            match self.decoder.next() {
                Ok(None) => return,
                Ok(Some(incoming)) => {
                    if !self.dispatch(net, socket, incoming) {
                        return;
                    }
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "ws", "Protocol error on {socket}: {err}");
                    self.notify_error(&err.to_string());
                    net.send(
                        socket,
                        &build_frame(
                            true,
                            Opcode::Close,
                            &close_payload(err.close_code(), ""),
                            Some(mask_key()),
                        ),
                    );
                    net.close_when_drained(socket);
                    if let Some(timer) = self.close_timer.take() {
                        net.destroy_timer(timer);
                    }
                    self.finish(err.close_code(), "");
                    return;
                }
            }
        }
    }

    /// Returns `false` once the connection reached its end state.
    fn dispatch(&mut self, net: &mut NetworkSystem, socket: PollableId, incoming: Incoming) -> bool {
        match incoming {
            Incoming::Text(text) => {
                if self.state() == WsState::Open {
                    if let Some(on_message) = self.on_message.as_mut() {
                        let mut sender = WsClientSender {
                            net,
                            socket,
                            state: self.state.as_mut().expect("connection open"),
                            close_timer: &mut self.close_timer,
                        };
                        on_message(&mut sender, &text);
                    }
                }
                true
            }
            Incoming::Binary(data) => {
                if self.state() == WsState::Open {
                    if let Some(on_binary) = self.on_binary.as_mut() {
                        let mut sender = WsClientSender {
                            net,
                            socket,
                            state: self.state.as_mut().expect("connection open"),
                            close_timer: &mut self.close_timer,
                        };
                        on_binary(&mut sender, &data);
                    }
                }
                true
            }
            Incoming::Ping(payload) => {
                if self.state() != WsState::Closed {
                    net.send(socket, &build_frame(true, Opcode::Pong, &payload, Some(mask_key())));
                }
                true
            }
            Incoming::Pong(_) => true,
            Incoming::Close(code, reason) => {
                match self.state() {
                    WsState::Closing => {
                        // Echo of our own close frame
                        if let Some(timer) = self.close_timer.take() {
                            net.destroy_timer(timer);
                        }
                    }
                    _ => {
                        net.send(
                            socket,
                            &build_frame(
                                true,
                                Opcode::Close,
                                &close_payload(code, ""),
                                Some(mask_key()),
                            ),
                        );
                    }
                }
                net.close_when_drained(socket);
                self.finish(code, &reason);
                false
            }
        }
    }

    /// Final state transition with the close callback.
    fn finish(&mut self, code: u16, reason: &str) {
        self.state = Some(WsState::Closed);
        if let Some(on_close) = self.on_close.as_mut() {
            on_close(code, reason);
        }
    }

    fn abort(&mut self, net: &mut NetworkSystem, socket: PollableId, message: &str) {
        #[cfg(feature = "log")]
        log::debug!(target: "ws", "Connection {socket} aborted: {message}");
        net.remove(socket);
        self.notify_error(message);
        self.state = Some(WsState::Closed);
    }

    fn notify_error(&mut self, message: &str) {
        if let Some(on_error) = self.on_error.as_mut() {
            on_error(message);
        }
    }
}

/// Splits `ws://host[:port][/path]` into host, port and path.
fn parse_ws_url(url: &str) -> io::Result<(String, u16, String)> {
    let rest = url.strip_prefix("ws://").ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "only ws:// URLs are supported")
    })?;
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], rest[pos..].to_owned()),
        None => (rest, s!("/")),
    };
    if authority.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host"));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;
            Ok((host.to_owned(), port, path))
        }
        None => Ok((authority.to_owned(), 80, path)),
    }
}
