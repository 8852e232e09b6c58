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

//! WebSocket server endpoint: upgrade handshake, per-connection state and
//! route-keyed callbacks.

use std::collections::BTreeMap;

use super::codec::{accept_key, build_frame, close_payload, Incoming, WsDecoder};
use super::{FrameError, Opcode, WsState, CLOSE_ABNORMAL};
use crate::http::{
    build_response, is_websocket_upgrade, Headers, HttpResponse, RequestCodec, UpgradeRequest,
};
use crate::reactor::PollableId;
use crate::system::{NetworkEvent, NetworkSystem};
use crate::timers::TimerId;

/// How long a proactive close waits for the peer's echo before the TCP
/// connection is torn down regardless.
const CLOSE_TIMEOUT_MS: u64 = 5000;

/// Callback set for one upgrade path.
///
/// Callbacks are registered per route and invoked for every connection that
/// upgraded on that path; the connection at hand is exposed through the
/// [`WsSender`] handle.
#[derive(Default)]
pub struct WsRoute {
    on_open: Option<Box<dyn FnMut(&mut WsSender)>>,
    on_message: Option<Box<dyn FnMut(&mut WsSender, &str)>>,
    on_binary: Option<Box<dyn FnMut(&mut WsSender, &[u8])>>,
    on_close: Option<Box<dyn FnMut(u16, &str)>>,
    on_error: Option<Box<dyn FnMut(&str)>>,
}

impl WsRoute {
    /// Invoked once the handshake response is written and the connection is
    /// open.
    pub fn on_open(&mut self, f: impl FnMut(&mut WsSender) + 'static) -> &mut Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Invoked per completed TEXT message (after unmasking and reassembly).
    pub fn on_message(&mut self, f: impl FnMut(&mut WsSender, &str) + 'static) -> &mut Self {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Invoked per completed BINARY message.
    pub fn on_binary(&mut self, f: impl FnMut(&mut WsSender, &[u8]) + 'static) -> &mut Self {
        self.on_binary = Some(Box::new(f));
        self
    }

    /// Invoked when the close handshake (or an abnormal closure) finishes.
    pub fn on_close(&mut self, f: impl FnMut(u16, &str) + 'static) -> &mut Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Invoked on protocol violations and socket errors.
    pub fn on_error(&mut self, f: impl FnMut(&str) + 'static) -> &mut Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

struct Conn {
    path: String,
    headers: Headers,
    state: WsState,
    http: RequestCodec,
    decoder: WsDecoder,
    close_timer: Option<TimerId>,
}

impl Conn {
    fn connecting() -> Self {
        Conn {
            path: String::new(),
            headers: Headers::new(),
            state: WsState::Connecting,
            http: RequestCodec::new(),
            decoder: WsDecoder::server(),
            close_timer: None,
        }
    }
}

/// Handle to one open server-side connection, passed into route callbacks.
pub struct WsSender<'a> {
    net: &'a mut NetworkSystem,
    socket: PollableId,
    conn: &'a mut Conn,
}

impl WsSender<'_> {
    /// Pollable id of the underlying socket.
    pub fn socket(&self) -> PollableId { self.socket }

    /// Path the connection upgraded on.
    pub fn path(&self) -> &str { &self.conn.path }

    /// Request headers captured at upgrade time.
    pub fn headers(&self) -> &Headers { &self.conn.headers }

    pub fn state(&self) -> WsState { self.conn.state }

    /// Queues an unmasked TEXT frame. Ignored unless the connection is open.
    pub fn send_text(&mut self, text: &str) {
        if self.conn.state == WsState::Open {
            self.net.send(self.socket, &build_frame(true, Opcode::Text, text.as_bytes(), None));
        }
    }

    /// Queues an unmasked BINARY frame. Ignored unless the connection is open.
    pub fn send_binary(&mut self, data: &[u8]) {
        if self.conn.state == WsState::Open {
            self.net.send(self.socket, &build_frame(true, Opcode::Binary, data, None));
        }
    }

    /// Starts the close handshake.
    ///
    /// Sends a close frame and waits for the peer's echo; if the echo does
    /// not arrive within the close timeout the connection is torn down by the
    /// server's next [`WebSocketServer::handle`] call.
    pub fn close(&mut self, code: u16, reason: &str) {
        if self.conn.state != WsState::Open {
            return;
        }
        self.net
            .send(self.socket, &build_frame(true, Opcode::Close, &close_payload(code, reason), None));
        self.conn.state = WsState::Closing;
        self.conn.close_timer = Some(self.net.create_timer(CLOSE_TIMEOUT_MS, false));
    }
}

/// RFC 6455 server endpoint over the network event stream.
///
/// Operates either standalone on a listener (parsing the upgrade requests
/// itself) or downstream of an [`crate::http::HttpServer`] via
/// [`WebSocketServer::adopt`]. Routes are keyed by the upgrade request path.
pub struct WebSocketServer {
    listener: PollableId,
    routes: BTreeMap<String, WsRoute>,
    conns: BTreeMap<PollableId, Conn>,
    ping_timer: Option<TimerId>,
}

impl WebSocketServer {
    /// Creates a server handling connections accepted by `listener`.
    pub fn attach(listener: PollableId) -> Self {
        WebSocketServer {
            listener,
            routes: empty!(),
            conns: empty!(),
            ping_timer: None,
        }
    }

    /// Arms a repeating keep-alive ping sent to every open connection.
    ///
    /// The interval is a level-triggered reactor timer checked on each
    /// [`WebSocketServer::handle`] call; answering pongs are absorbed by the
    /// frame decoder.
    pub fn enable_ping(&mut self, net: &mut NetworkSystem, interval_ms: u64) {
        if let Some(timer) = self.ping_timer.take() {
            net.destroy_timer(timer);
        }
        self.ping_timer = Some(net.create_timer(interval_ms, true));
    }

    /// Cancels the keep-alive ping.
    pub fn disable_ping(&mut self, net: &mut NetworkSystem) {
        if let Some(timer) = self.ping_timer.take() {
            net.destroy_timer(timer);
        }
    }

    /// Callback registration for the given upgrade path.
    pub fn route(&mut self, path: &str) -> &mut WsRoute {
        self.routes.entry(path.to_owned()).or_default()
    }

    pub fn connections(&self) -> usize { self.conns.len() }

    pub fn connection_state(&self, socket: PollableId) -> Option<WsState> {
        self.conns.get(&socket).map(|conn| conn.state)
    }

    /// Adopts a connection whose upgrade request was parsed by an HTTP
    /// server. Writes the 101 response and opens the connection.
    pub fn adopt(&mut self, net: &mut NetworkSystem, upgrade: UpgradeRequest) {
        let UpgradeRequest {
            socket,
            request,
            remainder,
        } = upgrade;
        let mut conn = Conn::connecting();
        self.open(net, socket, &mut conn, request.path, request.headers);
        conn.decoder.feed(&remainder);
        self.drain_frames(net, socket, conn);
    }

    /// Queues a TEXT message on an open connection.
    pub fn send_text(&mut self, net: &mut NetworkSystem, socket: PollableId, text: &str) -> bool {
        match self.conns.get_mut(&socket) {
            Some(conn) if conn.state == WsState::Open => {
                net.send(socket, &build_frame(true, Opcode::Text, text.as_bytes(), None));
                true
            }
            _ => false,
        }
    }

    /// Queues a BINARY message on an open connection.
    pub fn send_binary(
        &mut self,
        net: &mut NetworkSystem,
        socket: PollableId,
        data: &[u8],
    ) -> bool {
        match self.conns.get_mut(&socket) {
            Some(conn) if conn.state == WsState::Open => {
                net.send(socket, &build_frame(true, Opcode::Binary, data, None));
                true
            }
            _ => false,
        }
    }

    /// Starts the close handshake on an open connection.
    pub fn close(&mut self, net: &mut NetworkSystem, socket: PollableId, code: u16, reason: &str) {
        if let Some(conn) = self.conns.get_mut(&socket) {
            if conn.state != WsState::Open {
                return;
            }
            net.send(socket, &build_frame(true, Opcode::Close, &close_payload(code, reason), None));
            conn.state = WsState::Closing;
            conn.close_timer = Some(net.create_timer(CLOSE_TIMEOUT_MS, false));
        }
    }

    /// Dispatches one tick's events, sweeps expired close timers and sends
    /// due keep-alive pings.
    pub fn handle(&mut self, net: &mut NetworkSystem, events: &[NetworkEvent]) {
        self.sweep_close_timers(net);
        self.send_due_pings(net);

        for event in events {
            match *event {
                NetworkEvent::Accepted { listener, socket } if listener == self.listener => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "ws", "Connection {socket} accepted, awaiting handshake");
                    self.conns.insert(socket, Conn::connecting());
                }
                NetworkEvent::SocketData(socket) => {
                    if self.conns.contains_key(&socket) {
                        self.handle_data(net, socket);
                    }
                }
                NetworkEvent::SocketClosed(socket) => {
                    if let Some(conn) = self.conns.remove(&socket) {
                        if let Some(timer) = conn.close_timer {
                            net.destroy_timer(timer);
                        }
                        if conn.state != WsState::Closed {
                            self.notify_close(&conn.path, CLOSE_ABNORMAL, "");
                        }
                    }
                }
                NetworkEvent::SocketError(socket) => {
                    if let Some(conn) = self.conns.remove(&socket) {
                        if let Some(timer) = conn.close_timer {
                            net.destroy_timer(timer);
                        }
                        self.notify_error(&conn.path, "socket error");
                        if conn.state != WsState::Closed {
                            self.notify_close(&conn.path, CLOSE_ABNORMAL, "");
                        }
                    }
                }
                NetworkEvent::Accepted { .. } => {}
            }
        }
    }

    fn send_due_pings(&mut self, net: &mut NetworkSystem) {
        let Some(timer) = self.ping_timer else {
            return;
        };
        if !net.is_timer_expired(timer) {
            return;
        }
        net.reset_timer(timer);
        for (socket, conn) in &self.conns {
            if conn.state == WsState::Open {
                net.send(*socket, &build_frame(true, Opcode::Ping, &[], None));
            }
        }
    }

    /// Tears down connections whose proactive close was never echoed.
    fn sweep_close_timers(&mut self, net: &mut NetworkSystem) {
        let expired: Vec<PollableId> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                conn.state == WsState::Closing
                    && conn.close_timer.map(|t| net.is_timer_expired(t)).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for socket in expired {
            let conn = self.conns.remove(&socket).expect("id collected above");
            if let Some(timer) = conn.close_timer {
                net.destroy_timer(timer);
            }
            #[cfg(feature = "log")]
            log::debug!(target: "ws", "Close echo timed out on {socket}, dropping connection");
            net.remove(socket);
            self.notify_close(&conn.path, CLOSE_ABNORMAL, "close timeout");
        }
    }

    fn handle_data(&mut self, net: &mut NetworkSystem, socket: PollableId) {
        let bytes = net.read_to_vec(socket);
        let Some(mut conn) = self.conns.remove(&socket) else {
            return;
        };

        if conn.state == WsState::Connecting {
            conn.http.feed(&bytes);
            match conn.http.advance() {
                Ok(Some(request)) if is_websocket_upgrade(&request) => {
                    let remainder = conn.http.take_remainder();
                    self.open(net, socket, &mut conn, request.path, request.headers);
                    conn.decoder.feed(&remainder);
                }
                Ok(None) => {
                    self.conns.insert(socket, conn);
                    return;
                }
                // A parse failure or a plain HTTP request: this endpoint only
                // speaks WebSocket
                Ok(Some(_)) | Err(_) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "ws", "Rejecting non-upgrade request on {socket}");
                    let mut response = HttpResponse {
                        status_code: 400,
                        status_text: s!("Bad Request"),
                        ..HttpResponse::default()
                    };
                    response.headers.insert("Connection", "close");
                    net.send(socket, &build_response(&response));
                    net.close_when_drained(socket);
                    return;
                }
            }
        } else {
            conn.decoder.feed(&bytes);
        }

        self.drain_frames(net, socket, conn);
    }

    /// Writes the 101 response and flips the connection to open.
    fn open(
        &mut self,
        net: &mut NetworkSystem,
        socket: PollableId,
        conn: &mut Conn,
        path: String,
        headers: Headers,
    ) {
        let key = headers.get("Sec-WebSocket-Key").unwrap_or_default();
        let mut response = HttpResponse {
            status_code: 101,
            status_text: s!("Switching Protocols"),
            ..HttpResponse::default()
        };
        response.headers.insert("Upgrade", "websocket");
        response.headers.insert("Connection", "Upgrade");
        response.headers.insert("Sec-WebSocket-Accept", accept_key(key));
        net.send(socket, &build_response(&response));

        conn.path = path;
        conn.headers = headers;
        conn.state = WsState::Open;

        #[cfg(feature = "log")]
        log::debug!(target: "ws", "Connection {socket} open on {}", conn.path);

        if let Some(route) = self.routes.get_mut(&conn.path) {
            if let Some(on_open) = route.on_open.as_mut() {
                let mut sender = WsSender {
                    net,
                    socket,
                    conn,
                };
                on_open(&mut sender);
            }
        }
    }

    /// Decodes and dispatches buffered frames; re-registers the connection
    /// unless it finished.
    fn drain_frames(&mut self, net: &mut NetworkSystem, socket: PollableId, mut conn: Conn) {
        loop {
            match conn.decoder.next() {
                Ok(None) => break,
                Ok(Some(incoming)) => {
                    if !self.dispatch(net, socket, &mut conn, incoming) {
                        return;
                    }
                }
                Err(err) => {
                    self.protocol_error(net, socket, &mut conn, err);
                    return;
                }
            }
        }
        self.conns.insert(socket, conn);
    }

    /// Returns `false` once the connection finished and must not be
    /// re-registered.
    fn dispatch(
        &mut self,
        net: &mut NetworkSystem,
        socket: PollableId,
        conn: &mut Conn,
        incoming: Incoming,
    ) -> bool {
        match incoming {
            Incoming::Text(text) => {
                if conn.state == WsState::Open {
                    if let Some(route) = self.routes.get_mut(&conn.path) {
                        if let Some(on_message) = route.on_message.as_mut() {
                            let mut sender = WsSender {
                                net,
                                socket,
                                conn,
                            };
                            on_message(&mut sender, &text);
                        }
                    }
                }
                true
            }
            Incoming::Binary(data) => {
                if conn.state == WsState::Open {
                    if let Some(route) = self.routes.get_mut(&conn.path) {
                        if let Some(on_binary) = route.on_binary.as_mut() {
                            let mut sender = WsSender {
                                net,
                                socket,
                                conn,
                            };
                            on_binary(&mut sender, &data);
                        }
                    }
                }
                true
            }
            Incoming::Ping(payload) => {
                // A ping is answered with a pong carrying the same payload
                if conn.state != WsState::Closed {
                    net.send(socket, &build_frame(true, Opcode::Pong, &payload, None));
                }
                true
            }
            Incoming::Pong(_) => true,
            Incoming::Close(code, reason) => {
                match conn.state {
                    WsState::Closing => {
                        // The echo of our own close frame
                        if let Some(timer) = conn.close_timer.take() {
                            net.destroy_timer(timer);
                        }
                    }
                    _ => {
                        // Peer-initiated close: echo the status code
                        net.send(
                            socket,
                            &build_frame(true, Opcode::Close, &close_payload(code, ""), None),
                        );
                    }
                }
                conn.state = WsState::Closed;
                net.close_when_drained(socket);
                self.notify_close(&conn.path, code, &reason);
                false
            }
        }
    }

    fn protocol_error(
        &mut self,
        net: &mut NetworkSystem,
        socket: PollableId,
        conn: &mut Conn,
        err: FrameError,
    ) {
        #[cfg(feature = "log")]
        log::debug!(target: "ws", "Protocol error on {socket}: {err}");
        self.notify_error(&conn.path, &err.to_string());
        net.send(
            socket,
            &build_frame(true, Opcode::Close, &close_payload(err.close_code(), ""), None),
        );
        if let Some(timer) = conn.close_timer.take() {
            net.destroy_timer(timer);
        }
        conn.state = WsState::Closed;
        net.close_when_drained(socket);
        self.notify_close(&conn.path, err.close_code(), "");
    }

    fn notify_close(&mut self, path: &str, code: u16, reason: &str) {
        if let Some(route) = self.routes.get_mut(path) {
            if let Some(on_close) = route.on_close.as_mut() {
                on_close(code, reason);
            }
        }
    }

    fn notify_error(&mut self, path: &str, message: &str) {
        if let Some(route) = self.routes.get_mut(path) {
            if let Some(on_error) = route.on_error.as_mut() {
                on_error(message);
            }
        }
    }
}
