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

//! HTTP/1.1 server: route dispatch over the network event stream.

use std::collections::BTreeMap;

use super::codec::{build_response, is_websocket_upgrade, RequestCodec};
use super::{HttpRequest, HttpResponse, Method};
use crate::reactor::PollableId;
use crate::system::{NetworkEvent, NetworkSystem};

/// Handler invoked once per completed request on a matching route.
pub type RouteHandler = Box<dyn FnMut(&HttpRequest, &mut HttpResponse)>;

/// A WebSocket upgrade request detected on an HTTP connection.
///
/// The server does not answer these; ownership of the connection transfers
/// to whatever WebSocket endpoint the application feeds them to.
#[derive(Debug)]
pub struct UpgradeRequest {
    pub socket: PollableId,
    pub request: HttpRequest,
    /// Bytes which arrived after the upgrade request — already frame data.
    pub remainder: Vec<u8>,
}

const NOT_FOUND_BODY: &str =
    "<h1>404 Not Found</h1><p>The requested resource was not found on this server.</p>";

/// Route-dispatching HTTP/1.1 server bound to one listener.
///
/// Routes are keyed by `<METHOD>:<path>`. Requests without a matching route
/// receive a default 404 page. Connections are kept alive unless either side
/// carries `Connection: close`.
pub struct HttpServer {
    listener: PollableId,
    routes: BTreeMap<String, RouteHandler>,
    conns: BTreeMap<PollableId, RequestCodec>,
}

impl HttpServer {
    /// Creates a server dispatching connections accepted by `listener`.
    pub fn attach(listener: PollableId) -> Self {
        HttpServer {
            listener,
            routes: empty!(),
            conns: empty!(),
        }
    }

    pub fn listener(&self) -> PollableId { self.listener }

    /// Registers a handler for `method` on `path`.
    pub fn route(
        &mut self,
        method: Method,
        path: &str,
        handler: impl FnMut(&HttpRequest, &mut HttpResponse) + 'static,
    ) {
        self.routes.insert(format!("{method}:{path}"), Box::new(handler));
    }

    pub fn get(&mut self, path: &str, handler: impl FnMut(&HttpRequest, &mut HttpResponse) + 'static) {
        self.route(Method::Get, path, handler)
    }

    pub fn post(
        &mut self,
        path: &str,
        handler: impl FnMut(&HttpRequest, &mut HttpResponse) + 'static,
    ) {
        self.route(Method::Post, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl FnMut(&HttpRequest, &mut HttpResponse) + 'static) {
        self.route(Method::Put, path, handler)
    }

    pub fn delete(
        &mut self,
        path: &str,
        handler: impl FnMut(&HttpRequest, &mut HttpResponse) + 'static,
    ) {
        self.route(Method::Delete, path, handler)
    }

    /// Number of connections currently tracked.
    pub fn connections(&self) -> usize { self.conns.len() }

    /// Dispatches one tick's events.
    ///
    /// Returns detected WebSocket upgrade requests; for those connections no
    /// response has been written and the server forgets the socket.
    pub fn handle(
        &mut self,
        net: &mut NetworkSystem,
        events: &[NetworkEvent],
    ) -> Vec<UpgradeRequest> {
        let mut upgrades = vec![];
        for event in events {
            match *event {
                NetworkEvent::Accepted { listener, socket } if listener == self.listener => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "http", "Connection {socket} accepted");
                    self.conns.insert(socket, RequestCodec::new());
                }
                NetworkEvent::SocketData(socket) => {
                    if self.conns.contains_key(&socket) {
                        self.handle_data(net, socket, &mut upgrades);
                    }
                }
                NetworkEvent::SocketClosed(socket) | NetworkEvent::SocketError(socket) => {
                    self.conns.remove(&socket);
                }
                NetworkEvent::Accepted { .. } => {}
            }
        }
        upgrades
    }

    fn handle_data(
        &mut self,
        net: &mut NetworkSystem,
        socket: PollableId,
        upgrades: &mut Vec<UpgradeRequest>,
    ) {
        let bytes = net.read_to_vec(socket);
        let Some(mut codec) = self.conns.remove(&socket) else {
            return;
        };
        codec.feed(&bytes);

        loop {
            match codec.advance() {
                Ok(Some(mut request)) => {
                    if is_websocket_upgrade(&request) {
                        #[cfg(feature = "log")]
                        log::debug!(target: "http", "WebSocket upgrade requested on {socket} for {}", request.path);
                        upgrades.push(UpgradeRequest {
                            socket,
                            remainder: codec.take_remainder(),
                            request,
                        });
                        return;
                    }
                    if let Some(peer) = net.socket(socket) {
                        request.remote_addr = peer.remote_addr().to_owned();
                        request.remote_port = peer.remote_port();
                    }
                    if self.respond(net, socket, &request) {
                        // Connection closes after this response; pipelined
                        // leftovers are dropped with the codec
                        net.close_when_drained(socket);
                        return;
                    }
                }
                Ok(None) => break,
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "http", "Parse failure on {socket}: {_err}");
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
        }

        self.conns.insert(socket, codec);
    }

    /// Runs the route handler (or the 404 default), writes the response and
    /// reports whether the connection must close afterwards.
    fn respond(&mut self, net: &mut NetworkSystem, socket: PollableId, request: &HttpRequest) -> bool {
        let mut response = HttpResponse::default();
        let key = format!("{}:{}", request.method, request.path);
        match self.routes.get_mut(&key) {
            Some(handler) => handler(request, &mut response),
            None => {
                response.status_code = 404;
                response.status_text = s!("Not Found");
                response.headers.insert("Content-Type", "text/html");
                response.body = NOT_FOUND_BODY.as_bytes().to_vec();
            }
        }

        let close = request.headers.contains_token("Connection", "close")
            || response.headers.contains_token("Connection", "close");

        #[cfg(feature = "log")]
        log::debug!(target: "http", "{} {} -> {} on {socket}", request.method, request.path, response.status_code);

        net.send(socket, &build_response(&response));
        close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::http::codec::{build_request, ResponseCodec};
    use crate::http::HttpRequest;

    const DEADLINE_MS: i64 = 3000;

    struct Rig {
        server_net: NetworkSystem,
        server: HttpServer,
        client_net: NetworkSystem,
        client_sock: PollableId,
    }

    fn rig(configure: impl FnOnce(&mut HttpServer)) -> Rig {
        let mut server_net = NetworkSystem::new().unwrap();
        let listener = server_net.create_listener(0).unwrap();
        let port = server_net.listener(listener).unwrap().local_port();
        let mut server = HttpServer::attach(listener);
        configure(&mut server);

        let mut client_net = NetworkSystem::new().unwrap();
        let client_sock = client_net.create_socket("127.0.0.1", port).unwrap();

        Rig {
            server_net,
            server,
            client_net,
            client_sock,
        }
    }

    fn fetch(rig: &mut Rig, wire: &[u8]) -> super::HttpResponse {
        rig.client_net.send(rig.client_sock, wire);
        let mut codec = ResponseCodec::new();
        let started = Timestamp::now();
        while started.elapsed_ms() < DEADLINE_MS {
            let events = rig.server_net.poll(10);
            rig.server.handle(&mut rig.server_net, &events);
            rig.server_net.remove_closed_sockets(&events);

            for event in rig.client_net.poll(10) {
                match event {
                    crate::system::NetworkEvent::SocketData(id) => {
                        let bytes = rig.client_net.read_to_vec(id);
                        codec.feed(&bytes);
                    }
                    crate::system::NetworkEvent::SocketClosed(_)
                    | crate::system::NetworkEvent::SocketError(_) => {
                        if let Some(response) = codec.take_on_close() {
                            return response;
                        }
                    }
                    _ => {}
                }
            }
            if let Some(response) = codec.advance().unwrap() {
                return response;
            }
        }
        panic!("no response within {DEADLINE_MS}ms");
    }

    #[test]
    fn routed_request_invokes_handler_once() {
        let mut rig = rig(|server| {
            server.get("/hello", |request, response| {
                assert_eq!(request.method, Method::Get);
                response.body = b"hi there".to_vec();
            });
        });

        let request = HttpRequest {
            path: s!("/hello"),
            ..HttpRequest::default()
        };
        let response = fetch(&mut rig, &build_request(&request, "127.0.0.1", 8080));
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"hi there");
        assert_eq!(response.headers.get("content-length"), Some("8"));
    }

    #[test]
    fn unrouted_request_gets_404_with_body() {
        let mut rig = rig(|_| {});
        let request = HttpRequest {
            path: s!("/nonexistent"),
            ..HttpRequest::default()
        };
        let response = fetch(&mut rig, &build_request(&request, "127.0.0.1", 8080));
        assert_eq!(response.status_code, 404);
        assert_eq!(response.status_text, "Not Found");
        assert!(!response.body.is_empty());
        assert_eq!(
            response.headers.get("Content-Length"),
            Some(response.body.len().to_string().as_str())
        );
    }

    #[test]
    fn body_split_across_ticks_is_reassembled() {
        let mut rig = rig(|server| {
            server.post("/submit", |request, response| {
                response.body = request.body.clone();
            });
        });

        let wire =
            b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello".to_vec();
        rig.client_net.send(rig.client_sock, &wire);
        // A few ticks pass with the request incomplete
        for _ in 0..5 {
            let events = rig.server_net.poll(10);
            rig.server.handle(&mut rig.server_net, &events);
            rig.client_net.poll(10);
        }
        let response = fetch(&mut rig, b" world");
        assert_eq!(response.body, b"hello world");
    }

    #[test]
    fn malformed_request_is_rejected_with_400() {
        let mut rig = rig(|_| {});
        let response = fetch(&mut rig, b"BREW /coffee HTTP/1.1\r\n\r\n");
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn upgrade_requests_are_handed_over_unanswered() {
        let mut rig = rig(|_| {});
        let wire = b"GET /chat HTTP/1.1\r\n\
                     Host: x\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                     Sec-WebSocket-Version: 13\r\n\r\n";
        rig.client_net.send(rig.client_sock, wire);

        let mut upgrade = None;
        let started = Timestamp::now();
        while upgrade.is_none() && started.elapsed_ms() < DEADLINE_MS {
            let events = rig.server_net.poll(10);
            upgrade = rig.server.handle(&mut rig.server_net, &events).pop();
            rig.client_net.poll(10);
        }
        let upgrade = upgrade.expect("upgrade detected");
        assert_eq!(upgrade.request.path, "/chat");
        assert!(upgrade.remainder.is_empty());
        assert_eq!(rig.server.connections(), 0, "socket no longer tracked by HTTP");
    }
}
