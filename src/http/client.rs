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

//! HTTP/1.1 client glue: one request per connection, response buffered in
//! per-client instance state.

use super::codec::{build_request, ResponseCodec};
use super::{HttpRequest, HttpResponse, Method};
use crate::reactor::PollableId;
use crate::system::{Error, NetworkEvent, NetworkSystem};
use crate::timers::TimerId;

/// Invoked once per issued request, with the response or an error text.
pub type ResponseCallback = Box<dyn FnMut(Result<HttpResponse, String>)>;

/// Default per-request timeout.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

struct Pending {
    socket: PollableId,
    codec: ResponseCodec,
    callback: ResponseCallback,
    timeout: TimerId,
}

/// A single-request HTTP client over the network event stream.
///
/// Issues `Connection: close` requests, so the response may be delimited by
/// either `Content-Length` or the peer closing. The request timeout is a
/// level-triggered reactor timer checked on every [`HttpClient::handle`]
/// call.
#[derive(Default)]
pub struct HttpClient {
    pending: Option<Pending>,
    timeout_ms: Option<u64>,
}

impl HttpClient {
    pub fn new() -> Self { HttpClient::default() }

    /// Overrides the default 30-second request timeout.
    pub fn set_timeout_ms(&mut self, ms: u64) { self.timeout_ms = Some(ms); }

    /// Whether a request is in flight.
    pub fn is_pending(&self) -> bool { self.pending.is_some() }

    pub fn get(
        &mut self,
        net: &mut NetworkSystem,
        url: &str,
        callback: impl FnMut(Result<HttpResponse, String>) + 'static,
    ) -> Result<(), Error> {
        self.request(net, Method::Get, url, vec![], callback)
    }

    pub fn post(
        &mut self,
        net: &mut NetworkSystem,
        url: &str,
        body: Vec<u8>,
        callback: impl FnMut(Result<HttpResponse, String>) + 'static,
    ) -> Result<(), Error> {
        self.request(net, Method::Post, url, body, callback)
    }

    pub fn put(
        &mut self,
        net: &mut NetworkSystem,
        url: &str,
        body: Vec<u8>,
        callback: impl FnMut(Result<HttpResponse, String>) + 'static,
    ) -> Result<(), Error> {
        self.request(net, Method::Put, url, body, callback)
    }

    pub fn delete(
        &mut self,
        net: &mut NetworkSystem,
        url: &str,
        callback: impl FnMut(Result<HttpResponse, String>) + 'static,
    ) -> Result<(), Error> {
        self.request(net, Method::Delete, url, vec![], callback)
    }

    /// Connects and sends one request. A previously pending request is
    /// aborted without its callback firing.
    pub fn request(
        &mut self,
        net: &mut NetworkSystem,
        method: Method,
        url: &str,
        body: Vec<u8>,
        callback: impl FnMut(Result<HttpResponse, String>) + 'static,
    ) -> Result<(), Error> {
        self.abort(net);

        let (host, port, path) = parse_url(url);
        let socket = net.create_socket(&host, port)?;

        let mut request = HttpRequest {
            method,
            url: url.to_owned(),
            path,
            body,
            ..HttpRequest::default()
        };
        request.headers.insert("Connection", "close");
        net.send(socket, &build_request(&request, &host, port));

        #[cfg(feature = "log")]
        log::debug!(target: "http", "{method} {url} issued on socket {socket}");

        let timeout = net.create_timer(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS), false);
        self.pending = Some(Pending {
            socket,
            codec: ResponseCodec::new(),
            callback: Box::new(callback),
            timeout,
        });
        Ok(())
    }

    /// Drops the in-flight request, if any, without invoking its callback.
    pub fn abort(&mut self, net: &mut NetworkSystem) {
        if let Some(pending) = self.pending.take() {
            net.destroy_timer(pending.timeout);
            net.remove(pending.socket);
        }
    }

    /// Processes one tick's events and the request-timeout flag.
    pub fn handle(&mut self, net: &mut NetworkSystem, events: &[NetworkEvent]) {
        let (socket, timeout) = match &self.pending {
            Some(pending) => (pending.socket, pending.timeout),
            None => return,
        };

        if net.is_timer_expired(timeout) {
            #[cfg(feature = "log")]
            log::debug!(target: "http", "Request on socket {socket} timed out");
            self.finish(net, Err(s!("request timed out")));
            return;
        }

        for event in events {
            if event.socket() != socket {
                continue;
            }
            match event {
                NetworkEvent::SocketData(id) => {
                    let bytes = net.read_to_vec(*id);
                    let pending = self.pending.as_mut().expect("pending checked above");
                    pending.codec.feed(&bytes);
                    let step = pending.codec.advance();
                    match step {
                        Ok(Some(response)) => {
                            self.finish(net, Ok(response));
                            return;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.finish(net, Err(format!("malformed response: {err}")));
                            return;
                        }
                    }
                }
                NetworkEvent::SocketClosed(_) => {
                    let pending = self.pending.as_mut().expect("pending checked above");
                    let outcome = match pending.codec.take_on_close() {
                        Some(response) => Ok(response),
                        None => Err(s!("connection closed before a complete response")),
                    };
                    self.finish(net, outcome);
                    return;
                }
                NetworkEvent::SocketError(_) => {
                    self.finish(net, Err(s!("socket error during request")));
                    return;
                }
                NetworkEvent::Accepted { .. } => {}
            }
        }
    }

    fn finish(&mut self, net: &mut NetworkSystem, outcome: Result<HttpResponse, String>) {
        let mut done = self.pending.take().expect("finish called with a pending request");
        net.destroy_timer(done.timeout);
        net.remove(done.socket);
        (done.callback)(outcome);
    }
}

/// Splits `[scheme://]host[:port][/path]` into host, port and path.
///
/// The scheme only selects the default port (443 for `https`, 80 otherwise);
/// the wire is always plain TCP.
fn parse_url(url: &str) -> (String, u16, String) {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let default_port = if url.starts_with("https://") { 443 } else { 80 };

    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], rest[pos..].to_owned()),
        None => (rest, s!("/")),
    };
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().unwrap_or(default_port);
            (host.to_owned(), port, path)
        }
        None => (authority.to_owned(), default_port, path),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::clock::Timestamp;
    use crate::http::HttpServer;

    const DEADLINE_MS: i64 = 3000;

    #[test]
    fn parse_url_variants() {
        assert_eq!(parse_url("http://example.com/x?y=1"), (s!("example.com"), 80, s!("/x?y=1")));
        assert_eq!(parse_url("example.com:8080"), (s!("example.com"), 8080, s!("/")));
        assert_eq!(parse_url("https://example.com"), (s!("example.com"), 443, s!("/")));
        assert_eq!(parse_url("127.0.0.1:9000/api"), (s!("127.0.0.1"), 9000, s!("/api")));
    }

    #[test]
    fn get_roundtrip_against_local_server() {
        let mut server_net = NetworkSystem::new().unwrap();
        let listener = server_net.create_listener(0).unwrap();
        let port = server_net.listener(listener).unwrap().local_port();
        let mut server = HttpServer::attach(listener);
        server.get("/greet", |_, response| {
            response.body = b"hello client".to_vec();
        });

        let mut client_net = NetworkSystem::new().unwrap();
        let mut client = HttpClient::new();
        let result: Rc<RefCell<Option<Result<HttpResponse, String>>>> =
            Rc::new(RefCell::new(None));
        let slot = result.clone();
        client
            .get(&mut client_net, &format!("http://127.0.0.1:{port}/greet"), move |outcome| {
                *slot.borrow_mut() = Some(outcome.map_err(|e| e.to_string()));
            })
            .unwrap();

        let started = Timestamp::now();
        while result.borrow().is_none() && started.elapsed_ms() < DEADLINE_MS {
            let events = server_net.poll(10);
            server.handle(&mut server_net, &events);
            server_net.remove_closed_sockets(&events);

            let events = client_net.poll(10);
            client.handle(&mut client_net, &events);
            client_net.remove_closed_sockets(&events);
        }

        let outcome = result.borrow_mut().take().expect("response received");
        let response = outcome.expect("no error");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"hello client");
        assert!(!client.is_pending());
    }

    #[test]
    fn timeout_fires_when_server_stays_silent() {
        // A listener which accepts but never answers
        let mut server_net = NetworkSystem::new().unwrap();
        let listener = server_net.create_listener(0).unwrap();
        let port = server_net.listener(listener).unwrap().local_port();

        let mut client_net = NetworkSystem::new().unwrap();
        let mut client = HttpClient::new();
        client.set_timeout_ms(100);
        let result: Rc<RefCell<Option<Result<HttpResponse, String>>>> =
            Rc::new(RefCell::new(None));
        let slot = result.clone();
        client
            .get(&mut client_net, &format!("http://127.0.0.1:{port}/slow"), move |outcome| {
                *slot.borrow_mut() = Some(outcome);
            })
            .unwrap();

        let started = Timestamp::now();
        while result.borrow().is_none() && started.elapsed_ms() < DEADLINE_MS {
            server_net.poll(10);
            let events = client_net.poll(10);
            client.handle(&mut client_net, &events);
        }

        let outcome = result.borrow_mut().take().expect("timeout reported");
        assert_eq!(outcome.unwrap_err(), "request timed out");
        assert!(!client.is_pending());
    }
}
