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

//! Incremental HTTP/1.1 parsers and wire builders.
//!
//! Both codecs consume a growing byte buffer fed from socket reads. A parse
//! step either produces a complete message, reports that more bytes are
//! needed, or fails with a [`ParseError`] — partial input never corrupts
//! state, and bytes of a following pipelined message stay in the buffer.

use super::{Headers, HttpRequest, HttpResponse, Method};

/// HTTP parsing failure. The owning endpoint responds with `400 Bad Request`
/// (server) or aborts the request (client) and closes the connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ParseError {
    /// malformed request line
    RequestLine,

    /// malformed status line
    StatusLine,

    /// unsupported HTTP method
    Method,

    /// malformed header line
    Header,

    /// invalid Content-Length value
    ContentLength,
}

/// Returns the line up to the next CRLF and the number of bytes to consume,
/// or `None` when no complete line is buffered yet.
fn take_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    buf.windows(2)
        .position(|w| w == b"\r\n")
        .map(|end| (&buf[..end], end + 2))
}

fn header_from_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::Header)?;
    let (name, value) = text.split_once(':').ok_or(ParseError::Header)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::Header);
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

fn content_length(headers: &Headers) -> Result<Option<usize>, ParseError> {
    match headers.get("Content-Length") {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ParseError::ContentLength),
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    FirstLine,
    Headers,
    Body,
}

/// Incremental parser for HTTP/1.1 requests on a server-side connection.
///
/// After a request completes the parser resets itself, so pipelined and
/// keep-alive requests parse from the same instance.
#[derive(Debug)]
pub struct RequestCodec {
    buf: Vec<u8>,
    state: State,
    request: HttpRequest,
    content_length: usize,
}

impl Default for RequestCodec {
    fn default() -> Self { RequestCodec::new() }
}

impl RequestCodec {
    pub fn new() -> Self {
        RequestCodec {
            buf: vec![],
            state: State::FirstLine,
            request: HttpRequest::default(),
            content_length: 0,
        }
    }

    /// Appends freshly read bytes to the parse buffer.
    pub fn feed(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }

    /// Bytes buffered beyond the last completed message.
    ///
    /// Used on WebSocket upgrade: frames sent immediately after the upgrade
    /// request belong to the frame decoder, not to this parser.
    pub fn take_remainder(&mut self) -> Vec<u8> { std::mem::take(&mut self.buf) }

    /// Attempts one parse step over the buffered bytes.
    ///
    /// Returns `Ok(Some(request))` when a full request (including its
    /// `Content-Length` body) is available, `Ok(None)` when more bytes are
    /// needed.
    pub fn advance(&mut self) -> Result<Option<HttpRequest>, ParseError> {
        loop {
            match self.state {
                State::FirstLine => {
                    let (line, consumed) = match take_line(&self.buf) {
                        None => return Ok(None),
                        Some((line, consumed)) => (line.to_vec(), consumed),
                    };
                    self.parse_request_line(&line)?;
                    self.buf.drain(..consumed);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some((line, consumed)) = take_line(&self.buf) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.buf.drain(..consumed);
                        self.content_length = content_length(&self.request.headers)?.unwrap_or(0);
                        self.state = State::Body;
                        continue;
                    }
                    let (name, value) = header_from_line(line)?;
                    self.buf.drain(..consumed);
                    self.request.headers.insert(name, value);
                }
                State::Body => {
                    if self.buf.len() < self.content_length {
                        return Ok(None);
                    }
                    let mut request = std::mem::take(&mut self.request);
                    request.body = self.buf.drain(..self.content_length).collect();
                    self.state = State::FirstLine;
                    self.content_length = 0;
                    return Ok(Some(request));
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, |&b| b == b' ');
        let method = parts.next().ok_or(ParseError::RequestLine)?;
        let url = parts.next().ok_or(ParseError::RequestLine)?;
        let version = parts.next().ok_or(ParseError::RequestLine)?;
        if !version.starts_with(b"HTTP/") || url.is_empty() {
            return Err(ParseError::RequestLine);
        }

        self.request.method = Method::from_bytes(method).ok_or(ParseError::Method)?;
        let url = std::str::from_utf8(url).map_err(|_| ParseError::RequestLine)?;
        self.request.url = url.to_owned();
        match url.split_once('?') {
            Some((path, query)) => {
                self.request.path = path.to_owned();
                self.request.query = query.to_owned();
            }
            None => {
                self.request.path = url.to_owned();
                self.request.query = String::new();
            }
        }
        Ok(())
    }
}

/// Incremental parser for HTTP/1.1 responses on a client-side connection.
///
/// Body framing: `Content-Length` when present; empty for status codes that
/// cannot carry a body (1xx, 204, 304); otherwise delimited by connection
/// close, finalized through [`ResponseCodec::take_on_close`].
#[derive(Debug)]
pub struct ResponseCodec {
    buf: Vec<u8>,
    state: State,
    response: HttpResponse,
    content_length: Option<usize>,
}

impl Default for ResponseCodec {
    fn default() -> Self { ResponseCodec::new() }
}

impl ResponseCodec {
    pub fn new() -> Self {
        ResponseCodec {
            buf: vec![],
            state: State::FirstLine,
            response: HttpResponse::default(),
            content_length: None,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }

    /// Bytes buffered beyond the last completed message (e.g. WebSocket
    /// frames following a 101 response).
    pub fn take_remainder(&mut self) -> Vec<u8> { std::mem::take(&mut self.buf) }

    pub fn advance(&mut self) -> Result<Option<HttpResponse>, ParseError> {
        loop {
            match self.state {
                State::FirstLine => {
                    let (line, consumed) = match take_line(&self.buf) {
                        None => return Ok(None),
                        Some((line, consumed)) => (line.to_vec(), consumed),
                    };
                    self.parse_status_line(&line)?;
                    self.buf.drain(..consumed);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some((line, consumed)) = take_line(&self.buf) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.buf.drain(..consumed);
                        self.content_length = content_length(&self.response.headers)?;
                        self.state = State::Body;
                        continue;
                    }
                    let (name, value) = header_from_line(line)?;
                    self.buf.drain(..consumed);
                    self.response.headers.insert(name, value);
                }
                State::Body => {
                    let length = match self.content_length {
                        Some(length) => length,
                        None if self.bodyless_status() => 0,
                        // Delimited by connection close
                        None => return Ok(None),
                    };
                    if self.buf.len() < length {
                        return Ok(None);
                    }
                    let mut response = std::mem::take(&mut self.response);
                    response.body = self.buf.drain(..length).collect();
                    self.state = State::FirstLine;
                    self.content_length = None;
                    return Ok(Some(response));
                }
            }
        }
    }

    /// Finalizes a close-delimited body once the peer has closed.
    ///
    /// Returns `None` when the headers were not complete — the response was
    /// truncated and the caller should report an error.
    pub fn take_on_close(&mut self) -> Option<HttpResponse> {
        if self.state != State::Body || self.content_length.is_some() {
            return None;
        }
        let mut response = std::mem::take(&mut self.response);
        response.body = std::mem::take(&mut self.buf);
        self.state = State::FirstLine;
        Some(response)
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = std::str::from_utf8(line).map_err(|_| ParseError::StatusLine)?;
        let mut parts = text.splitn(3, ' ');
        let version = parts.next().ok_or(ParseError::StatusLine)?;
        let code = parts.next().ok_or(ParseError::StatusLine)?;
        if !version.starts_with("HTTP/") {
            return Err(ParseError::StatusLine);
        }
        self.response.status_code = code.parse().map_err(|_| ParseError::StatusLine)?;
        self.response.status_text = parts.next().unwrap_or("").to_owned();
        Ok(())
    }

    fn bodyless_status(&self) -> bool {
        let code = self.response.status_code;
        (100..200).contains(&code) || code == 204 || code == 304
    }
}

/// Serializes a request for the wire.
///
/// Emits the request line, a `Host` header, application headers in insertion
/// order and a `Content-Length` for non-empty POST/PUT bodies.
pub fn build_request(request: &HttpRequest, host: &str, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + request.body.len());
    let target = if request.query.is_empty() {
        request.path.clone()
    } else {
        format!("{}?{}", request.path, request.query)
    };
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, target).as_bytes());
    if port == 80 {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    } else {
        out.extend_from_slice(format!("Host: {host}:{port}\r\n").as_bytes());
    }
    for (name, value) in request.headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    let needs_length = matches!(request.method, Method::Post | Method::Put)
        && !request.body.is_empty()
        && !request.headers.contains("Content-Length");
    if needs_length {
        out.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Serializes a response for the wire.
///
/// `Content-Length` is emitted whenever the body is non-empty and the
/// application did not set one itself.
pub fn build_response(response: &HttpResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", response.status_code, response.status_text).as_bytes(),
    );
    for (name, value) in response.headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !response.body.is_empty() && !response.headers.contains("Content-Length") {
        out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

/// Whether a parsed request asks for an RFC 6455 WebSocket upgrade.
///
/// Requires GET, `Upgrade` containing `websocket`, `Connection` containing
/// `upgrade` (both case-insensitive), a non-empty `Sec-WebSocket-Key` and
/// `Sec-WebSocket-Version: 13`.
pub fn is_websocket_upgrade(request: &HttpRequest) -> bool {
    request.method == Method::Get
        && request.headers.contains_token("Upgrade", "websocket")
        && request.headers.contains_token("Connection", "upgrade")
        && request.headers.get("Sec-WebSocket-Key").map(|k| !k.trim().is_empty()).unwrap_or(false)
        && request.headers.get("Sec-WebSocket-Version").map(str::trim) == Some("13")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_in_one_piece() {
        let mut codec = RequestCodec::new();
        codec.feed(b"GET /items/1?q=test HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let request = codec.advance().unwrap().expect("complete");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.url, "/items/1?q=test");
        assert_eq!(request.path, "/items/1");
        assert_eq!(request.query, "q=test");
        assert_eq!(request.headers.get("host"), Some("localhost"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn request_delivered_byte_by_byte() {
        let wire = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello";
        let mut codec = RequestCodec::new();
        let mut complete = None;
        for byte in wire.iter() {
            codec.feed(std::slice::from_ref(byte));
            if let Some(request) = codec.advance().unwrap() {
                complete = Some(request);
            }
        }
        let request = complete.expect("parsed exactly once at the final byte");
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/submit");
        assert_eq!(request.body, b"hello");
        assert_eq!(request.headers.get("x-a"), Some("b"));
    }

    #[test]
    fn pipelined_requests_parse_in_order() {
        let mut codec = RequestCodec::new();
        codec.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = codec.advance().unwrap().unwrap();
        let second = codec.advance().unwrap().unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
        assert!(codec.advance().unwrap().is_none());
    }

    #[test]
    fn header_value_whitespace_is_trimmed() {
        let mut codec = RequestCodec::new();
        codec.feed(b"GET / HTTP/1.1\r\nX-Pad:   spaced value  \r\n\r\n");
        let request = codec.advance().unwrap().unwrap();
        assert_eq!(request.headers.get("x-pad"), Some("spaced value"));
    }

    #[test]
    fn malformed_inputs_error() {
        let mut codec = RequestCodec::new();
        codec.feed(b"NONSENSE\r\n\r\n");
        assert!(codec.advance().is_err());

        let mut codec = RequestCodec::new();
        codec.feed(b"BREW /coffee HTTP/1.1\r\n\r\n");
        assert!(matches!(codec.advance(), Err(ParseError::Method)));

        let mut codec = RequestCodec::new();
        codec.feed(b"GET / HTTP/1.1\r\nContent-Length: soon\r\n\r\n");
        assert!(matches!(codec.advance(), Err(ParseError::ContentLength)));
    }

    #[test]
    fn response_with_content_length() {
        let mut codec = ResponseCodec::new();
        codec.feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nbody");
        let response = codec.advance().unwrap().unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.status_text, "Not Found");
        assert_eq!(response.body, b"body");
    }

    #[test]
    fn response_delimited_by_close() {
        let mut codec = ResponseCodec::new();
        codec.feed(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\npartial");
        assert!(codec.advance().unwrap().is_none());
        codec.feed(b" body");
        assert!(codec.advance().unwrap().is_none());
        let response = codec.take_on_close().expect("finalized by close");
        assert_eq!(response.body, b"partial body");
    }

    #[test]
    fn switching_protocols_completes_without_body() {
        let mut codec = ResponseCodec::new();
        codec.feed(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x04ping");
        let response = codec.advance().unwrap().unwrap();
        assert_eq!(response.status_code, 101);
        assert!(response.body.is_empty());
        assert_eq!(codec.take_remainder(), b"\x81\x04ping");
    }

    #[test]
    fn builders_emit_expected_layout() {
        let mut request = HttpRequest {
            method: Method::Post,
            path: s!("/api"),
            body: b"data!".to_vec(),
            ..HttpRequest::default()
        };
        request.headers.insert("X-Token", "42");
        let wire = build_request(&request, "example.com", 8080);
        assert_eq!(
            wire,
            b"POST /api HTTP/1.1\r\nHost: example.com:8080\r\nX-Token: 42\r\n\
              Content-Length: 5\r\n\r\ndata!"
                .to_vec()
        );

        let mut response = HttpResponse::default();
        response.headers.insert("Content-Type", "text/plain");
        response.body = b"hi".to_vec();
        let wire = build_response(&response);
        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi".to_vec()
        );
    }

    #[test]
    fn upgrade_detection() {
        let mut codec = RequestCodec::new();
        codec.feed(
            b"GET /chat HTTP/1.1\r\n\
              Upgrade: WebSocket\r\n\
              Connection: keep-alive, Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        let request = codec.advance().unwrap().unwrap();
        assert!(is_websocket_upgrade(&request));

        let mut plain = HttpRequest::default();
        plain.headers.insert("Upgrade", "websocket");
        assert!(!is_websocket_upgrade(&plain), "missing Connection/key/version");
    }
}
