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

//! HTTP/1.1 request/response model, incremental codec and endpoint glue.

mod client;
mod codec;
mod server;

pub use client::{HttpClient, ResponseCallback};
pub use codec::{
    build_request, build_response, is_websocket_upgrade, ParseError, RequestCodec, ResponseCodec,
};
pub use server::{HttpServer, RouteHandler, UpgradeRequest};

/// HTTP request method.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
pub enum Method {
    #[display("GET")]
    Get,
    #[display("POST")]
    Post,
    #[display("PUT")]
    Put,
    #[display("DELETE")]
    Delete,
    #[display("HEAD")]
    Head,
    #[display("OPTIONS")]
    Options,
}

impl Method {
    /// Parses a request-line method token. Unknown tokens yield `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Method> {
        match bytes {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }
}

/// Ordered header collection.
///
/// Lookup is case-insensitive, emission preserves both insertion order and
/// the original spelling of names.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self { Headers::default() }

    /// Sets a header, replacing an existing one with the same name
    /// (case-insensitive) or appending at the end.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(entry) => *entry = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool { self.get(name).is_some() }

    /// Whether the header's comma-separated value list contains `token`,
    /// matched case-insensitively. Used for `Connection` and `Upgrade`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Headers in insertion order with original name spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// A parsed HTTP request.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Full request target as received, path and query included.
    pub url: String,
    pub path: String,
    /// Query string without the leading `?`, empty when absent.
    pub query: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub remote_addr: String,
    pub remote_port: u16,
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest {
            method: Method::Get,
            url: s!("/"),
            path: s!("/"),
            query: s!(""),
            headers: Headers::new(),
            body: vec![],
            remote_addr: s!(""),
            remote_port: 0,
        }
    }
}

/// An HTTP response under construction or received from a server.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            status_code: 200,
            status_text: s!("OK"),
            headers: Headers::new(),
            body: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_and_display() {
        assert_eq!(Method::from_bytes(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_bytes(b"get"), None);
        assert_eq!(Method::from_bytes(b"PATCH"), None);
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }

    #[test]
    fn headers_case_insensitive_preserving() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");
        headers.insert("X-Custom", "1");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));

        // Replacement keeps a single entry and the new spelling
        headers.insert("content-type", "application/json");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("Content-Type"), Some("application/json"));

        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["content-type", "X-Custom"]);
    }

    #[test]
    fn token_lists() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive, Upgrade");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(headers.contains_token("Connection", "keep-alive"));
        assert!(!headers.contains_token("Connection", "close"));
        assert!(!headers.contains_token("Upgrade", "websocket"));
    }
}
