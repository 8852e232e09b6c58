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

//! Non-blocking listening TCP socket managed by the reactor.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Type};

use crate::reactor::PollableId;

/// A bound, listening TCP socket.
///
/// While open, the descriptor is non-blocking, close-on-exec and has
/// `SO_REUSEADDR` set. The listener is owned by the reactor for its whole
/// lifetime; external code refers to it by [`PollableId`].
#[derive(Debug)]
pub struct Listener {
    id: PollableId,
    sock: Option<TcpListener>,
    port: u16,
}

impl Listener {
    pub(crate) fn new(id: PollableId) -> Self {
        Listener {
            id,
            sock: None,
            port: 0,
        }
    }

    pub fn id(&self) -> PollableId { self.id }

    /// Binds and starts listening on `port` (IPv4, all interfaces).
    ///
    /// Port zero asks the kernel for an ephemeral port; the effective port is
    /// then available from [`Listener::local_port`].
    pub fn start(&mut self, port: u16) -> io::Result<()> {
        let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        sock.bind(&addr.into())?;
        sock.listen(libc::SOMAXCONN)?;

        self.port = match sock.local_addr()?.as_socket() {
            Some(addr) => addr.port(),
            None => port,
        };
        self.sock = Some(sock.into());

        #[cfg(feature = "log")]
        log::debug!(target: "listener", "Listener {} bound to port {}", self.id, self.port);

        Ok(())
    }

    /// Closes the listening socket. The pollable id stays valid until the
    /// reactor removes the listener.
    pub fn stop(&mut self) {
        self.sock = None;
        #[cfg(feature = "log")]
        log::debug!(target: "listener", "Listener {} stopped", self.id);
    }

    pub fn is_open(&self) -> bool { self.sock.is_some() }

    /// The port this listener is bound to, zero when not started.
    pub fn local_port(&self) -> u16 { self.port }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> { self.sock.as_ref().map(|s| s.as_raw_fd()) }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is pending (EAGAIN). The
    /// accepted stream is switched to non-blocking before being returned.
    pub(crate) fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let Some(sock) = self.sock.as_ref() else {
            return Ok(None);
        };
        match sock.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                Ok(Some((stream, peer)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_on_ephemeral_port() {
        let mut listener = Listener::new(PollableId::test_value(1));
        listener.start(0).unwrap();
        assert!(listener.is_open());
        assert_ne!(listener.local_port(), 0);
        assert!(listener.raw_fd().is_some());

        // Nothing pending: accept reports EAGAIN as None
        assert!(listener.accept().unwrap().is_none());

        listener.stop();
        assert!(!listener.is_open());
        assert!(listener.raw_fd().is_none());
    }

    #[test]
    fn reuseaddr_allows_rebind() {
        let mut first = Listener::new(PollableId::test_value(1));
        first.start(0).unwrap();
        let port = first.local_port();
        first.stop();

        let mut second = Listener::new(PollableId::test_value(2));
        second.start(port).unwrap();
        assert_eq!(second.local_port(), port);
    }
}
