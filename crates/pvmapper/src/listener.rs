// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-facing UDP endpoint.
//!
//! Receives CA search requests from control clients and unicasts cached
//! replies back from the same socket, so the client sees the answer coming
//! from the address it queried.

use crate::protocol::ca;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

/// One decoded client search.
#[derive(Debug)]
pub struct ClientQuery {
    pub chan_id: u32,
    pub name: String,
    pub client: SocketAddr,
}

pub struct Listener {
    socket: mio::net::UdpSocket,
    local: SocketAddrV4,
}

impl Listener {
    /// Bind the endpoint. SO_REUSEADDR is set so a restart does not trip
    /// over sockets in TIME_WAIT-adjacent states.
    pub fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(addr).into())?;
        let socket = mio::net::UdpSocket::from_std(socket.into());

        let local = match socket.local_addr()? {
            SocketAddr::V4(local) => local,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "listener requires an IPv4 address",
                ))
            }
        };
        Ok(Self { socket, local })
    }

    pub fn socket_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }

    /// Actual bound address (resolves port 0 binds).
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Drain the socket and decode every search request in it.
    pub fn process_incoming(&mut self) -> Vec<ClientQuery> {
        let mut queries = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let (len, client) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("listener {} recv error: {}", self.local, err);
                    break;
                }
            };
            log::trace!(
                "received {} byte datagram from {}, potential search request",
                len,
                client
            );
            for (chan_id, name) in ca::decode_search_request(&buf[..len]) {
                queries.push(ClientQuery {
                    chan_id,
                    name,
                    client,
                });
            }
        }
        queries
    }

    /// Unicast a cached reply back to a client with its channel id patched
    /// in.
    pub fn send_reply(&mut self, reply: &[u8], chan_id: u32, client: SocketAddr) {
        let mut reply = reply.to_vec();
        ca::rewrite_reply_client_cid(&mut reply, chan_id);
        if let Err(err) = self.socket.send_to(&reply, client) {
            log::debug!("failed to send reply to {}: {}", client, err);
        }
    }
}
