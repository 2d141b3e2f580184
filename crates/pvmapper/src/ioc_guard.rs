// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-IOC liveness guard.
//!
//! One non-blocking TCP connection per discovered IOC, used for nothing but
//! an echo heartbeat. The state machine is strictly
//! `Connecting -> Active -> Lost`:
//!
//! - Connecting times out after the connect timeout if the socket never
//!   becomes writable; a writable socket with no pending error activates
//!   the guard.
//! - While Active, an echo goes out every heartbeat interval, the first one
//!   prefixed with a VERSION frame. If the previous echo was never
//!   answered the IOC is declared lost instead.
//! - Any read of zero bytes or socket error is an immediate loss.
//!
//! Lost is terminal and reported exactly once; a re-discovered endpoint
//! gets a fresh guard.

use crate::directory::IocEndpoint;
use crate::protocol::ca;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Connecting,
    Active,
    Lost,
}

pub struct IocGuard {
    stream: mio::net::TcpStream,
    endpoint: IocEndpoint,
    state: GuardState,
    started_at: Instant,
    last_sent: Option<Instant>,
    last_recv: Instant,
    /// Set once the IOC has answered anything; later echoes skip the
    /// VERSION prefix.
    protocol_initialized: bool,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
}

impl IocGuard {
    /// Start a non-blocking connect to the IOC.
    pub fn connect(
        endpoint: IocEndpoint,
        heartbeat_interval: Duration,
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = mio::net::TcpStream::connect(SocketAddr::V4(endpoint.into()))?;
        Ok(Self {
            stream,
            endpoint,
            state: GuardState::Connecting,
            started_at: Instant::now(),
            last_sent: None,
            last_recv: Instant::now(),
            protocol_initialized: false,
            heartbeat_interval,
            connect_timeout,
        })
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn endpoint(&self) -> IocEndpoint {
        self.endpoint
    }

    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    /// Writable readiness: completes the non-blocking connect. Returns true
    /// when the guard transitioned to Lost during this call.
    pub fn on_writable(&mut self) -> bool {
        if self.state != GuardState::Connecting {
            return false;
        }
        match self.stream.take_error() {
            Ok(None) => {
                self.state = GuardState::Active;
                self.last_recv = Instant::now();
                log::debug!("connected to IOC {}", self.endpoint);
                false
            }
            Ok(Some(err)) | Err(err) => {
                log::info!("failed to connect to IOC {}: {}", self.endpoint, err);
                self.lost()
            }
        }
    }

    /// Readable readiness: drain and discard heartbeat responses, stamping
    /// the response clock. Returns true on transition to Lost.
    pub fn on_readable(&mut self) -> bool {
        if self.state == GuardState::Lost {
            return false;
        }
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    log::info!(
                        "IOC {} appears to have closed its socket, disconnecting",
                        self.endpoint
                    );
                    return self.lost();
                }
                Ok(_) => {
                    log::debug!("received heartbeat response from IOC {}", self.endpoint);
                    self.last_recv = Instant::now();
                    self.protocol_initialized = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::info!(
                        "error receiving from IOC {}: {}, disconnecting",
                        self.endpoint,
                        err
                    );
                    return self.lost();
                }
            }
        }
    }

    /// Outgoing tick: connect-timeout enforcement and the heartbeat cycle.
    /// Returns true on transition to Lost.
    pub fn process_outgoing(&mut self) -> bool {
        match self.state {
            GuardState::Lost => false,
            GuardState::Connecting => {
                if self.started_at.elapsed() > self.connect_timeout {
                    log::info!(
                        "failed to connect to IOC {} in {}s, giving up",
                        self.endpoint,
                        self.connect_timeout.as_secs()
                    );
                    self.lost()
                } else {
                    false
                }
            }
            GuardState::Active => {
                let due = match self.last_sent {
                    None => true,
                    Some(sent) => sent.elapsed() >= self.heartbeat_interval,
                };
                if due {
                    self.send_heartbeat()
                } else {
                    false
                }
            }
        }
    }

    fn send_heartbeat(&mut self) -> bool {
        let answered = match self.last_sent {
            None => true,
            Some(sent) => sent <= self.last_recv,
        };
        if !answered {
            log::info!(
                "didn't receive last heartbeat response from IOC {}, disconnecting",
                self.endpoint
            );
            return self.lost();
        }

        let frame = ca::encode_echo(!self.protocol_initialized);
        match self.stream.write(&frame) {
            Ok(_) => {
                log::trace!("sent heartbeat request to IOC {}", self.endpoint);
                self.last_sent = Some(Instant::now());
                false
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                // retry on the next tick
                false
            }
            Err(err) => {
                log::info!(
                    "failed to send heartbeat to IOC {}: {}, disconnecting",
                    self.endpoint,
                    err
                );
                self.lost()
            }
        }
    }

    fn lost(&mut self) -> bool {
        self.state = GuardState::Lost;
        true
    }
}
