/*
 * transport.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Smistatore, an HTTP connection manager.
 *
 * Smistatore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Smistatore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Smistatore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Collaborator seams of a `Connection`: byte-stream transports, name resolution,
//! timers and an optional stream multiplexer, plus the events they report.
//!
//! The connection never blocks or spawns. Collaborators start work when asked and
//! report completion later as an `Event` handed to `Connection::handle_event`.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::config::HttpProxy;
use crate::error::{NetworkError, SocketError};
use crate::http::{HeaderList, ReplyId, Request};

/// Index of a channel within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    /// Closing with data still being flushed; `Disconnected` follows.
    Closing,
}

/// Address family: the preference a channel connects with, and the family a peer was reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkLayer {
    Any,
    IPv4,
    IPv6,
}

impl NetworkLayer {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => NetworkLayer::IPv4,
            IpAddr::V6(_) => NetworkLayer::IPv6,
        }
    }

    pub fn accepts(self, addr: &IpAddr) -> bool {
        self == NetworkLayer::Any || self == Self::of(addr)
    }
}

/// Byte stream owned by one channel, plain or TLS. Calls never block.
///
/// `close` and `abort` are synchronous: if the state is `Unconnected` when they return, no
/// further events are reported for that connection. A transport that keeps flushing
/// reports `Closing` and later `Event::Disconnected`.
pub trait Transport {
    /// Start connecting (and, for encrypted transports, the TLS handshake). Reports
    /// `Connected`, then `Encrypted` for TLS, or `Error`.
    fn connect(&mut self, host: &str, port: u16, preference: NetworkLayer);

    /// Reach the target of later `connect` calls through a CONNECT tunnel on `proxy`;
    /// `preference` then applies to the proxy address. A proxy refusing the
    /// credentials is reported as `SocketError::ProxyAuthenticationRequired`.
    fn set_proxy(&mut self, proxy: Option<HttpProxy>) {
        let _ = proxy;
    }

    fn state(&self) -> SocketState;

    /// Queue bytes for sending. Returns the number accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Bytes accepted but not yet sent.
    fn bytes_to_write(&self) -> usize;

    /// Take up to `buf.len()` received bytes.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    fn bytes_available(&self) -> usize;

    /// Graceful close; pending writes may still be flushed.
    fn close(&mut self);

    /// Immediate close; pending writes are dropped.
    fn abort(&mut self);

    /// Family of the connected peer address.
    fn peer_family(&self) -> Option<NetworkLayer>;

    /// ALPN protocol selected during the TLS handshake.
    fn negotiated_protocol(&self) -> Option<Vec<u8>>;

    /// Proceed with the handshake despite the errors reported in `Event::SslErrors`.
    fn ignore_ssl_errors(&mut self);

    fn error_string(&self) -> String;
}

pub trait TransportFactory {
    fn create(&mut self, channel: ChannelId, encrypted: bool) -> Box<dyn Transport>;
}

/// Handle of an outstanding name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupId(pub u64);

pub enum Lookup {
    /// Answer known synchronously (cache hit, or failure to start).
    Ready(Result<Vec<IpAddr>, String>),
    /// Answer follows as `Event::LookupFinished`.
    Pending(LookupId),
}

pub trait HostResolver {
    fn lookup(&mut self, host: &str) -> Lookup;

    /// Cancel a pending lookup. No `LookupFinished` is expected for it afterwards.
    fn abort(&mut self, _id: LookupId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Single-shot timers. A cancelled timer never fires.
pub trait TimerService {
    fn start(&mut self, delay: Duration) -> TimerToken;

    fn cancel(&mut self, token: TimerToken);
}

/// Output of a multiplexer for one stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Head {
        stream: u32,
        status: u16,
        headers: HeaderList,
    },
    Data {
        stream: u32,
        data: Bytes,
    },
    End {
        stream: u32,
    },
    Reset {
        stream: u32,
        error: NetworkError,
    },
}

/// Framing layer that carries many requests over one transport (HTTP/2 style).
pub trait Multiplexer {
    fn can_open_stream(&self) -> bool;

    /// Encode the request (head and body) for a new stream. Returns the stream id.
    fn open_stream(&mut self, request: &mut Request) -> Result<u32, NetworkError>;

    fn reset_stream(&mut self, stream: u32);

    /// Feed bytes read from the transport.
    fn receive(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>, NetworkError>;

    /// Bytes that must be written to the transport.
    fn take_outgoing(&mut self) -> Vec<u8>;
}

pub trait MultiplexerFactory {
    fn create(&mut self) -> Box<dyn Multiplexer>;
}

/// Something that happened outside the connection.
#[derive(Debug, Clone)]
pub enum Event {
    Connected(ChannelId),
    Encrypted(ChannelId),
    SslErrors(ChannelId, Vec<String>),
    ReadyRead(ChannelId),
    BytesWritten(ChannelId, usize),
    Disconnected(ChannelId),
    Error(ChannelId, SocketError),
    LookupFinished(LookupId, Result<Vec<IpAddr>, String>),
    TimerFired(TimerToken),
    /// More upload data is available for a reply's request body.
    UploadReady(ReplyId),
}

/// Everything a connection needs from its environment.
pub struct Collaborators {
    pub transports: Box<dyn TransportFactory>,
    pub resolver: Box<dyn HostResolver>,
    pub timers: Box<dyn TimerService>,
    pub multiplexers: Option<Box<dyn MultiplexerFactory>>,
}
