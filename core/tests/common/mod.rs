/*
 * mod.rs
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

//! Scripted collaborators for driving a `Connection` without sockets.
//!
//! Each mock records what the connection asked of it in shared state. Tests move
//! things along by changing that state and handing the matching event to
//! `Harness::event`, just as a runtime would.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use smistatore_core::auth::Authenticator;
use smistatore_core::error::NetworkError;
use smistatore_core::transport::{
    HostResolver, Lookup, LookupId, Multiplexer, MultiplexerFactory, StreamEvent, TimerService, TimerToken,
    Transport, TransportFactory,
};
use smistatore_core::{
    ChannelId, Collaborators, Connection, ConnectionConfig, Event, HeaderList, HttpProxy, NetworkLayer, Reply,
    ReplyBuffer, ReplyHandler, ReplyId, Request, RequestBuilder, SocketError, SocketState,
};

/// What one mock socket has seen and what it will report.
#[derive(Debug)]
pub struct SocketLog {
    pub state: SocketState,
    /// Preference passed to each `connect`.
    pub connects: Vec<NetworkLayer>,
    /// Host and port passed to each `connect`.
    pub targets: Vec<(String, u16)>,
    /// Tunnel proxy in effect for the latest `connect`.
    pub proxy: Option<HttpProxy>,
    /// Bytes written, one entry per connection.
    pub sent: Vec<Vec<u8>>,
    pub inbound: VecDeque<u8>,
    pub peer_family: Option<NetworkLayer>,
    pub alpn: Option<Vec<u8>>,
    pub closes: usize,
    pub aborts: usize,
    pub ssl_errors_ignored: bool,
    /// Bytes reported as not yet flushed; a close then lingers in Closing.
    pub unflushed: usize,
}

impl Default for SocketLog {
    fn default() -> Self {
        Self {
            state: SocketState::Unconnected,
            connects: Vec::new(),
            targets: Vec::new(),
            proxy: None,
            sent: Vec::new(),
            inbound: VecDeque::new(),
            peer_family: None,
            alpn: None,
            closes: 0,
            aborts: 0,
            ssl_errors_ignored: false,
            unflushed: 0,
        }
    }
}

pub struct MockTransport {
    log: Rc<RefCell<SocketLog>>,
}

impl Transport for MockTransport {
    fn connect(&mut self, host: &str, port: u16, preference: NetworkLayer) {
        let mut log = self.log.borrow_mut();
        log.state = SocketState::Connecting;
        log.connects.push(preference);
        log.targets.push((host.to_string(), port));
        log.sent.push(Vec::new());
        log.inbound.clear();
    }

    fn set_proxy(&mut self, proxy: Option<HttpProxy>) {
        self.log.borrow_mut().proxy = proxy;
    }

    fn state(&self) -> SocketState {
        self.log.borrow().state
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut log = self.log.borrow_mut();
        if log.state != SocketState::Connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        }
        if let Some(current) = log.sent.last_mut() {
            current.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn bytes_to_write(&self) -> usize {
        self.log.borrow().unflushed
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut log = self.log.borrow_mut();
        let n = buf.len().min(log.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(log.inbound.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn bytes_available(&self) -> usize {
        self.log.borrow().inbound.len()
    }

    fn close(&mut self) {
        let mut log = self.log.borrow_mut();
        if log.state == SocketState::Unconnected {
            return;
        }
        log.closes += 1;
        log.inbound.clear();
        log.state = if log.state == SocketState::Connected && log.unflushed > 0 {
            SocketState::Closing
        } else {
            SocketState::Unconnected
        };
    }

    fn abort(&mut self) {
        let mut log = self.log.borrow_mut();
        if log.state == SocketState::Unconnected {
            return;
        }
        log.aborts += 1;
        log.inbound.clear();
        log.state = SocketState::Unconnected;
    }

    fn peer_family(&self) -> Option<NetworkLayer> {
        self.log.borrow().peer_family
    }

    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.log.borrow().alpn.clone()
    }

    fn ignore_ssl_errors(&mut self) {
        self.log.borrow_mut().ssl_errors_ignored = true;
    }

    fn error_string(&self) -> String {
        String::new()
    }
}

struct MockTransports {
    sockets: Vec<Rc<RefCell<SocketLog>>>,
}

impl TransportFactory for MockTransports {
    fn create(&mut self, channel: ChannelId, _encrypted: bool) -> Box<dyn Transport> {
        Box::new(MockTransport {
            log: Rc::clone(&self.sockets[channel.0]),
        })
    }
}

#[derive(Debug, Default)]
pub struct ResolverLog {
    pub lookups: Vec<String>,
    pub pending: Option<LookupId>,
    pub aborted: Vec<LookupId>,
    next: u64,
}

struct MockResolver {
    log: Rc<RefCell<ResolverLog>>,
}

impl HostResolver for MockResolver {
    fn lookup(&mut self, host: &str) -> Lookup {
        let mut log = self.log.borrow_mut();
        log.next += 1;
        let id = LookupId(log.next);
        log.lookups.push(host.to_string());
        log.pending = Some(id);
        Lookup::Pending(id)
    }

    fn abort(&mut self, id: LookupId) {
        self.log.borrow_mut().aborted.push(id);
    }
}

#[derive(Debug, Default)]
pub struct TimerLog {
    pub started: Vec<(TimerToken, Duration)>,
    pub cancelled: Vec<TimerToken>,
}

impl TimerLog {
    /// Started and not cancelled.
    pub fn active(&self) -> Vec<TimerToken> {
        self.started
            .iter()
            .map(|(t, _)| *t)
            .filter(|t| !self.cancelled.contains(t))
            .collect()
    }
}

struct MockTimers {
    log: Rc<RefCell<TimerLog>>,
}

impl TimerService for MockTimers {
    fn start(&mut self, delay: Duration) -> TimerToken {
        let mut log = self.log.borrow_mut();
        let token = TimerToken(log.started.len() as u64 + 1);
        log.started.push((token, delay));
        token
    }

    fn cancel(&mut self, token: TimerToken) {
        self.log.borrow_mut().cancelled.push(token);
    }
}

/// Line-based stand-in for a framing protocol.
///
/// Client to server: `OPEN <id> <METHOD> <path>`. Server to client, one frame per
/// line: `HEAD <id> <status> [name: value]...`, `DATA <id> <text>`, `END <id>`,
/// `RESET <id>`. A preface line `PREFACE` is written when the multiplexer is created.
pub struct LineMultiplexer {
    next_stream: u32,
    open: Vec<u32>,
    max_streams: usize,
    outgoing: Vec<u8>,
    partial: Vec<u8>,
    log: Rc<RefCell<MuxLog>>,
}

#[derive(Debug, Default)]
pub struct MuxLog {
    pub created: usize,
    pub resets: Vec<u32>,
}

impl Multiplexer for LineMultiplexer {
    fn can_open_stream(&self) -> bool {
        self.open.len() < self.max_streams
    }

    fn open_stream(&mut self, request: &mut Request) -> Result<u32, NetworkError> {
        let id = self.next_stream;
        self.next_stream += 2;
        self.open.push(id);
        let line = format!("OPEN {} {} {}\n", id, request.method(), request.url().path());
        self.outgoing.extend_from_slice(line.as_bytes());
        Ok(id)
    }

    fn reset_stream(&mut self, stream: u32) {
        self.open.retain(|s| *s != stream);
        self.log.borrow_mut().resets.push(stream);
        self.outgoing.extend_from_slice(format!("RESET {}\n", stream).as_bytes());
    }

    fn receive(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>, NetworkError> {
        self.partial.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            let mut parts = line.splitn(3, ' ');
            let kind = parts.next().unwrap_or("");
            let stream: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let rest = parts.next().unwrap_or("");
            match kind {
                "HEAD" => {
                    let mut fields = rest.split(' ');
                    let status = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let mut headers = HeaderList::new();
                    for field in fields {
                        if let Some((name, value)) = field.split_once(':') {
                            headers.push(name, value);
                        }
                    }
                    events.push(StreamEvent::Head { stream, status, headers });
                }
                "DATA" => events.push(StreamEvent::Data {
                    stream,
                    data: Bytes::from(rest.to_string()),
                }),
                "END" => {
                    self.open.retain(|s| *s != stream);
                    events.push(StreamEvent::End { stream });
                }
                "RESET" => {
                    self.open.retain(|s| *s != stream);
                    events.push(StreamEvent::Reset {
                        stream,
                        error: NetworkError::new(smistatore_core::ErrorKind::RemoteHostClosed, "stream reset"),
                    });
                }
                _ => {
                    return Err(NetworkError::new(
                        smistatore_core::ErrorKind::ProtocolFailure,
                        format!("bad frame: {}", line),
                    ))
                }
            }
        }
        Ok(events)
    }

    fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }
}

pub struct LineMultiplexers {
    pub max_streams: usize,
    pub log: Rc<RefCell<MuxLog>>,
}

impl MultiplexerFactory for LineMultiplexers {
    fn create(&mut self) -> Box<dyn Multiplexer> {
        self.log.borrow_mut().created += 1;
        Box::new(LineMultiplexer {
            next_stream: 1,
            open: Vec::new(),
            max_streams: self.max_streams,
            outgoing: b"PREFACE\n".to_vec(),
            partial: Vec::new(),
            log: Rc::clone(&self.log),
        })
    }
}

/// Reply handler that records into a `ReplyBuffer`, logs its name when the reply
/// completes, and answers credential and redirect questions as configured.
pub struct Tracked {
    pub name: String,
    pub buffer: ReplyBuffer,
    pub order: Rc<RefCell<Vec<String>>>,
    pub credentials: Option<(String, String)>,
    pub proxy_credentials: Option<(String, String)>,
    pub auth_prompts: Rc<RefCell<usize>>,
    pub allow_redirects: bool,
}

impl ReplyHandler for Tracked {
    fn header_changed(&mut self, reply: &Reply) {
        self.buffer.header_changed(reply);
    }

    fn ready_read(&mut self, reply: &Reply, data: &[u8]) {
        self.buffer.ready_read(reply, data);
    }

    fn finished(&mut self, reply: &Reply) {
        self.buffer.finished(reply);
        self.order.borrow_mut().push(self.name.clone());
    }

    fn failed(&mut self, reply: &Reply, error: &NetworkError) {
        self.buffer.failed(reply, error);
        self.order.borrow_mut().push(format!("{}!", self.name));
    }

    fn authentication_required(&mut self, _reply: &Reply, auth: &mut Authenticator) {
        *self.auth_prompts.borrow_mut() += 1;
        if let Some((user, password)) = &self.credentials {
            auth.set_user(user);
            auth.set_password(password);
        }
    }

    fn proxy_authentication_required(&mut self, _reply: &Reply, auth: &mut Authenticator) {
        *self.auth_prompts.borrow_mut() += 1;
        if let Some((user, password)) = &self.proxy_credentials {
            auth.set_user(user);
            auth.set_password(password);
        }
    }

    fn redirected(&mut self, reply: &Reply, url: &Url) {
        self.buffer.redirected(reply, url);
    }

    fn redirect_allowed(&mut self, _reply: &Reply, _url: &Url) -> bool {
        self.allow_redirects
    }
}

pub struct Harness {
    pub conn: Connection,
    pub sockets: Vec<Rc<RefCell<SocketLog>>>,
    pub resolver: Rc<RefCell<ResolverLog>>,
    pub timers: Rc<RefCell<TimerLog>>,
    pub mux: Rc<RefCell<MuxLog>>,
    pub order: Rc<RefCell<Vec<String>>>,
    pub auth_prompts: Rc<RefCell<usize>>,
    base: String,
}

pub const HOST: &str = "192.0.2.10";

impl Harness {
    /// Plain HTTP to an IPv4 literal: no lookup, IPv4 decided up front.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::build(HOST, 80, false, config, None)
    }

    pub fn build(host: &str, port: u16, encrypted: bool, config: ConnectionConfig, max_streams: Option<usize>) -> Self {
        let sockets: Vec<_> = (0..config.channel_count)
            .map(|_| Rc::new(RefCell::new(SocketLog::default())))
            .collect();
        let resolver = Rc::new(RefCell::new(ResolverLog::default()));
        let timers = Rc::new(RefCell::new(TimerLog::default()));
        let mux = Rc::new(RefCell::new(MuxLog::default()));
        let multiplexers: Option<Box<dyn MultiplexerFactory>> = max_streams.map(|max_streams| {
            Box::new(LineMultiplexers {
                max_streams,
                log: Rc::clone(&mux),
            }) as Box<dyn MultiplexerFactory>
        });
        let collaborators = Collaborators {
            transports: Box::new(MockTransports {
                sockets: sockets.clone(),
            }),
            resolver: Box::new(MockResolver {
                log: Rc::clone(&resolver),
            }),
            timers: Box::new(MockTimers { log: Rc::clone(&timers) }),
            multiplexers,
        };
        let conn = Connection::new(host, port, encrypted, config, collaborators).unwrap();
        let scheme = if encrypted { "https" } else { "http" };
        let authority = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        Self {
            conn,
            sockets,
            resolver,
            timers,
            mux,
            order: Rc::new(RefCell::new(Vec::new())),
            auth_prompts: Rc::new(RefCell::new(0)),
            base: format!("{}://{}:{}", scheme, authority, port),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn request(&self, path: &str) -> RequestBuilder {
        RequestBuilder::get(&self.url(path)).unwrap()
    }

    pub fn handler(&self, name: &str) -> (Tracked, ReplyBuffer) {
        let buffer = ReplyBuffer::new();
        let handler = Tracked {
            name: name.to_string(),
            buffer: buffer.clone(),
            order: Rc::clone(&self.order),
            credentials: None,
            proxy_credentials: None,
            auth_prompts: Rc::clone(&self.auth_prompts),
            allow_redirects: false,
        };
        (handler, buffer)
    }

    pub fn submit(&mut self, name: &str, request: Request) -> (ReplyId, ReplyBuffer) {
        let (handler, buffer) = self.handler(name);
        let id = self.conn.submit(request, Box::new(handler));
        (id, buffer)
    }

    /// Plain GET with default options.
    pub fn get(&mut self, name: &str, path: &str) -> (ReplyId, ReplyBuffer) {
        let request = self.request(path).build();
        self.submit(name, request)
    }

    pub fn event(&mut self, event: Event) {
        self.conn.handle_event(event);
    }

    pub fn socket(&self, ch: usize) -> std::cell::Ref<'_, SocketLog> {
        self.sockets[ch].borrow()
    }

    pub fn connecting(&self, ch: usize) -> bool {
        self.socket(ch).state == SocketState::Connecting
    }

    /// Complete the TCP connect of channel `ch`.
    pub fn connect(&mut self, ch: usize) {
        self.connect_as(ch, NetworkLayer::IPv4);
    }

    pub fn connect_as(&mut self, ch: usize, family: NetworkLayer) {
        {
            let mut log = self.sockets[ch].borrow_mut();
            assert_eq!(log.state, SocketState::Connecting, "channel {} is not connecting", ch);
            log.state = SocketState::Connected;
            log.peer_family = Some(family);
        }
        self.event(Event::Connected(ChannelId(ch)));
    }

    /// Finish the TLS handshake of channel `ch`, agreeing on `alpn`.
    pub fn encrypt(&mut self, ch: usize, alpn: Option<&[u8]>) {
        self.sockets[ch].borrow_mut().alpn = alpn.map(<[u8]>::to_vec);
        self.event(Event::Encrypted(ChannelId(ch)));
    }

    /// Everything written on the current connection of `ch`.
    pub fn sent(&self, ch: usize) -> String {
        let log = self.socket(ch);
        log.sent
            .last()
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .unwrap_or_default()
    }

    /// Request lines written on the current connection of `ch`, in order.
    pub fn request_lines(&self, ch: usize) -> Vec<String> {
        self.sent(ch)
            .split("\r\n")
            .filter(|line| line.ends_with(" HTTP/1.1"))
            .map(str::to_string)
            .collect()
    }

    /// Bytes arrive from the server.
    pub fn respond(&mut self, ch: usize, data: &str) {
        self.sockets[ch].borrow_mut().inbound.extend(data.as_bytes());
        self.event(Event::ReadyRead(ChannelId(ch)));
    }

    /// The server closes the connection.
    pub fn peer_close(&mut self, ch: usize) {
        self.sockets[ch].borrow_mut().state = SocketState::Unconnected;
        self.event(Event::Error(ChannelId(ch), SocketError::RemoteHostClosed));
        self.event(Event::Disconnected(ChannelId(ch)));
    }

    pub fn fail_socket(&mut self, ch: usize, error: SocketError) {
        self.sockets[ch].borrow_mut().state = SocketState::Unconnected;
        self.event(Event::Error(ChannelId(ch), error));
    }

    pub fn resolve(&mut self, addrs: &[&str]) {
        let id = self.resolver.borrow_mut().pending.take().expect("no lookup pending");
        let ips: Vec<IpAddr> = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.event(Event::LookupFinished(id, Ok(ips)));
    }

    pub fn fire_timer(&mut self) {
        let token = *self.timers.borrow().active().last().expect("no timer running");
        self.event(Event::TimerFired(token));
    }

    pub fn order(&self) -> Vec<String> {
        self.order.borrow().clone()
    }
}

/// A complete HTTP/1.1 response with a Content-Length body.
pub fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nServer: test\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

pub fn single_channel() -> ConnectionConfig {
    ConnectionConfig {
        channel_count: 1,
        ..ConnectionConfig::default()
    }
}
