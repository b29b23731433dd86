/*
 * runtime.rs
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

//! Tokio adapter: real sockets, DNS and timers for a `Connection`.
//!
//! Every collaborator reports into one unbounded event channel. `Client` owns the
//! receiving end and feeds whatever has arrived into the connection in batches.
//! Socket I/O runs in one spawned task per connection attempt, driven by a command
//! channel; the transport handle shares received bytes and state with that task.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::{ConnectionConfig, ConnectionType, HttpProxy};
use crate::connection::{url_host, Connection};
use crate::error::{Error, Result, SocketError};
use crate::http::{ReplyHandler, ReplyId, Request};
use crate::net::{default_connector, ChannelStream};
use crate::transport::{
    ChannelId, Collaborators, Event, HostResolver, Lookup, LookupId, MultiplexerFactory, NetworkLayer,
    SocketState, TimerService, TimerToken, Transport, TransportFactory,
};

const READ_BUF: usize = 16 * 1024;
/// Longest CONNECT response head accepted from a proxy.
const MAX_TUNNEL_HEAD: usize = 8 * 1024;
const TUNNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection driven by tokio.
pub struct Client {
    connection: Connection,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Client {
    /// Must be called inside a tokio runtime.
    pub fn new(host: &str, port: u16, encrypted: bool, config: ConnectionConfig) -> Result<Self> {
        Self::build(host, port, encrypted, config, None)
    }

    /// Client whose multiplexed modes use streams from `multiplexers`.
    pub fn with_multiplexer(
        host: &str,
        port: u16,
        encrypted: bool,
        config: ConnectionConfig,
        multiplexers: Box<dyn MultiplexerFactory>,
    ) -> Result<Self> {
        Self::build(host, port, encrypted, config, Some(multiplexers))
    }

    /// Client for the origin of `url`.
    pub fn for_url(url: &Url, config: ConnectionConfig) -> Result<Self> {
        let encrypted = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };
        let host = url_host(url).ok_or_else(|| Error::MissingHost(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(if encrypted { 443 } else { 80 });
        Self::new(&host, port, encrypted, config)
    }

    fn build(
        host: &str,
        port: u16,
        encrypted: bool,
        config: ConnectionConfig,
        multiplexers: Option<Box<dyn MultiplexerFactory>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let offer_h2 = config.connection_type != ConnectionType::Http1;
        let collaborators = Collaborators {
            transports: Box::new(TokioTransportFactory {
                events: tx.clone(),
                offer_h2,
            }),
            resolver: Box::new(TokioResolver::new(tx.clone())),
            timers: Box::new(TokioTimers::new(tx)),
            multiplexers,
        };
        let connection = Connection::new(host, port, encrypted, config, collaborators)?;
        Ok(Self { connection, events: rx })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn submit(&mut self, request: Request, handler: Box<dyn ReplyHandler>) -> ReplyId {
        self.connection.submit(request, handler)
    }

    pub fn remove_reply(&mut self, id: ReplyId) {
        self.connection.remove_reply(id);
    }

    /// Process events until every submitted reply has its outcome.
    pub async fn run_until_idle(&mut self) {
        while self.connection.has_pending_replies() {
            let Some(first) = self.events.recv().await else {
                warn!("event channel closed with replies pending");
                break;
            };
            let mut batch = vec![first];
            while let Ok(event) = self.events.try_recv() {
                batch.push(event);
            }
            trace!(events = batch.len(), "processing events");
            self.connection.handle_events(batch);
        }
    }
}

struct TokioTransportFactory {
    events: mpsc::UnboundedSender<Event>,
    offer_h2: bool,
}

impl TransportFactory for TokioTransportFactory {
    fn create(&mut self, channel: ChannelId, encrypted: bool) -> Box<dyn Transport> {
        Box::new(TokioTransport::new(channel, encrypted, self.offer_h2, self.events.clone()))
    }
}

enum Command {
    Write(Bytes),
    Close,
    Abort,
}

/// State shared between a transport handle and its I/O task.
#[derive(Default)]
struct Shared {
    /// Bumped on every connect and abort; tasks of older attempts go quiet.
    generation: u64,
    state: Option<SocketState>,
    inbound: BytesMut,
    pending_write: usize,
    peer_family: Option<NetworkLayer>,
    alpn: Option<Vec<u8>>,
    error: String,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// TCP (and TLS) transport. Certificate problems are reported as
/// `SocketError::SslHandshakeFailed`; there is no interactive override.
pub struct TokioTransport {
    channel: ChannelId,
    encrypted: bool,
    offer_h2: bool,
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Mutex<Shared>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    proxy: Option<HttpProxy>,
}

impl TokioTransport {
    pub fn new(channel: ChannelId, encrypted: bool, offer_h2: bool, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            channel,
            encrypted,
            offer_h2,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            commands: None,
            proxy: None,
        }
    }

    fn stop(&mut self, command: Command) {
        {
            let mut s = lock(&self.shared);
            s.generation += 1;
            s.state = None;
            s.inbound.clear();
            s.pending_write = 0;
        }
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(command);
        }
    }
}

impl Transport for TokioTransport {
    fn connect(&mut self, host: &str, port: u16, preference: NetworkLayer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut s = lock(&self.shared);
            s.generation += 1;
            s.state = Some(SocketState::Connecting);
            s.inbound.clear();
            s.pending_write = 0;
            s.peer_family = None;
            s.alpn = None;
            s.error.clear();
            s.generation
        };
        if let Some(old) = self.commands.replace(tx) {
            let _ = old.send(Command::Abort);
        }
        let link = Link {
            shared: Arc::clone(&self.shared),
            generation,
            channel: self.channel,
            events: self.events.clone(),
        };
        let connector = self.encrypted.then(|| default_connector(self.offer_h2));
        debug!(
            channel = %self.channel,
            %host,
            port,
            ?preference,
            encrypted = self.encrypted,
            tunnel = self.proxy.is_some(),
            "socket connecting"
        );
        let target = Target {
            host: host.to_string(),
            port,
            preference,
            proxy: self.proxy.clone(),
        };
        tokio::spawn(run_channel(link, target, connector, rx));
    }

    fn set_proxy(&mut self, proxy: Option<HttpProxy>) {
        self.proxy = proxy;
    }

    fn state(&self) -> SocketState {
        lock(&self.shared).state.unwrap_or(SocketState::Unconnected)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(commands) = self.commands.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket not connected"));
        };
        let mut s = lock(&self.shared);
        if s.state != Some(SocketState::Connected) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket not connected"));
        }
        commands
            .send(Command::Write(Bytes::copy_from_slice(data)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "socket task gone"))?;
        s.pending_write += data.len();
        Ok(data.len())
    }

    fn bytes_to_write(&self) -> usize {
        lock(&self.shared).pending_write
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut s = lock(&self.shared);
        let n = buf.len().min(s.inbound.len());
        buf[..n].copy_from_slice(&s.inbound[..n]);
        s.inbound.advance(n);
        n
    }

    fn bytes_available(&self) -> usize {
        lock(&self.shared).inbound.len()
    }

    fn close(&mut self) {
        let flushing = {
            let mut s = lock(&self.shared);
            match s.state {
                None | Some(SocketState::Unconnected) => return,
                Some(SocketState::Connected) if s.pending_write > 0 => {
                    s.state = Some(SocketState::Closing);
                    true
                }
                _ => false,
            }
        };
        if flushing {
            if let Some(commands) = self.commands.take() {
                let _ = commands.send(Command::Close);
            }
        } else {
            self.stop(Command::Close);
        }
    }

    fn abort(&mut self) {
        self.stop(Command::Abort);
    }

    fn peer_family(&self) -> Option<NetworkLayer> {
        lock(&self.shared).peer_family
    }

    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        lock(&self.shared).alpn.clone()
    }

    fn ignore_ssl_errors(&mut self) {}

    fn error_string(&self) -> String {
        lock(&self.shared).error.clone()
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.stop(Command::Abort);
    }
}

/// The I/O task's view of its transport.
struct Link {
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    channel: ChannelId,
    events: mpsc::UnboundedSender<Event>,
}

impl Link {
    /// Apply `f` and send its event, unless the transport has moved on. Returns false
    /// when this task is stale.
    fn update(&self, f: impl FnOnce(&mut Shared) -> Option<Event>) -> bool {
        let mut s = lock(&self.shared);
        if s.generation != self.generation {
            return false;
        }
        if let Some(event) = f(&mut s) {
            let _ = self.events.send(event);
        }
        true
    }

    fn fail(&self, error: SocketError, detail: String) {
        let channel = self.channel;
        self.update(|s| {
            s.state = Some(SocketState::Unconnected);
            s.error = detail;
            Some(Event::Error(channel, error))
        });
    }

    /// End of stream from the peer: an error for whoever is waiting, then the disconnect.
    fn peer_closed(&self) {
        let mut s = lock(&self.shared);
        if s.generation != self.generation {
            return;
        }
        s.state = Some(SocketState::Unconnected);
        s.error = "Connection closed".to_string();
        let _ = self.events.send(Event::Error(self.channel, SocketError::RemoteHostClosed));
        let _ = self.events.send(Event::Disconnected(self.channel));
    }

    fn disconnected(&self) {
        let channel = self.channel;
        self.update(|s| {
            s.state = Some(SocketState::Unconnected);
            Some(Event::Disconnected(channel))
        });
    }
}

async fn connect_tcp(host: &str, port: u16, preference: NetworkLayer) -> std::result::Result<TcpStream, (SocketError, String)> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| (SocketError::HostNotFound, e.to_string()))?
        .filter(|addr| preference.accepts(&addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err((SocketError::HostNotFound, format!("no usable address for {}", host)));
    }
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last = Some(e);
            }
        }
    }
    let e = last.unwrap_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
    Err((SocketError::from_io(&e), e.to_string()))
}

/// CONNECT request opening a tunnel to `host:port`. Credentials go out as Basic.
fn tunnel_request(proxy: &HttpProxy, host: &str, port: u16) -> String {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut head = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
        authority, authority
    );
    if !proxy.user.is_empty() {
        let token = BASE64.encode(format!("{}:{}", proxy.user, proxy.password));
        head.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    head.push_str("\r\n");
    head
}

/// Map the proxy's answer to a CONNECT onto success or a socket error.
fn tunnel_outcome(head: &[u8]) -> std::result::Result<(), (SocketError, String)> {
    let head = String::from_utf8_lossy(head);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line
        .strip_prefix("HTTP/1.")
        .and_then(|rest| rest.get(2..5))
        .and_then(|code| code.parse::<u16>().ok());
    match status {
        Some(200..=299) => Ok(()),
        Some(407) => Err((
            SocketError::ProxyAuthenticationRequired,
            "Proxy requires authentication".to_string(),
        )),
        Some(code) => Err((
            SocketError::Other(format!("proxy refused the tunnel ({})", code)),
            status_line.to_string(),
        )),
        None => Err((
            SocketError::Other("malformed proxy response".to_string()),
            status_line.to_string(),
        )),
    }
}

/// Ask the proxy at the other end of `tcp` for a tunnel to `host:port`.
async fn open_tunnel(
    tcp: &mut TcpStream,
    proxy: &HttpProxy,
    host: &str,
    port: u16,
) -> std::result::Result<(), (SocketError, String)> {
    let closed = |e: io::Error| (SocketError::ProxyConnectionClosed, e.to_string());
    tcp.write_all(tunnel_request(proxy, host, port).as_bytes())
        .await
        .map_err(closed)?;
    // byte at a time: nothing past the head may be consumed before TLS starts
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_TUNNEL_HEAD {
            return Err((
                SocketError::Other("proxy response head too long".to_string()),
                String::new(),
            ));
        }
        match tcp.read(&mut byte).await.map_err(closed)? {
            0 => {
                return Err((
                    SocketError::ProxyConnectionClosed,
                    "Proxy closed the connection".to_string(),
                ))
            }
            _ => head.push(byte[0]),
        }
    }
    tunnel_outcome(&head)
}

/// What a connection attempt reaches, and through which proxy.
struct Target {
    host: String,
    port: u16,
    preference: NetworkLayer,
    proxy: Option<HttpProxy>,
}

async fn run_channel(
    link: Link,
    target: Target,
    connector: Option<TlsConnector>,
    commands: mpsc::UnboundedReceiver<Command>,
) {
    let channel = link.channel;
    let Target {
        host,
        port,
        preference,
        proxy,
    } = target;
    let first_hop = match &proxy {
        Some(proxy) => connect_tcp(&proxy.host, proxy.port, preference).await,
        None => connect_tcp(&host, port, preference).await,
    };
    let mut tcp = match first_hop {
        Ok(tcp) => tcp,
        Err((error, detail)) => {
            link.fail(error, detail);
            return;
        }
    };
    if let Some(proxy) = &proxy {
        trace!(channel = %channel, proxy = %proxy.host, %host, port, "opening tunnel");
        let tunnel = match tokio::time::timeout(TUNNEL_TIMEOUT, open_tunnel(&mut tcp, proxy, &host, port)).await {
            Ok(result) => result,
            Err(_) => Err((
                SocketError::ProxyConnectionTimeout,
                "Proxy did not answer in time".to_string(),
            )),
        };
        if let Err((error, detail)) = tunnel {
            link.fail(error, detail);
            return;
        }
    }
    let _ = tcp.set_nodelay(true);
    let family = tcp.peer_addr().ok().map(|addr| NetworkLayer::of(&addr.ip()));
    let connected = link.update(|s| {
        s.state = Some(SocketState::Connected);
        s.peer_family = family;
        Some(Event::Connected(channel))
    });
    if !connected {
        return;
    }

    let stream = match connector {
        Some(connector) => match ChannelStream::upgrade(tcp, &host, &connector).await {
            Ok(stream) => {
                let alpn = stream.alpn_protocol();
                let current = link.update(|s| {
                    s.alpn = alpn;
                    Some(Event::Encrypted(channel))
                });
                if !current {
                    return;
                }
                stream
            }
            Err(e) => {
                link.fail(SocketError::SslHandshakeFailed, e.to_string());
                return;
            }
        },
        None => ChannelStream::Plain(tcp),
    };
    pump(link, stream, commands).await;
}

/// Move bytes both ways until the peer or the transport handle ends the connection.
async fn pump(link: Link, mut stream: ChannelStream, mut commands: mpsc::UnboundedReceiver<Command>) {
    let channel = link.channel;
    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    trace!(channel = %channel, "peer closed the connection");
                    link.peer_closed();
                    return;
                }
                Ok(n) => {
                    let data = &buf[..n];
                    if !link.update(|s| {
                        s.inbound.extend_from_slice(data);
                        Some(Event::ReadyRead(channel))
                    }) {
                        return;
                    }
                }
                Err(e) => {
                    link.fail(SocketError::from_io(&e), e.to_string());
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Write(data)) => {
                    let written = async {
                        stream.write_all(&data).await?;
                        stream.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        link.fail(SocketError::from_io(&e), e.to_string());
                        return;
                    }
                    let len = data.len();
                    if !link.update(|s| {
                        s.pending_write = s.pending_write.saturating_sub(len);
                        Some(Event::BytesWritten(channel, len))
                    }) {
                        return;
                    }
                }
                Some(Command::Close) => {
                    let _ = stream.shutdown().await;
                    link.disconnected();
                    return;
                }
                Some(Command::Abort) | None => return,
            },
        }
    }
}

/// Name resolution through `tokio::net::lookup_host`. IP literals answer at once.
pub struct TokioResolver {
    events: mpsc::UnboundedSender<Event>,
    next_id: u64,
    lookups: HashMap<u64, JoinHandle<()>>,
}

impl TokioResolver {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            next_id: 1,
            lookups: HashMap::new(),
        }
    }
}

impl HostResolver for TokioResolver {
    fn lookup(&mut self, host: &str) -> Lookup {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Lookup::Ready(Ok(vec![ip]));
        }
        self.lookups.retain(|_, handle| !handle.is_finished());
        let id = self.next_id;
        self.next_id += 1;
        let events = self.events.clone();
        let host = host.to_string();
        let handle = tokio::spawn(async move {
            let result = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => {
                    let mut ips: Vec<IpAddr> = Vec::new();
                    for addr in addrs {
                        if !ips.contains(&addr.ip()) {
                            ips.push(addr.ip());
                        }
                    }
                    if ips.is_empty() {
                        Err(format!("Host {} not found", host))
                    } else {
                        Ok(ips)
                    }
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(Event::LookupFinished(LookupId(id), result));
        });
        self.lookups.insert(id, handle);
        Lookup::Pending(LookupId(id))
    }

    fn abort(&mut self, id: LookupId) {
        if let Some(handle) = self.lookups.remove(&id.0) {
            handle.abort();
        }
    }
}

/// Timers on `tokio::time::sleep`.
pub struct TokioTimers {
    events: mpsc::UnboundedSender<Event>,
    next_token: u64,
    timers: HashMap<u64, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            next_token: 1,
            timers: HashMap::new(),
        }
    }
}

impl TimerService for TokioTimers {
    fn start(&mut self, delay: Duration) -> TimerToken {
        self.timers.retain(|_, handle| !handle.is_finished());
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::TimerFired(token));
        });
        self.timers.insert(token.0, handle);
        token
    }

    fn cancel(&mut self, token: TimerToken) {
        if let Some(handle) = self.timers.remove(&token.0) {
            handle.abort();
        }
    }
}
