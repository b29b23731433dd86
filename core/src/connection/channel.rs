/*
 * channel.rs
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

//! One physical connection and the HTTP/1.1 engine that drives it: writing the
//! request head and upload body, parsing the response, pipelining, and recovering
//! from closed or broken sockets.

use std::collections::{HashMap, VecDeque};
use std::io;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::queue::MessagePair;
use super::run_queue::Task;
use super::Connection;
use crate::auth::Authenticator;
use crate::error::{ErrorKind, NetworkError, SocketError};
use crate::http::h1::{request_head, BodyMode, ParseState, ResponseParser};
use crate::http::{Method, ReplyId, Request};
use crate::transport::{ChannelId, Multiplexer, NetworkLayer, SocketState, Transport};

/// Stop writing upload data while the transport holds more than this unsent.
const SOCKET_BUFFER_FILL: usize = 32 * 1024;
/// Largest piece of upload data written at once.
const UPLOAD_CHUNK: usize = 16 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Protocol state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    /// Request head written, upload body in progress.
    Writing,
    /// Request fully written, no response bytes yet.
    Waiting,
    Reading,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeliningSupport {
    Unknown,
    ProbablySupported,
}

pub(crate) struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) socket: Box<dyn Transport>,
    pub(crate) state: ChannelState,
    pub(crate) current: Option<MessagePair>,
    /// Written ahead of `current`; responses arrive in this order.
    pub(crate) pipelined: VecDeque<MessagePair>,
    pipeline_buf: Vec<u8>,
    pub(crate) resend_current: bool,
    /// Connected but the TLS handshake has not finished.
    pub(crate) pending_encrypt: bool,
    pub(crate) pipelining: PipeliningSupport,
    pub(crate) reconnect_attempts: u32,
    pub(crate) last_status: u16,
    pub(crate) authenticator: Authenticator,
    pub(crate) proxy_authenticator: Authenticator,
    pub(crate) credentials_sent: bool,
    pub(crate) proxy_credentials_sent: bool,
    pub(crate) preference: NetworkLayer,
    written: u64,
    bytes_total: u64,
    pub(crate) read_buf: BytesMut,
    pub(crate) parser: ResponseParser,
    pub(crate) multiplexer: Option<Box<dyn Multiplexer>>,
    /// In-flight streams of a multiplexed channel.
    pub(crate) streams: HashMap<u32, MessagePair>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, socket: Box<dyn Transport>, reconnect_attempts: u32) -> Self {
        Self {
            id,
            socket,
            state: ChannelState::Idle,
            current: None,
            pipelined: VecDeque::new(),
            pipeline_buf: Vec::new(),
            resend_current: false,
            pending_encrypt: false,
            pipelining: PipeliningSupport::Unknown,
            reconnect_attempts,
            last_status: 0,
            authenticator: Authenticator::new(),
            proxy_authenticator: Authenticator::new(),
            credentials_sent: false,
            proxy_credentials_sent: false,
            preference: NetworkLayer::Any,
            written: 0,
            bytes_total: 0,
            read_buf: BytesMut::new(),
            parser: ResponseParser::new(),
            multiplexer: None,
            streams: HashMap::new(),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state != ChannelState::Idle
    }

    pub(crate) fn current_reply(&self) -> Option<ReplyId> {
        self.current.as_ref().map(|pair| pair.reply)
    }

    fn is_waiting_or_reading(&self) -> bool {
        matches!(self.state, ChannelState::Waiting | ChannelState::Reading)
    }

    /// Response bytes not yet parsed, buffered or still in the transport.
    pub(crate) fn has_unread(&self) -> bool {
        !self.read_buf.is_empty() || self.socket.bytes_available() > 0
    }

    /// Move everything the transport holds into the read buffer.
    pub(crate) fn read_available(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let available = self.socket.bytes_available();
            if available == 0 {
                break;
            }
            let n = self.socket.read(&mut chunk[..available.min(READ_CHUNK)]);
            if n == 0 {
                break;
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether either authenticator holds credentials. Pipelining is off then.
    fn has_credentials(&self) -> bool {
        !self.authenticator.user().is_empty()
            || !self.authenticator.password().is_empty()
            || !self.proxy_authenticator.user().is_empty()
            || !self.proxy_authenticator.password().is_empty()
    }

    /// Add Authorization and Proxy-Authorization headers for `request`.
    pub(crate) fn authorize(&mut self, request: &mut Request) {
        // A header computed for an earlier challenge stays on a requeued request
        // and is sent as is; only a fresh 401 recomputes it.
        if self.authenticator.has_method()
            && ((!self.authenticator.is_negotiating_method() && request.header("authorization").is_none())
                || self.last_status == 401)
        {
            let method = request.method().as_str().to_string();
            if let Some(value) = self.authenticator.calculate_response(&method, &request.uri()) {
                request.set_header("Authorization", &value);
                self.credentials_sent = true;
            }
        }
        if self.proxy_authenticator.has_method()
            && !(self.proxy_authenticator.is_negotiating_method() && self.last_status != 407)
        {
            let method = request.method().as_str().to_string();
            if let Some(value) = self.proxy_authenticator.calculate_response(&method, &request.uri()) {
                request.set_header("Proxy-Authorization", &value);
                self.proxy_credentials_sent = true;
            }
        }
    }

    /// Queue the head of a pipelined GET; `pipeline_flush` writes them in one go.
    fn pipeline_into(&mut self, pair: MessagePair, through_proxy: bool) {
        self.pipeline_buf.extend_from_slice(&request_head(&pair.request, through_proxy));
        self.pipelined.push_back(pair);
    }

    fn pipeline_flush(&mut self) -> io::Result<()> {
        if self.pipeline_buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.pipeline_buf);
        self.socket.write(&buf)?;
        Ok(())
    }
}

impl Connection {
    /// Make sure `ch` has a usable connection. Returns true when the request can be
    /// written now; otherwise a connection attempt is under way.
    pub(super) fn ensure_connection(&mut self, ch: ChannelId) -> bool {
        let encrypted = self.encrypted;
        let (host, port) = self.endpoint();
        let tunnel = self.tunnel_for(ch);
        let chan = &mut self.channels[ch.0];
        match chan.socket.state() {
            SocketState::Closing => {
                // wait for the disconnect, then resend
                if chan.current.is_some() {
                    chan.resend_current = true;
                }
                false
            }
            SocketState::HostLookup | SocketState::Connecting => false,
            SocketState::Unconnected => {
                debug!(channel = %ch, preference = ?chan.preference, %host, port, "connecting");
                chan.state = ChannelState::Connecting;
                chan.pending_encrypt = encrypted;
                chan.pipelining = PipeliningSupport::Unknown;
                chan.credentials_sent = false;
                chan.proxy_credentials_sent = false;
                chan.authenticator.reset_for_connection();
                chan.proxy_authenticator.reset_for_connection();
                chan.read_buf.clear();
                chan.parser.reset();
                chan.multiplexer = None;
                chan.socket.set_proxy(tunnel);
                chan.socket.connect(&host, port, chan.preference);
                false
            }
            SocketState::Connected => !chan.pending_encrypt,
        }
    }

    pub(super) fn close(&mut self, ch: ChannelId) {
        self.shutdown(ch, false);
    }

    pub(super) fn abort(&mut self, ch: ChannelId) {
        self.shutdown(ch, true);
    }

    fn shutdown(&mut self, ch: ChannelId, abort: bool) {
        let chan = &mut self.channels[ch.0];
        chan.state = if chan.socket.state() == SocketState::Unconnected {
            ChannelState::Idle
        } else {
            ChannelState::Closing
        };
        chan.pending_encrypt = false;
        chan.read_buf.clear();
        chan.pipeline_buf.clear();
        chan.parser.reset();
        chan.multiplexer = None;
        if abort {
            chan.socket.abort();
        } else {
            chan.socket.close();
        }
        // the transport may finish closing right away; no disconnect follows then
        if chan.state == ChannelState::Closing && chan.socket.state() == SocketState::Unconnected {
            chan.state = ChannelState::Idle;
            self.run_queue.schedule(Task::StartNextRequest);
        }
    }

    /// Write the current request, continue its upload, or look for its response.
    /// Returns false when nothing could be sent.
    pub(super) fn send_request(&mut self, ch: ChannelId) -> bool {
        let Some(reply_id) = self.channels[ch.0].current_reply() else {
            return false;
        };
        match self.channels[ch.0].state {
            ChannelState::Idle => {
                if !self.ensure_connection(ch) {
                    return false;
                }
                let chan = &mut self.channels[ch.0];
                if chan.current.as_ref().map_or(false, |pair| pair.request.is_pre_connect()) {
                    debug!(channel = %ch, reply = %reply_id, "pre-connect request done");
                    chan.current = None;
                    chan.state = ChannelState::Idle;
                    self.finish_reply(reply_id);
                    self.run_queue.schedule(Task::StartNextRequest);
                    return true;
                }
                self.write_head(ch, reply_id)
            }
            ChannelState::Writing => self.write_upload(ch, reply_id),
            ChannelState::Waiting => {
                if self.channels[ch.0].has_unread() {
                    self.run_queue.schedule(Task::ReceiveReply(ch));
                }
                true
            }
            _ => true,
        }
    }

    fn write_head(&mut self, ch: ChannelId, reply_id: ReplyId) -> bool {
        let chan = &mut self.channels[ch.0];
        let Some(mut pair) = chan.current.take() else {
            return false;
        };
        chan.written = 0;
        chan.bytes_total = 0;
        chan.parser.reset();

        let mut credentials_changed = false;
        if pair.request.with_credentials() && pair.request.has_userinfo() {
            if let Some((user, password)) = pair.request.take_userinfo() {
                let auth = &mut chan.authenticator;
                if auth.user() != user || (!password.is_empty() && auth.password() != password) {
                    auth.set_user(&user);
                    auth.set_password(&password);
                    credentials_changed = true;
                }
            }
        }
        if pair.request.with_credentials() {
            chan.authorize(&mut pair.request);
        }
        if let Some(slot) = self.replies.get_mut(&reply_id) {
            slot.reply.set_url(pair.request.url().clone());
            slot.reply.prepare_for_send(ch, pair.request.auto_decompress(), false);
        }

        let head = request_head(&pair.request, self.through_cache_proxy());
        let has_body = pair.request.has_body();
        let total = pair.request.content_length().unwrap_or(0);
        let chan = &mut self.channels[ch.0];
        chan.current = Some(pair);
        if credentials_changed {
            self.copy_credentials(ch, false);
        }

        let chan = &mut self.channels[ch.0];
        if let Err(e) = chan.socket.write(&head) {
            warn!(channel = %ch, reply = %reply_id, error = %e, "writing request head failed");
            self.emit_reply_error(ch, NetworkError::new(ErrorKind::Unspecified, e.to_string()));
            return false;
        }
        trace!(channel = %ch, reply = %reply_id, bytes = head.len(), "request head written");
        if has_body && total > 0 {
            chan.bytes_total = total;
            chan.state = ChannelState::Writing;
        } else {
            chan.state = ChannelState::Waiting;
        }
        self.send_request(ch)
    }

    /// Copy upload data to the transport until it is full or the body is done.
    fn write_upload(&mut self, ch: ChannelId, reply_id: ReplyId) -> bool {
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        loop {
            let chan = &mut self.channels[ch.0];
            if chan.written >= chan.bytes_total {
                chan.state = ChannelState::Waiting;
                return self.send_request(ch);
            }
            if chan.socket.bytes_to_write() > SOCKET_BUFFER_FILL {
                return true;
            }
            let want = (chan.bytes_total - chan.written).min(UPLOAD_CHUNK as u64) as usize;
            let Some(body) = chan.current.as_mut().and_then(|pair| pair.request.body_mut()) else {
                chan.state = ChannelState::Waiting;
                return self.send_request(ch);
            };
            let read = match body.read(&mut buf[..want]) {
                Ok(0) => {
                    let e = NetworkError::new(
                        ErrorKind::Unspecified,
                        "Upload body ended before its announced content length",
                    );
                    self.emit_reply_error(ch, e);
                    return false;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    self.emit_reply_error(ch, NetworkError::new(ErrorKind::Unspecified, e.to_string()));
                    return false;
                }
            };
            if let Err(e) = chan.socket.write(&buf[..read]) {
                self.emit_reply_error(ch, NetworkError::new(ErrorKind::Unspecified, e.to_string()));
                return false;
            }
            chan.written += read as u64;
            let (written, total) = (chan.written, chan.bytes_total);
            trace!(channel = %ch, written, total, "upload progress");
            if let Some(slot) = self.replies.get_mut(&reply_id) {
                slot.handler.upload_progress(&slot.reply, written, total);
            }
        }
    }

    /// Parse whatever response bytes have arrived for the current reply.
    pub(super) fn receive_reply(&mut self, ch: ChannelId) {
        let Some(mut reply_id) = self.channels[ch.0].current_reply() else {
            let chan = &mut self.channels[ch.0];
            chan.read_available();
            if !chan.read_buf.is_empty() {
                warn!(channel = %ch, bytes = chan.read_buf.len(), "data received without a request");
                self.close(ch);
            }
            return;
        };

        {
            let chan = &mut self.channels[ch.0];
            if chan.socket.state() == SocketState::Unconnected && !chan.has_unread() {
                match chan.parser.state() {
                    ParseState::UntilClose | ParseState::Idle => {
                        chan.parser.finish_at_close();
                        self.all_done(ch);
                    }
                    ParseState::StatusLine | ParseState::Headers | ParseState::HeadersComplete => {
                        self.handle_unexpected_eof(ch);
                    }
                    _ => {
                        // truncated body
                        let error = NetworkError::with_default_detail(ErrorKind::RemoteHostClosed, &self.host);
                        self.emit_reply_error(ch, error);
                    }
                }
                return;
            }
            chan.read_available();
        }

        loop {
            let chan = &mut self.channels[ch.0];
            let Some(slot) = self.replies.get_mut(&reply_id) else {
                warn!(channel = %ch, reply = %reply_id, "reply vanished while reading");
                chan.current = None;
                self.close(ch);
                return;
            };
            if let Err(e) = chan.parser.receive(&mut chan.read_buf, slot) {
                warn!(channel = %ch, reply = %reply_id, error = e.0, "malformed response");
                let error = NetworkError::new(ErrorKind::ProtocolFailure, format!("Data corrupted: {}", e.0));
                self.emit_reply_error(ch, error);
                return;
            }
            if let Some(message) = slot.reply.take_decode_error() {
                let error = NetworkError::new(ErrorKind::ProtocolFailure, format!("Data corrupted: {}", message));
                self.emit_reply_error(ch, error);
                return;
            }
            match chan.parser.state() {
                ParseState::HeadersComplete => {
                    chan.last_status = slot.reply.status();
                    if slot.reply.is_interim() {
                        trace!(channel = %ch, status = slot.reply.status(), "skipping interim response");
                        slot.reply.clear();
                        chan.parser.reset();
                        continue;
                    }
                    let follows = chan
                        .current
                        .as_ref()
                        .map_or(false, |pair| pair.request.redirect_policy() != crate::http::RedirectPolicy::Manual);
                    slot.reply.headers_complete(follows);
                    slot.announce_head();
                    chan.parser.set_body_mode(slot.reply.body_mode());
                }
                ParseState::Idle => {
                    self.all_done(ch);
                    let chan = &self.channels[ch.0];
                    match chan.current_reply() {
                        Some(next) if next != reply_id && !chan.read_buf.is_empty() => reply_id = next,
                        _ => return,
                    }
                }
                _ => return,
            }
        }
    }

    /// The current response is complete.
    pub(super) fn all_done(&mut self, ch: ChannelId) {
        let Some(reply_id) = self.channels[ch.0].current_reply() else {
            return;
        };
        let (emit_finished, connection_close) = match self.replies.get(&reply_id) {
            Some(slot) => (slot.reply.should_emit_signals(), slot.reply.is_connection_close_enabled()),
            None => (false, true),
        };
        self.detect_pipelining_support(ch);
        self.handle_status(ch);

        let still_current = self.channels[ch.0].current_reply() == Some(reply_id);
        if emit_finished && still_current && !self.channels[ch.0].resend_current {
            self.finish_reply(reply_id);
        }

        let attempts = self.config.reconnect_attempts;
        let chan = &mut self.channels[ch.0];
        chan.reconnect_attempts = attempts;
        if chan.state != ChannelState::Closing {
            chan.state = ChannelState::Idle;
        }
        if !chan.resend_current && chan.current_reply() == Some(reply_id) {
            chan.current = None;
        }
        chan.parser.reset();

        if !chan.pipelined.is_empty() {
            if chan.resend_current || connection_close || chan.socket.state() != SocketState::Connected {
                self.requeue_pipelined(ch);
                self.close(ch);
            } else {
                let next = chan.pipelined.pop_front();
                debug!(channel = %ch, reply = ?next.as_ref().map(|p| p.reply), "next pipelined response");
                chan.current = next;
                chan.state = ChannelState::Reading;
                chan.resend_current = false;
                chan.written = 0;
                chan.bytes_total = 0;
                self.fill_pipeline(ch);
            }
        } else if chan.has_unread() {
            warn!(channel = %ch, "unexpected bytes after the response, closing");
            self.close(ch);
            self.run_queue.schedule(Task::StartNextRequest);
        } else {
            if connection_close && chan.socket.state() != SocketState::Unconnected {
                self.close(ch);
            }
            self.run_queue.schedule(Task::StartNextRequest);
        }
    }

    fn detect_pipelining_support(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        let Some(slot) = chan.current_reply().and_then(|id| self.replies.get(&id)) else {
            return;
        };
        let reply = &slot.reply;
        let server = reply.header("server").unwrap_or("");
        let supported = reply.version() == (1, 1)
            && !reply.is_connection_close_enabled()
            && chan.socket.state() == SocketState::Connected
            && !server.contains("Microsoft-IIS/4.")
            && !server.contains("Microsoft-IIS/5.")
            && !server.contains("Netscape-Enterprise/3.")
            && !server.contains("WebLogic")
            && !server.starts_with("Rocket");
        chan.pipelining = if supported {
            PipeliningSupport::ProbablySupported
        } else {
            PipeliningSupport::Unknown
        };
    }

    fn handle_status(&mut self, ch: ChannelId) {
        let Some(reply_id) = self.channels[ch.0].current_reply() else {
            return;
        };
        let status = self.replies.get(&reply_id).map_or(0, |slot| slot.reply.status());
        match status {
            301 | 302 | 303 | 305 | 307 | 308 => self.handle_redirect(ch, reply_id, status),
            401 | 407 => {
                let is_proxy = status == 407;
                match self.handle_authenticate_challenge(ch, is_proxy) {
                    Some(true) => {
                        if !self.reset_upload_data(ch) {
                            return;
                        }
                        if let Some(slot) = self.replies.get_mut(&reply_id) {
                            slot.reply.clear();
                        }
                        if self.channels[ch.0].pipelined.is_empty() {
                            // resend on the same connection
                            self.channels[ch.0].resend_current = true;
                            self.run_queue.schedule(Task::StartNextRequest);
                        } else {
                            self.close_and_resend_current_request(ch);
                        }
                    }
                    Some(false) => self.close(ch),
                    None => {
                        let kind = if is_proxy {
                            ErrorKind::ProxyAuthenticationRequired
                        } else {
                            ErrorKind::AuthenticationRequired
                        };
                        if let Some(slot) = self.replies.get_mut(&reply_id) {
                            slot.flush_deferred();
                        }
                        let error = NetworkError::with_default_detail(kind, &self.host);
                        self.fail_reply(reply_id, error);
                    }
                }
            }
            _ => {
                let chan = &mut self.channels[ch.0];
                if chan.authenticator.awaiting_server_final() {
                    let info = self
                        .replies
                        .get(&reply_id)
                        .and_then(|slot| slot.reply.header("authentication-info"))
                        .map(str::to_string);
                    if let Err(e) = chan.authenticator.complete_exchange(info.as_deref()) {
                        warn!(channel = %ch, reply = %reply_id, error = %e, "server authentication failed");
                        self.emit_reply_error(ch, NetworkError::new(ErrorKind::AuthenticationRequired, e.to_string()));
                        return;
                    }
                }
                self.run_queue.schedule(Task::StartNextRequest);
            }
        }
    }

    /// Rewind the upload body of the current request.
    pub(super) fn reset_upload_data(&mut self, ch: ChannelId) -> bool {
        let chan = &mut self.channels[ch.0];
        let Some(pair) = chan.current.as_mut() else {
            return false;
        };
        if pair.request.reset_body() {
            chan.written = 0;
            true
        } else {
            let error = NetworkError::new(
                ErrorKind::Unspecified,
                "Cannot resend the request: its upload body cannot be rewound",
            );
            self.emit_reply_error(ch, error);
            false
        }
    }

    /// Put pipelined-but-unanswered requests back into the queue.
    pub(super) fn requeue_pipelined(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        if chan.pipelined.is_empty() {
            return;
        }
        let pairs = std::mem::take(&mut chan.pipelined);
        chan.pipeline_buf.clear();
        debug!(channel = %ch, count = pairs.len(), "requeueing pipelined requests");
        for pair in &pairs {
            if let Some(slot) = self.replies.get_mut(&pair.reply) {
                slot.reply.channel = None;
            }
        }
        self.queue.requeue_all(pairs.into_iter());
        self.run_queue.schedule(Task::StartNextRequest);
    }

    pub(super) fn resend_current_request(&mut self, ch: ChannelId) {
        self.requeue_pipelined(ch);
        let chan = &mut self.channels[ch.0];
        if chan.current.is_some() {
            chan.resend_current = true;
        }
        if chan.socket.state() == SocketState::Unconnected {
            chan.state = ChannelState::Idle;
            chan.pending_encrypt = false;
        } else {
            self.close(ch);
        }
        self.run_queue.schedule(Task::StartNextRequest);
    }

    pub(super) fn close_and_resend_current_request(&mut self, ch: ChannelId) {
        self.requeue_pipelined(ch);
        self.close(ch);
        let chan = &mut self.channels[ch.0];
        if chan.current.is_some() {
            chan.resend_current = true;
        }
        self.run_queue.schedule(Task::StartNextRequest);
    }

    /// The connection closed before a response head was complete.
    fn handle_unexpected_eof(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        let Some(reply_id) = chan.current_reply() else {
            return;
        };
        if chan.reconnect_attempts == 0 {
            self.requeue_pipelined(ch);
            self.close(ch);
            self.channels[ch.0].current = None;
            let error = NetworkError::with_default_detail(ErrorKind::RemoteHostClosed, &self.host);
            self.fail_reply(reply_id, error);
            self.run_queue.schedule(Task::StartNextRequest);
        } else {
            chan.reconnect_attempts -= 1;
            debug!(channel = %ch, reply = %reply_id, attempts_left = chan.reconnect_attempts, "connection closed early, resending");
            if let Some(slot) = self.replies.get_mut(&reply_id) {
                slot.reply.clear();
                slot.reply.channel = Some(ch);
            }
            self.close_and_resend_current_request(ch);
        }
    }

    /// Fail the reply in flight on `ch` and free the channel.
    pub(super) fn emit_reply_error(&mut self, ch: ChannelId, error: NetworkError) {
        let chan = &mut self.channels[ch.0];
        let Some(pair) = chan.current.take() else {
            return;
        };
        chan.resend_current = false;
        if let Some(slot) = self.replies.get_mut(&pair.reply) {
            slot.reply.clear();
        }
        self.fail_reply(pair.reply, error);
        self.close(ch);
        self.requeue_pipelined(ch);
        self.run_queue.schedule(Task::StartNextRequest);
    }

    /// Write more idempotent GETs behind the current request.
    pub(super) fn fill_pipeline(&mut self, ch: ChannelId) {
        if self.queue.is_empty() {
            return;
        }
        let pipeline_length = self.config.pipeline_length;
        let repipeline_length = self.config.repipeline_length;
        let through_proxy = self.through_cache_proxy();
        let chan = &mut self.channels[ch.0];
        let Some(current) = chan.current.as_ref() else {
            return;
        };
        let closing_after_current = self
            .replies
            .get(&current.reply)
            .map_or(false, |slot| slot.reply.force_connection_close);
        if closing_after_current
            || pipeline_length.saturating_sub(chan.pipelined.len()) < repipeline_length
            || chan.pipelining != PipeliningSupport::ProbablySupported
            || !current.request.is_pipelining_allowed()
            || *current.request.method() != Method::Get
            || chan.socket.state() != SocketState::Connected
            || chan.resend_current
            || chan.has_credentials()
            || !chan.is_waiting_or_reading()
        {
            return;
        }

        let eligible = |request: &Request| {
            *request.method() == Method::Get && request.is_pipelining_allowed() && !request.has_userinfo()
        };
        'tiers: for high in [true, false] {
            while chan.pipelined.len() < pipeline_length {
                match self.queue.take_first_matching(high, eligible) {
                    Some(pair) => {
                        if let Some(slot) = self.replies.get_mut(&pair.reply) {
                            slot.reply.prepare_for_send(ch, pair.request.auto_decompress(), true);
                        }
                        trace!(channel = %ch, reply = %pair.reply, "pipelining request");
                        chan.pipeline_into(pair, through_proxy);
                    }
                    None => continue 'tiers,
                }
            }
            break;
        }
        if let Err(e) = chan.pipeline_flush() {
            warn!(channel = %ch, error = %e, "writing pipelined requests failed");
            self.requeue_pipelined(ch);
            self.close(ch);
        }
    }

    pub(super) fn on_connected(&mut self, ch: ChannelId) {
        if self.channels[ch.0].socket.state() != SocketState::Connected {
            debug!(channel = %ch, "ignoring stale connect");
            return;
        }
        if self.eyeballs.is_pending() {
            self.network_layer_connected(ch);
            if self.active_channel_count > 1 && !self.encrypted {
                self.run_queue.schedule(Task::StartNextRequest);
            }
        } else if let Some(family) = self.eyeballs.decided() {
            let preference = self.channels[ch.0].preference;
            if preference != NetworkLayer::Any && preference != family {
                debug!(channel = %ch, ?preference, "connected with the losing family, closing");
                self.close(ch);
                self.run_queue.schedule(Task::StartNextRequest);
                return;
            }
        }

        let chan = &mut self.channels[ch.0];
        chan.pipelining = PipeliningSupport::Unknown;
        debug!(channel = %ch, "connected");
        if chan.pending_encrypt {
            return;
        }
        chan.state = ChannelState::Idle;
        if self.is_multiplexed() {
            self.attach_multiplexer(ch);
            return;
        }
        if self.channels[ch.0].current.is_none() {
            self.dequeue_request(ch);
        }
        if self.channels[ch.0].current.is_some() {
            self.send_request(ch);
        }
    }

    pub(super) fn on_encrypted(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        if chan.socket.state() != SocketState::Connected {
            debug!(channel = %ch, "ignoring stale handshake completion");
            return;
        }
        chan.pending_encrypt = false;
        chan.state = ChannelState::Idle;
        debug!(channel = %ch, "encrypted");

        if self.connection_type == crate::config::ConnectionType::Multiplexed && self.is_multiplexed() {
            let protocol = self.channels[ch.0].socket.negotiated_protocol();
            match protocol.as_deref() {
                Some(b"h2") => {
                    self.attach_multiplexer(ch);
                    return;
                }
                None | Some(b"http/1.1") => self.fall_back_to_http1(),
                Some(other) => {
                    warn!(channel = %ch, protocol = %String::from_utf8_lossy(other), "unsupported protocol negotiated");
                    let error = NetworkError::new(ErrorKind::SslHandshakeFailed, "Unsupported or unknown protocol");
                    self.fail_next_staged(error);
                    self.close(ch);
                    return;
                }
            }
        } else if self.is_multiplexed() {
            self.attach_multiplexer(ch);
            return;
        }

        if self.channels[ch.0].current.is_none() {
            self.dequeue_request(ch);
        }
        if self.channels[ch.0].current.is_some() {
            self.run_queue.schedule(Task::SendRequest(ch));
        }
    }

    pub(super) fn on_ssl_errors(&mut self, ch: ChannelId, errors: Vec<String>) {
        self.pause_connection();
        let chan = &self.channels[ch.0];
        if chan.pending_encrypt && chan.current.is_none() && !self.is_multiplexed() {
            self.dequeue_request(ch);
        }
        let target = self.channels[ch.0]
            .current_reply()
            .or_else(|| self.to_send.first_reply());
        let ignore = match target.and_then(|id| self.replies.get_mut(&id)) {
            Some(slot) => slot.handler.ssl_errors(&slot.reply, &errors),
            None => false,
        };
        self.resume_connection();
        if ignore {
            debug!(channel = %ch, "certificate errors ignored");
            self.channels[ch.0].socket.ignore_ssl_errors();
        } else {
            warn!(channel = %ch, errors = ?errors, "certificate errors, aborting");
            self.on_error(ch, SocketError::SslHandshakeFailed);
            self.abort(ch);
        }
    }

    pub(super) fn on_ready_read(&mut self, ch: ChannelId) {
        if self.channels[ch.0].multiplexer.is_some() {
            self.receive_multiplexed(ch);
            return;
        }
        let chan = &mut self.channels[ch.0];
        if chan.is_waiting_or_reading() {
            chan.state = ChannelState::Reading;
            if chan.current.is_some() {
                self.receive_reply(ch);
            }
        } else if chan.state == ChannelState::Idle && chan.current.is_none() {
            // idle keep-alive connection; servers send e.g. 408 before closing
            self.receive_reply(ch);
        }
    }

    pub(super) fn on_bytes_written(&mut self, ch: ChannelId, bytes: usize) {
        trace!(channel = %ch, bytes, "bytes written");
        if self.channels[ch.0].state == ChannelState::Writing {
            self.send_request(ch);
        }
    }

    /// The body source of `reply` has more data.
    pub(super) fn on_upload_ready(&mut self, reply: ReplyId) {
        let found = self
            .channels
            .iter()
            .find(|c| c.state == ChannelState::Writing && c.current_reply() == Some(reply))
            .map(|c| c.id);
        if let Some(ch) = found {
            self.run_queue.schedule(Task::SendRequest(ch));
        }
    }

    pub(super) fn on_disconnected(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        if chan.socket.state() != SocketState::Unconnected {
            debug!(channel = %ch, "ignoring stale disconnect");
            return;
        }
        debug!(channel = %ch, state = ?chan.state, "disconnected");
        if chan.state == ChannelState::Closing {
            chan.state = ChannelState::Idle;
            self.run_queue.schedule(Task::StartNextRequest);
            return;
        }
        if !chan.streams.is_empty() {
            let error = NetworkError::with_default_detail(ErrorKind::RemoteHostClosed, &self.host);
            self.fail_streams(ch, &error);
        }

        let chan = &mut self.channels[ch.0];
        if chan.is_waiting_or_reading() && chan.current.is_some() {
            chan.state = ChannelState::Reading;
            // reads what is left, or finishes/retries on end of stream
            self.receive_reply(ch);
        } else if chan.state == ChannelState::Idle && chan.resend_current {
            self.run_queue.schedule(Task::StartNextRequest);
        }
        let chan = &mut self.channels[ch.0];
        chan.state = ChannelState::Idle;
        chan.pending_encrypt = false;
        chan.multiplexer = None;
        if !chan.pipelined.is_empty() {
            self.requeue_pipelined(ch);
        }
    }

    pub(super) fn on_error(&mut self, ch: ChannelId, error: SocketError) {
        let chan = &mut self.channels[ch.0];
        let state = chan.state;
        let kind = match &error {
            SocketError::HostNotFound => ErrorKind::HostNotFound,
            SocketError::ConnectionRefused => ErrorKind::ConnectionRefused,
            SocketError::RemoteHostClosed => {
                if chan.current.is_none() && state == ChannelState::Idle {
                    // keep-alive connection timed out on the server side
                    if !chan.streams.is_empty() {
                        let e = NetworkError::with_default_detail(ErrorKind::RemoteHostClosed, &self.host);
                        self.fail_streams(ch, &e);
                    }
                    return;
                } else if state != ChannelState::Idle && state != ChannelState::Reading {
                    if !chan.pending_encrypt && chan.reconnect_attempts > 0 {
                        chan.reconnect_attempts -= 1;
                        debug!(channel = %ch, ?state, "connection closed by peer, resending");
                        self.resend_current_request(ch);
                        return;
                    }
                    ErrorKind::RemoteHostClosed
                } else if state == ChannelState::Reading {
                    if let Some(reply_id) = chan.current_reply() {
                        let mode = self.replies.get(&reply_id).map(|slot| slot.reply.body_mode());
                        if matches!(mode, Some(BodyMode::None) | Some(BodyMode::UntilClose)) {
                            self.run_queue.schedule(Task::ReceiveReply(ch));
                            return;
                        }
                        if chan.has_unread() {
                            self.receive_reply(ch);
                            if self.channels[ch.0].current_reply() != Some(reply_id) {
                                self.requeue_pipelined(ch);
                                self.channels[ch.0].state = ChannelState::Idle;
                                self.run_queue.schedule(Task::StartNextRequest);
                                return;
                            }
                        }
                    }
                    ErrorKind::RemoteHostClosed
                } else {
                    ErrorKind::RemoteHostClosed
                }
            }
            SocketError::Timeout => {
                if state == ChannelState::Writing && chan.reconnect_attempts > 0 {
                    chan.reconnect_attempts -= 1;
                    self.resend_current_request(ch);
                    return;
                }
                ErrorKind::Timeout
            }
            SocketError::ProxyAuthenticationRequired => {
                if self.tunnel_authentication_required(ch) {
                    return;
                }
                ErrorKind::ProxyAuthenticationRequired
            }
            SocketError::SslHandshakeFailed => ErrorKind::SslHandshakeFailed,
            SocketError::ProxyConnectionClosed | SocketError::ProxyConnectionTimeout => {
                if chan.reconnect_attempts > 0 {
                    chan.reconnect_attempts -= 1;
                    self.resend_current_request(ch);
                    return;
                }
                if error == SocketError::ProxyConnectionClosed {
                    ErrorKind::RemoteHostClosed
                } else {
                    ErrorKind::Timeout
                }
            }
            SocketError::Other(_) => ErrorKind::Unspecified,
        };
        let message = match kind {
            ErrorKind::Unspecified => {
                let detail = self.channels[ch.0].socket.error_string();
                if detail.is_empty() {
                    error.to_string()
                } else {
                    detail
                }
            }
            _ => kind.detail(&self.host),
        };

        if !self.should_emit_channel_error(ch) {
            return;
        }
        let network_error = NetworkError::new(kind, message);
        warn!(channel = %ch, kind = ?kind, error = %network_error, "channel error");

        let chan = &mut self.channels[ch.0];
        if !chan.streams.is_empty() {
            self.fail_streams(ch, &network_error);
        } else if let Some(pair) = chan.current.take() {
            chan.resend_current = false;
            self.requeue_pipelined(ch);
            self.fail_reply(pair.reply, network_error);
        } else if self.is_multiplexed() {
            self.fail_next_staged(network_error);
        } else if let Some(pair) = self.queue.dequeue() {
            // nothing in flight: the next request would hit the same error
            self.fail_reply(pair.reply, network_error);
        }

        let chan = &mut self.channels[ch.0];
        chan.pending_encrypt = false;
        if chan.socket.state() == SocketState::Unconnected {
            chan.state = ChannelState::Idle;
            chan.multiplexer = None;
        } else if chan.state != ChannelState::Closing {
            self.close(ch);
        }
        self.run_queue.schedule(Task::StartNextRequest);
    }

    /// Run a queued `ReceiveReply` task.
    pub(super) fn receive_reply_task(&mut self, ch: ChannelId) {
        if self.channels[ch.0].multiplexer.is_some() {
            self.receive_multiplexed(ch);
            return;
        }
        let chan = &mut self.channels[ch.0];
        if chan.state == ChannelState::Waiting {
            chan.state = ChannelState::Reading;
        }
        if chan.current.is_some() {
            self.receive_reply(ch);
        }
    }
}
