/*
 * reply.rs
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

//! Reply: the caller-visible side of a queued request. Response head, body delivery
//! through a `ReplyHandler` (push model), and the terminal outcome.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::warn;
use url::Url;

use super::decode::Decoder;
use super::h1::{BodyMode, H1ResponseHandler};
use super::headers::HeaderList;
use super::request::{Method, Request};
use crate::auth::Authenticator;
use crate::error::{ErrorKind, NetworkError};
use crate::transport::ChannelId;

/// Handle for a reply owned by a `Connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyId(pub(crate) u64);

impl ReplyId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiver of reply events. Called synchronously from the connection; the reply
/// is only valid for the duration of the call.
///
/// Flow: `header_changed` once the head is known, `ready_read` for each decoded body
/// chunk, then exactly one of `finished` or `failed`. Responses that lead to an
/// internal resend (authentication, same-origin redirect) are not surfaced.
pub trait ReplyHandler {
    fn header_changed(&mut self, reply: &Reply) {
        let _ = reply;
    }

    fn ready_read(&mut self, reply: &Reply, data: &[u8]);

    fn finished(&mut self, reply: &Reply);

    fn failed(&mut self, reply: &Reply, error: &NetworkError);

    fn upload_progress(&mut self, _reply: &Reply, _written: u64, _total: u64) {}

    /// The server wants credentials. Set user and password on `auth` to retry;
    /// leaving it untouched fails the reply with AuthenticationRequired.
    fn authentication_required(&mut self, _reply: &Reply, _auth: &mut Authenticator) {}

    fn proxy_authentication_required(&mut self, _reply: &Reply, _auth: &mut Authenticator) {}

    /// A same-origin redirect is being followed on this connection.
    fn redirected(&mut self, _reply: &Reply, _url: &Url) {}

    /// Asked for every redirect under `RedirectPolicy::UserVerified`.
    fn redirect_allowed(&mut self, _reply: &Reply, _url: &Url) -> bool {
        false
    }

    /// Certificate problems during the TLS handshake. Return true to ignore them.
    fn ssl_errors(&mut self, _reply: &Reply, _errors: &[String]) -> bool {
        false
    }
}

/// Response state of one request.
pub struct Reply {
    id: ReplyId,
    url: Url,
    method: Method,
    pre_connect: bool,
    status: u16,
    reason: String,
    version: (u8, u8),
    headers: HeaderList,
    content_length: Option<u64>,
    /// Framing length; survives the Content-Length header being stripped for decoding.
    body_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    bytes_delivered: u64,
    redirect_url: Option<Url>,
    outcome: Option<Result<(), NetworkError>>,
    pipelining_used: bool,
    multiplexed: bool,
    pub(crate) channel: Option<ChannelId>,
    pub(crate) force_connection_close: bool,
    auto_decompress: bool,
    decoder: Option<Decoder>,
    decode_error: Option<String>,
    deferred: bool,
    deferred_body: Vec<u8>,
    header_emitted: bool,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("channel", &self.channel)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl Reply {
    pub(crate) fn new(id: ReplyId, request: &Request) -> Self {
        Self {
            id,
            url: request.url().clone(),
            method: request.method().clone(),
            pre_connect: request.is_pre_connect(),
            status: 0,
            reason: String::new(),
            version: (1, 1),
            headers: HeaderList::new(),
            content_length: None,
            body_length: None,
            chunked: false,
            connection_close: false,
            bytes_delivered: 0,
            redirect_url: None,
            outcome: None,
            pipelining_used: false,
            multiplexed: false,
            channel: None,
            force_connection_close: false,
            auto_decompress: false,
            decoder: None,
            decode_error: None,
            deferred: false,
            deferred_body: Vec::new(),
            header_emitted: false,
        }
    }

    pub fn id(&self) -> ReplyId {
        self.id
    }

    /// URL of the request, updated when a redirect is followed internally.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// HTTP version of the response as (major, minor).
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Value of the Content-Length header, if present and not stripped by decoding.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Body bytes handed to the handler so far (after decoding).
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// Target of a redirect that was not followed on this connection.
    pub fn redirect_url(&self) -> Option<&Url> {
        self.redirect_url.as_ref()
    }

    pub fn outcome(&self) -> Option<&Result<(), NetworkError>> {
        self.outcome.as_ref()
    }

    pub fn error(&self) -> Option<&NetworkError> {
        match &self.outcome {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn pipelining_used(&self) -> bool {
        self.pipelining_used
    }

    pub fn multiplexed_used(&self) -> bool {
        self.multiplexed
    }

    /// Channel currently serving this reply.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn is_pre_connect(&self) -> bool {
        self.pre_connect
    }

    pub(crate) fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub(crate) fn set_redirect_url(&mut self, url: Url) {
        self.redirect_url = Some(url);
    }

    pub(crate) fn set_multiplexed(&mut self) {
        self.multiplexed = true;
    }

    /// Reset the response state before the request goes on the wire (again).
    pub(crate) fn prepare_for_send(&mut self, channel: ChannelId, auto_decompress: bool, pipelined: bool) {
        self.clear();
        self.channel = Some(channel);
        self.auto_decompress = auto_decompress;
        self.pipelining_used = pipelined;
    }

    /// Drop everything learned from a response, keeping identity and outcome.
    pub(crate) fn clear(&mut self) {
        self.status = 0;
        self.reason.clear();
        self.version = (1, 1);
        self.headers.clear();
        self.content_length = None;
        self.body_length = None;
        self.chunked = false;
        self.connection_close = false;
        self.bytes_delivered = 0;
        self.decoder = None;
        self.decode_error = None;
        self.deferred = false;
        self.deferred_body.clear();
        self.header_emitted = false;
    }

    pub(crate) fn set_status(&mut self, major: u8, minor: u8, code: u16, reason: &str) {
        self.version = (major, minor);
        self.status = code;
        self.reason = reason.to_string();
    }

    /// Interim 1xx responses are dropped entirely.
    pub(crate) fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub(crate) fn is_redirect_status(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 305 | 307 | 308)
    }

    /// Head complete: cache framing facts, set up decoding and decide whether the
    /// handler sees this response as it arrives or only once it is known to be final.
    pub(crate) fn headers_complete(&mut self, follows_redirects: bool) {
        self.chunked = self.headers.has_token("transfer-encoding", "chunked");
        self.body_length = self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        self.content_length = self.body_length;
        let connection = self.headers.get("connection").unwrap_or("");
        let proxy_connection = self.headers.get("proxy-connection").unwrap_or("");
        self.connection_close = connection.to_ascii_lowercase().contains("close")
            || proxy_connection.to_ascii_lowercase().contains("close")
            || (self.version == (1, 0)
                && connection.is_empty()
                && !proxy_connection.to_ascii_lowercase().contains("keep-alive"));

        let encoding = self.headers.get("content-encoding").map(str::to_string);
        match encoding.as_deref().and_then(Decoder::for_encoding) {
            Some(decoder) if self.auto_decompress => {
                self.decoder = Some(decoder);
                self.headers.remove("content-encoding");
                self.headers.remove("content-length");
                self.content_length = None;
            }
            _ => self.auto_decompress = false,
        }

        self.deferred = !self.should_emit_signals()
            || (follows_redirects && self.is_redirect_status() && self.headers.contains("location"));
    }

    /// Responses to 401 and 407 are held back; their content is only shown when
    /// authentication gives up.
    pub(crate) fn should_emit_signals(&self) -> bool {
        self.status != 401 && self.status != 407
    }

    pub(crate) fn is_connection_close_enabled(&self) -> bool {
        self.connection_close || self.force_connection_close
    }

    pub(crate) fn expect_content(&self) -> bool {
        if (100..200).contains(&self.status) || self.status == 204 || self.status == 304 {
            return false;
        }
        if self.method == Method::Head {
            return false;
        }
        !matches!(self.body_length, Some(0))
    }

    pub(crate) fn body_mode(&self) -> BodyMode {
        if !self.expect_content() {
            BodyMode::None
        } else if self.chunked {
            BodyMode::Chunked
        } else {
            match self.body_length {
                Some(n) => BodyMode::Length(n),
                None => BodyMode::UntilClose,
            }
        }
    }

    pub(crate) fn take_decode_error(&mut self) -> Option<String> {
        self.decode_error.take()
    }
}

/// A reply together with the handler that observes it.
pub(crate) struct ReplySlot {
    pub(crate) reply: Reply,
    pub(crate) handler: Box<dyn ReplyHandler>,
}

impl ReplySlot {
    pub(crate) fn new(reply: Reply, handler: Box<dyn ReplyHandler>) -> Self {
        Self { reply, handler }
    }

    pub(crate) fn emit_header(&mut self) {
        if self.reply.header_emitted {
            return;
        }
        self.reply.header_emitted = true;
        self.handler.header_changed(&self.reply);
    }

    /// Head complete. Held-back responses stay quiet until `flush_deferred`.
    pub(crate) fn announce_head(&mut self) {
        if !self.reply.deferred {
            self.emit_header();
        }
    }

    /// Body bytes as received on the wire.
    pub(crate) fn deliver(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.reply.deferred {
            self.reply.deferred_body.extend_from_slice(data);
            return;
        }
        self.emit_header();
        let decoded = match self.reply.decoder.as_mut() {
            Some(decoder) => match decoder.decode(data) {
                Ok(out) => out,
                Err(e) => {
                    warn!(reply = %self.reply.id, error = %e, "content decoding failed");
                    self.reply.decode_error = Some(e.to_string());
                    return;
                }
            },
            None => data.to_vec(),
        };
        if !decoded.is_empty() {
            self.reply.bytes_delivered += decoded.len() as u64;
            self.handler.ready_read(&self.reply, &decoded);
        }
    }

    /// Show held-back head and content to the handler.
    pub(crate) fn flush_deferred(&mut self) {
        if !self.reply.deferred {
            return;
        }
        self.reply.deferred = false;
        self.emit_header();
        let body = std::mem::take(&mut self.reply.deferred_body);
        self.deliver(&body);
    }

    /// Complete successfully. Returns false if an outcome was already delivered.
    pub(crate) fn finish(&mut self) -> bool {
        if self.reply.outcome.is_some() {
            return false;
        }
        self.flush_deferred();
        if let Some(mut decoder) = self.reply.decoder.take() {
            match decoder.finish() {
                Ok(tail) if !tail.is_empty() => {
                    self.reply.bytes_delivered += tail.len() as u64;
                    self.handler.ready_read(&self.reply, &tail);
                }
                Ok(_) => {}
                Err(e) => {
                    return self.fail(NetworkError::new(
                        ErrorKind::ProtocolFailure,
                        format!("Data corrupted: {}", e),
                    ));
                }
            }
        }
        self.emit_header();
        self.reply.outcome = Some(Ok(()));
        self.reply.channel = None;
        self.handler.finished(&self.reply);
        true
    }

    /// Complete with an error. Returns false if an outcome was already delivered.
    pub(crate) fn fail(&mut self, error: NetworkError) -> bool {
        if self.reply.outcome.is_some() {
            return false;
        }
        self.reply.outcome = Some(Err(error.clone()));
        self.reply.channel = None;
        self.handler.failed(&self.reply, &error);
        true
    }
}

impl H1ResponseHandler for ReplySlot {
    fn status(&mut self, major: u8, minor: u8, code: u16, reason: &str) {
        self.reply.set_status(major, minor, code, reason);
    }

    fn header(&mut self, name: &str, value: &str) {
        self.reply.headers.push(name, value);
    }

    fn body_chunk(&mut self, data: &[u8]) {
        self.deliver(data);
    }

    fn trailer(&mut self, name: &str, value: &str) {
        self.reply.headers.push(name, value);
    }
}

/// Everything a `ReplyBuffer` has seen.
#[derive(Debug, Default, Clone)]
pub struct BufferedReply {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub redirects: Vec<Url>,
    pub redirect_url: Option<Url>,
    pub pipelined: bool,
    pub outcome: Option<Result<(), NetworkError>>,
}

/// Handler that collects a reply in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct ReplyBuffer {
    inner: Rc<RefCell<BufferedReply>>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BufferedReply {
        self.inner.borrow().clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.inner.borrow().body.clone()
    }

    pub fn status(&self) -> u16 {
        self.inner.borrow().status
    }

    pub fn is_finished(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    pub fn error(&self) -> Option<NetworkError> {
        match &self.inner.borrow().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    fn record_head(&self, reply: &Reply) {
        let mut inner = self.inner.borrow_mut();
        inner.status = reply.status();
        inner.reason = reply.reason().to_string();
        inner.headers = reply
            .headers()
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        inner.pipelined = reply.pipelining_used();
    }
}

impl ReplyHandler for ReplyBuffer {
    fn header_changed(&mut self, reply: &Reply) {
        self.record_head(reply);
    }

    fn ready_read(&mut self, _reply: &Reply, data: &[u8]) {
        self.inner.borrow_mut().body.extend_from_slice(data);
    }

    fn finished(&mut self, reply: &Reply) {
        self.record_head(reply);
        let mut inner = self.inner.borrow_mut();
        inner.redirect_url = reply.redirect_url().cloned();
        inner.outcome = Some(Ok(()));
    }

    fn failed(&mut self, _reply: &Reply, error: &NetworkError) {
        self.inner.borrow_mut().outcome = Some(Err(error.clone()));
    }

    fn redirected(&mut self, _reply: &Reply, url: &Url) {
        self.inner.borrow_mut().redirects.push(url.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RequestBuilder;
    use std::io::Write;

    fn slot_for(method: Method) -> (ReplySlot, ReplyBuffer) {
        let request = RequestBuilder::new(method, "http://example.com/").unwrap().build();
        let buffer = ReplyBuffer::new();
        let reply = Reply::new(ReplyId(1), &request);
        (ReplySlot::new(reply, Box::new(buffer.clone())), buffer)
    }

    #[test]
    fn http10_without_keep_alive_closes() {
        let (mut slot, _) = slot_for(Method::Get);
        slot.reply.set_status(1, 0, 200, "OK");
        slot.reply.headers_complete(false);
        assert!(slot.reply.is_connection_close_enabled());

        slot.reply.clear();
        slot.reply.set_status(1, 1, 200, "OK");
        slot.reply.headers.push("Connection", "keep-alive");
        slot.reply.headers_complete(false);
        assert!(!slot.reply.is_connection_close_enabled());
        slot.reply.force_connection_close = true;
        assert!(slot.reply.is_connection_close_enabled());
    }

    #[test]
    fn body_modes() {
        let (mut slot, _) = slot_for(Method::Head);
        slot.reply.set_status(1, 1, 200, "OK");
        slot.reply.headers.push("Content-Length", "10");
        slot.reply.headers_complete(false);
        assert_eq!(slot.reply.body_mode(), BodyMode::None);

        let (mut slot, _) = slot_for(Method::Get);
        slot.reply.set_status(1, 1, 200, "OK");
        slot.reply.headers_complete(false);
        assert_eq!(slot.reply.body_mode(), BodyMode::UntilClose);

        slot.reply.clear();
        slot.reply.set_status(1, 1, 304, "Not Modified");
        slot.reply.headers_complete(false);
        assert_eq!(slot.reply.body_mode(), BodyMode::None);

        slot.reply.clear();
        slot.reply.set_status(1, 1, 200, "OK");
        slot.reply.headers.push("Transfer-Encoding", "chunked");
        slot.reply.headers_complete(false);
        assert_eq!(slot.reply.body_mode(), BodyMode::Chunked);
    }

    #[test]
    fn unauthorized_content_is_held_back() {
        let (mut slot, buffer) = slot_for(Method::Get);
        slot.reply.set_status(1, 1, 401, "Unauthorized");
        slot.reply.headers_complete(false);
        slot.deliver(b"denied");
        assert!(buffer.body().is_empty());
        assert_eq!(buffer.status(), 0);
        slot.flush_deferred();
        assert_eq!(buffer.body(), b"denied");
        assert_eq!(buffer.status(), 401);
    }

    #[test]
    fn outcome_delivered_once() {
        let (mut slot, buffer) = slot_for(Method::Get);
        slot.reply.set_status(1, 1, 200, "OK");
        slot.reply.headers_complete(false);
        assert!(slot.finish());
        assert!(!slot.fail(NetworkError::with_default_detail(ErrorKind::Timeout, "")));
        assert!(!slot.finish());
        assert!(buffer.is_finished());
        assert!(buffer.error().is_none());
    }

    #[test]
    fn gzip_body_decoded_and_headers_stripped() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"plain text").unwrap();
        let gz = enc.finish().unwrap();

        let (mut slot, buffer) = slot_for(Method::Get);
        slot.reply.prepare_for_send(ChannelId(0), true, false);
        slot.reply.set_status(1, 1, 200, "OK");
        slot.reply.headers.push("Content-Encoding", "gzip");
        slot.reply.headers.push("Content-Length", &gz.len().to_string());
        slot.reply.headers_complete(false);
        assert_eq!(slot.reply.body_mode(), BodyMode::Length(gz.len() as u64));
        assert!(slot.reply.content_length().is_none());
        assert!(slot.reply.header("content-encoding").is_none());
        slot.deliver(&gz);
        slot.finish();
        assert_eq!(buffer.body(), b"plain text");
    }
}
