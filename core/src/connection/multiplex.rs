/*
 * multiplex.rs
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

//! Multiplexed mode: every request becomes a stream on channel 0. Requests wait in
//! `ToSend` until the channel is connected and its multiplexer accepts new streams.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use super::queue::MessagePair;
use super::run_queue::Task;
use super::Connection;
use crate::config::ConnectionType;
use crate::error::{ErrorKind, NetworkError};
use crate::http::h1::H1ResponseHandler;
use crate::http::{Priority, RedirectPolicy, ReplyId};
use crate::transport::{ChannelId, StreamEvent};

const MUX_CHANNEL: ChannelId = ChannelId(0);

/// Requests staged for the multiplexed channel: High first, then Normal and Low,
/// each in submission order.
#[derive(Default)]
pub(crate) struct ToSend {
    high: VecDeque<MessagePair>,
    low: VecDeque<MessagePair>,
}

impl ToSend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, pair: MessagePair) {
        if pair.request.priority() == Priority::High {
            self.high.push_back(pair);
        } else {
            self.low.push_back(pair);
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<MessagePair> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    pub(crate) fn remove(&mut self, reply: ReplyId) -> Option<MessagePair> {
        for tier in [&mut self.high, &mut self.low] {
            if let Some(pos) = tier.iter().position(|p| p.reply == reply) {
                return tier.remove(pos);
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub(crate) fn first_reply(&self) -> Option<ReplyId> {
        self.high.front().or_else(|| self.low.front()).map(|p| p.reply)
    }

    pub(crate) fn reply_ids(&self) -> Vec<ReplyId> {
        self.high.iter().chain(self.low.iter()).map(|p| p.reply).collect()
    }

    fn drain(&mut self) -> impl DoubleEndedIterator<Item = MessagePair> + '_ {
        self.high.drain(..).chain(self.low.drain(..))
    }
}

impl Connection {
    /// Install a fresh multiplexer on a channel that just became usable.
    pub(super) fn attach_multiplexer(&mut self, ch: ChannelId) {
        if self.channels[ch.0].multiplexer.is_some() {
            return;
        }
        let Some(factory) = self.multiplexers.as_mut() else {
            warn!(channel = %ch, "no multiplexer available, using HTTP/1.1");
            self.fall_back_to_http1();
            return;
        };
        let mut mux = factory.create();
        let preface = mux.take_outgoing();
        let chan = &mut self.channels[ch.0];
        chan.multiplexer = Some(mux);
        chan.state = super::ChannelState::Idle;
        debug!(channel = %ch, "multiplexer attached");
        if !preface.is_empty() {
            if let Err(e) = chan.socket.write(&preface) {
                warn!(channel = %ch, error = %e, "writing connection preface failed");
                let error = NetworkError::new(ErrorKind::Unspecified, e.to_string());
                self.fail_next_staged(error);
                self.close(ch);
                return;
            }
        }
        if chan.has_unread() {
            self.run_queue.schedule(Task::ReceiveReply(ch));
        }
        if !self.to_send.is_empty() {
            self.run_queue.schedule(Task::SendRequest(ch));
        }
    }

    /// The peer did not agree to multiplexing: serve everything over HTTP/1.1.
    pub(super) fn fall_back_to_http1(&mut self) {
        debug!(staged = self.to_send.reply_ids().len(), "falling back to HTTP/1.1");
        self.connection_type = ConnectionType::Http1;
        self.active_channel_count = self.channels.len();
        let staged: Vec<MessagePair> = self.to_send.drain().collect();
        self.queue.requeue_all(staged.into_iter());
        self.run_queue.schedule(Task::StartNextRequest);
    }

    pub(super) fn start_next_multiplexed(&mut self) {
        if self.to_send.is_empty() {
            return;
        }
        if let Some(family) = self.decided_preference() {
            self.channels[MUX_CHANNEL.0].preference = family;
        }
        if self.ensure_connection(MUX_CHANNEL) && self.channels[MUX_CHANNEL.0].multiplexer.is_some() {
            self.send_multiplexed(MUX_CHANNEL);
        }
    }

    /// Open streams for staged requests while the multiplexer has room.
    pub(super) fn send_multiplexed(&mut self, ch: ChannelId) {
        loop {
            let can_open = self.channels[ch.0]
                .multiplexer
                .as_ref()
                .map_or(false, |mux| mux.can_open_stream());
            if !can_open {
                break;
            }
            let Some(mut pair) = self.to_send.pop_front() else {
                break;
            };
            if pair.request.is_pre_connect() {
                debug!(channel = %ch, reply = %pair.reply, "pre-connect request done");
                self.finish_reply(pair.reply);
                continue;
            }
            let chan = &mut self.channels[ch.0];
            if pair.request.with_credentials() {
                chan.authorize(&mut pair.request);
            }
            let Some(mux) = chan.multiplexer.as_mut() else {
                self.to_send.insert(pair);
                break;
            };
            match mux.open_stream(&mut pair.request) {
                Ok(stream) => {
                    trace!(channel = %ch, reply = %pair.reply, stream, "stream opened");
                    if let Some(slot) = self.replies.get_mut(&pair.reply) {
                        slot.reply.set_url(pair.request.url().clone());
                        slot.reply.prepare_for_send(ch, pair.request.auto_decompress(), false);
                        slot.reply.set_multiplexed();
                    }
                    chan.streams.insert(stream, pair);
                }
                Err(error) => {
                    warn!(channel = %ch, reply = %pair.reply, %error, "cannot open stream");
                    self.fail_reply(pair.reply, error);
                }
            }
        }
        self.flush_multiplexer(ch);
    }

    fn flush_multiplexer(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        let Some(mux) = chan.multiplexer.as_mut() else {
            return;
        };
        let out = mux.take_outgoing();
        if out.is_empty() {
            return;
        }
        if let Err(e) = chan.socket.write(&out) {
            warn!(channel = %ch, error = %e, "writing frames failed");
            let error = NetworkError::new(ErrorKind::Unspecified, e.to_string());
            self.fail_streams(ch, &error);
            self.close(ch);
        }
    }

    /// Feed received bytes to the multiplexer and route what comes out to replies.
    pub(super) fn receive_multiplexed(&mut self, ch: ChannelId) {
        let chan = &mut self.channels[ch.0];
        chan.read_available();
        if chan.read_buf.is_empty() {
            return;
        }
        let data = chan.read_buf.split().freeze();
        let Some(mux) = chan.multiplexer.as_mut() else {
            return;
        };
        let events = match mux.receive(&data) {
            Ok(events) => events,
            Err(error) => {
                warn!(channel = %ch, %error, "multiplexed framing error");
                self.fail_streams(ch, &error);
                self.close(ch);
                self.run_queue.schedule(Task::StartNextRequest);
                return;
            }
        };
        for event in events {
            self.stream_event(ch, event);
        }
        self.flush_multiplexer(ch);
        self.run_queue.schedule(Task::StartNextRequest);
    }

    fn stream_event(&mut self, ch: ChannelId, event: StreamEvent) {
        match event {
            StreamEvent::Head { stream, status, headers } => {
                let Some(pair) = self.channels[ch.0].streams.get(&stream) else {
                    trace!(channel = %ch, stream, "head for unknown stream");
                    return;
                };
                let reply_id = pair.reply;
                let follows = pair.request.redirect_policy() != RedirectPolicy::Manual;
                let Some(slot) = self.replies.get_mut(&reply_id) else {
                    return;
                };
                slot.reply.clear();
                slot.status(2, 0, status, "");
                for (name, value) in headers.iter() {
                    slot.header(name, value);
                }
                if slot.reply.is_interim() {
                    slot.reply.clear();
                    return;
                }
                slot.reply.headers_complete(follows);
                slot.announce_head();
            }
            StreamEvent::Data { stream, data } => {
                let Some(reply_id) = self.channels[ch.0].streams.get(&stream).map(|p| p.reply) else {
                    return;
                };
                let Some(slot) = self.replies.get_mut(&reply_id) else {
                    return;
                };
                slot.deliver(&data);
                if let Some(message) = slot.reply.take_decode_error() {
                    let error = NetworkError::new(ErrorKind::ProtocolFailure, format!("Data corrupted: {}", message));
                    self.reset_stream(ch, stream, error);
                }
            }
            StreamEvent::End { stream } => {
                let Some(pair) = self.channels[ch.0].streams.remove(&stream) else {
                    return;
                };
                self.stream_finished(pair);
            }
            StreamEvent::Reset { stream, error } => {
                if let Some(pair) = self.channels[ch.0].streams.remove(&stream) {
                    debug!(channel = %ch, stream, reply = %pair.reply, %error, "stream reset by peer");
                    self.fail_reply(pair.reply, error);
                }
            }
        }
    }

    fn stream_finished(&mut self, pair: MessagePair) {
        let reply_id = pair.reply;
        let Some(slot) = self.replies.get_mut(&reply_id) else {
            return;
        };
        let status = slot.reply.status();
        if status == 401 || status == 407 {
            // no resend over a shared connection
            slot.flush_deferred();
            let kind = if status == 407 {
                ErrorKind::ProxyAuthenticationRequired
            } else {
                ErrorKind::AuthenticationRequired
            };
            let error = NetworkError::with_default_detail(kind, &self.host);
            self.fail_reply(reply_id, error);
            return;
        }
        let policy = pair.request.redirect_policy();
        if slot.reply.is_redirect_status() && policy != RedirectPolicy::Manual {
            if let Some(location) = slot.reply.header("location").map(str::to_string) {
                match super::redirect::redirect_target(
                    pair.request.url(),
                    &location,
                    policy,
                    pair.request.redirect_count(),
                ) {
                    Ok(target) => slot.reply.set_redirect_url(target),
                    Err(kind) => {
                        let error = NetworkError::with_default_detail(kind, &self.host);
                        self.fail_reply(reply_id, error);
                        return;
                    }
                }
            }
        }
        self.finish_reply(reply_id);
    }

    fn reset_stream(&mut self, ch: ChannelId, stream: u32, error: NetworkError) {
        let chan = &mut self.channels[ch.0];
        let Some(pair) = chan.streams.remove(&stream) else {
            return;
        };
        if let Some(mux) = chan.multiplexer.as_mut() {
            mux.reset_stream(stream);
        }
        self.fail_reply(pair.reply, error);
    }

    /// Fail every stream in flight on `ch`. Returns whether there were any.
    pub(super) fn fail_streams(&mut self, ch: ChannelId, error: &NetworkError) -> bool {
        let streams = std::mem::take(&mut self.channels[ch.0].streams);
        if streams.is_empty() {
            return false;
        }
        debug!(channel = %ch, count = streams.len(), %error, "failing open streams");
        let mut replies: Vec<ReplyId> = streams.into_values().map(|pair| pair.reply).collect();
        replies.sort();
        for reply in replies {
            self.fail_reply(reply, error.clone());
        }
        true
    }

    /// Fail the staged request that would have gone out next.
    pub(super) fn fail_next_staged(&mut self, error: NetworkError) {
        if let Some(pair) = self.to_send.pop_front() {
            self.fail_reply(pair.reply, error);
        }
    }
}
