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

//! Connection manager: a bounded pool of channels to one host, the request queues
//! that feed them, and the dispatch loop that matches the two.
//!
//! A `Connection` is sans-IO. Transports, the resolver and timers are supplied as
//! collaborators and report back through `Event`s, which the owner feeds into
//! `handle_event`. Follow-up work is put on an internal run queue and drained before
//! `handle_event` returns, so nothing re-enters the dispatch loop recursively.

mod challenge;
mod channel;
mod happy_eyeballs;
mod multiplex;
mod proxy;
mod queue;
mod redirect;
mod run_queue;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use tracing::{debug, warn};

pub use channel::ChannelState;
pub use happy_eyeballs::NetworkLayerState;

use channel::Channel;
use happy_eyeballs::HappyEyeballs;
use multiplex::ToSend;
use queue::{MessagePair, PriorityQueues};
use run_queue::{RunQueue, Task};

use crate::auth::Authenticator;
use crate::config::{ConnectionConfig, ConnectionType};
use crate::error::{Error, NetworkError, Result};
use crate::http::reply::ReplySlot;
use crate::http::{Reply, ReplyHandler, ReplyId, Request};
use crate::transport::{
    ChannelId, Collaborators, Event, HostResolver, MultiplexerFactory, NetworkLayer, SocketState,
    TimerService,
};

/// Pool of channels to one host and port.
pub struct Connection {
    host: String,
    port: u16,
    encrypted: bool,
    config: ConnectionConfig,
    connection_type: ConnectionType,
    channels: Vec<Channel>,
    active_channel_count: usize,
    queue: PriorityQueues,
    to_send: ToSend,
    replies: HashMap<ReplyId, ReplySlot>,
    next_reply: u64,
    pre_connect_requests: usize,
    eyeballs: HappyEyeballs,
    resolver: Box<dyn HostResolver>,
    timers: Box<dyn TimerService>,
    multiplexers: Option<Box<dyn MultiplexerFactory>>,
    run_queue: RunQueue,
    paused: bool,
    /// Channel events that arrived while paused.
    held_events: VecDeque<Event>,
}

impl Connection {
    /// Create a connection to `host:port`. IPv6 literals may be given with or without
    /// brackets.
    pub fn new(
        host: &str,
        port: u16,
        encrypted: bool,
        config: ConnectionConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        if host.is_empty() {
            return Err(Error::MissingHost("connection host is empty".to_string()));
        }
        let needs_multiplexer = match config.connection_type {
            ConnectionType::Http1 => false,
            ConnectionType::Multiplexed => encrypted,
            ConnectionType::MultiplexedDirect => true,
        };
        if needs_multiplexer && collaborators.multiplexers.is_none() {
            return Err(Error::Config(format!(
                "{:?} mode needs a multiplexer factory",
                config.connection_type
            )));
        }

        let Collaborators {
            mut transports,
            resolver,
            timers,
            multiplexers,
        } = collaborators;
        let channels = (0..config.channel_count)
            .map(|i| {
                let id = ChannelId(i);
                Channel::new(id, transports.create(id, encrypted), config.reconnect_attempts)
            })
            .collect();
        let active_channel_count = config.active_channel_count(encrypted);
        let proxy = config.proxy.clone();
        debug!(
            %host,
            port,
            encrypted,
            channels = config.channel_count,
            active_channel_count,
            proxy = ?proxy.as_ref().map(|p| format!("{}:{}", p.host, p.port)),
            "connection created"
        );
        let mut connection = Self {
            host,
            port,
            encrypted,
            connection_type: config.connection_type,
            config,
            channels,
            active_channel_count,
            queue: PriorityQueues::new(),
            to_send: ToSend::new(),
            replies: HashMap::new(),
            next_reply: 1,
            pre_connect_requests: 0,
            eyeballs: HappyEyeballs::new(),
            resolver,
            timers,
            multiplexers,
            run_queue: RunQueue::new(),
            paused: false,
            held_events: VecDeque::new(),
        };
        if let Some(proxy) = proxy.filter(|p| !p.user.is_empty()) {
            connection.set_proxy_credentials(&proxy.user, &proxy.password);
        }
        Ok(connection)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current mode. Multiplexed falls back to Http1 when the server does not
    /// negotiate it.
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn network_layer_state(&self) -> NetworkLayerState {
        self.eyeballs.state()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn active_channel_count(&self) -> usize {
        self.active_channel_count
    }

    /// Queue a request. The handler is told about the outcome exactly once, possibly
    /// before this returns when the request cannot be prepared.
    pub fn submit(&mut self, request: Request, handler: Box<dyn ReplyHandler>) -> ReplyId {
        let id = ReplyId(self.next_reply);
        self.next_reply += 1;
        let mut request = request;
        let reply = Reply::new(id, &request);
        self.replies.insert(id, ReplySlot::new(reply, handler));
        if request.is_pre_connect() {
            self.pre_connect_requests += 1;
        }
        let through_proxy = self.through_cache_proxy();
        if let Err(error) = request.prepare(&self.config, &self.host, through_proxy) {
            warn!(reply = %id, url = %request.url(), %error, "request rejected");
            self.fail_reply(id, error);
            return id;
        }
        debug!(reply = %id, method = %request.method().as_str(), url = %request.url(), priority = ?request.priority(), "request queued");
        let pair = MessagePair::new(request, id);
        if self.is_multiplexed() {
            self.to_send.insert(pair);
        } else {
            self.queue.enqueue(pair);
        }

        match self.eyeballs.state() {
            NetworkLayerState::Unknown => self.start_host_lookup(),
            // the only direct dispatch; everything else goes through the run queue
            NetworkLayerState::IPv4 | NetworkLayerState::IPv6 => self.start_next_request(),
            NetworkLayerState::HostLookupPending | NetworkLayerState::IPv4or6 => {}
        }
        self.run_pending();
        id
    }

    /// Process one event, then any follow-up work.
    pub fn handle_event(&mut self, event: Event) {
        self.process(event);
        self.run_pending();
    }

    /// Process a batch of events, then any follow-up work.
    pub fn handle_events(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.process(event);
        }
        self.run_pending();
    }

    /// Try to make progress without any new event. Idempotent.
    pub fn dispatch(&mut self) {
        self.run_queue.schedule(Task::StartNextRequest);
        self.run_pending();
    }

    /// Stop delivering socket events until `resume`.
    pub fn pause(&mut self) {
        self.pause_connection();
    }

    pub fn resume(&mut self) {
        self.resume_connection();
        while !self.paused {
            let Some(event) = self.held_events.pop_front() else {
                break;
            };
            self.process(event);
        }
        self.run_pending();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// A reply that has not reached its outcome yet.
    pub fn reply(&self, id: ReplyId) -> Option<&Reply> {
        self.replies.get(&id).map(|slot| &slot.reply)
    }

    pub fn has_pending_replies(&self) -> bool {
        !self.replies.is_empty()
    }

    pub fn pending_reply_count(&self) -> usize {
        self.replies.len()
    }

    /// Queued replies in the order they will be dispatched.
    pub fn queued_replies(&self) -> Vec<ReplyId> {
        let mut ids = self.queue.reply_ids();
        ids.extend(self.to_send.reply_ids());
        ids
    }

    pub fn pre_connect_requests(&self) -> usize {
        self.pre_connect_requests
    }

    pub fn channel_state(&self, ch: ChannelId) -> Option<ChannelState> {
        self.channels.get(ch.0).map(|c| c.state)
    }

    /// Reply being written or read on `ch`.
    pub fn current_reply(&self, ch: ChannelId) -> Option<ReplyId> {
        self.channels.get(ch.0).and_then(|c| c.current_reply())
    }

    /// Replies written behind the current one on `ch`, in response order.
    pub fn pipelined_replies(&self, ch: ChannelId) -> Vec<ReplyId> {
        self.channels
            .get(ch.0)
            .map(|c| c.pipelined.iter().map(|pair| pair.reply).collect())
            .unwrap_or_default()
    }

    /// Replies in flight on the multiplexed channel `ch`.
    pub fn stream_replies(&self, ch: ChannelId) -> Vec<ReplyId> {
        let mut ids: Vec<ReplyId> = self
            .channels
            .get(ch.0)
            .map(|c| c.streams.values().map(|pair| pair.reply).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn authenticator(&self, ch: ChannelId) -> Option<&Authenticator> {
        self.channels.get(ch.0).map(|c| &c.authenticator)
    }

    pub fn proxy_authenticator(&self, ch: ChannelId) -> Option<&Authenticator> {
        self.channels.get(ch.0).map(|c| &c.proxy_authenticator)
    }

    /// Preset credentials on every channel, as if URL userinfo had been given.
    pub fn set_credentials(&mut self, user: &str, password: &str) {
        for chan in &mut self.channels {
            chan.authenticator.set_user(user);
            chan.authenticator.set_password(password);
        }
    }

    /// Forget a reply the caller no longer wants. The handler is dropped without
    /// further calls. A request in flight closes its channel.
    pub fn remove_reply(&mut self, id: ReplyId) {
        self.detach_reply(id, false);
        self.run_pending();
    }

    /// Like `remove_reply`, but a channel in use is aborted instead of closed.
    pub fn abort_reply(&mut self, id: ReplyId) {
        self.detach_reply(id, true);
        self.run_pending();
    }

    fn detach_reply(&mut self, id: ReplyId, abort: bool) {
        let Some(slot) = self.replies.remove(&id) else {
            return;
        };
        if slot.reply.is_pre_connect() {
            self.pre_connect_requests = self.pre_connect_requests.saturating_sub(1);
        }
        debug!(reply = %id, abort, "reply removed");

        for i in 0..self.active_channel_count {
            let ch = ChannelId(i);
            let chan = &mut self.channels[i];
            if chan.current_reply() == Some(id) {
                chan.current = None;
                chan.resend_current = false;
                self.requeue_pipelined(ch);
                // the response is unfinished, so the connection cannot be reused
                if abort {
                    self.abort(ch);
                } else {
                    self.close(ch);
                }
                self.run_queue.schedule(Task::StartNextRequest);
                return;
            }
            if let Some(pos) = chan.pipelined.iter().position(|pair| pair.reply == id) {
                chan.pipelined.remove(pos);
                self.requeue_pipelined(ch);
                // what was pipelined behind the current request is gone
                if let Some(current) = self.channels[i].current_reply() {
                    if let Some(slot) = self.replies.get_mut(&current) {
                        slot.reply.force_connection_close = true;
                    }
                }
                self.run_queue.schedule(Task::StartNextRequest);
                return;
            }
            if let Some(stream) = chan.streams.iter().find(|(_, pair)| pair.reply == id).map(|(s, _)| *s) {
                chan.streams.remove(&stream);
                if let Some(mux) = chan.multiplexer.as_mut() {
                    mux.reset_stream(stream);
                    let outgoing = mux.take_outgoing();
                    if !outgoing.is_empty() {
                        if let Err(e) = chan.socket.write(&outgoing) {
                            warn!(channel = %ch, error = %e, "writing stream reset failed");
                        }
                    }
                }
                self.run_queue.schedule(Task::StartNextRequest);
                return;
            }
        }
        if self.to_send.remove(id).is_some() || self.queue.remove(id).is_some() {
            self.run_queue.schedule(Task::StartNextRequest);
        }
    }

    fn process(&mut self, event: Event) {
        if let Some(ch) = event_channel(&event) {
            if ch.0 >= self.channels.len() {
                warn!(channel = %ch, "event for unknown channel");
                return;
            }
            if self.paused {
                self.held_events.push_back(event);
                return;
            }
        }
        match event {
            Event::Connected(ch) => self.on_connected(ch),
            Event::Encrypted(ch) => self.on_encrypted(ch),
            Event::SslErrors(ch, errors) => self.on_ssl_errors(ch, errors),
            Event::ReadyRead(ch) => self.on_ready_read(ch),
            Event::BytesWritten(ch, n) => self.on_bytes_written(ch, n),
            Event::Disconnected(ch) => self.on_disconnected(ch),
            Event::Error(ch, error) => self.on_error(ch, error),
            Event::LookupFinished(id, result) => self.on_lookup_finished(id, result),
            Event::TimerFired(token) => self.on_timer(token),
            Event::UploadReady(reply) => self.on_upload_ready(reply),
        }
    }

    fn run_pending(&mut self) {
        while let Some(task) = self.run_queue.pop() {
            match task {
                Task::StartNextRequest => self.start_next_request(),
                Task::ReceiveReply(ch) => self.receive_reply_task(ch),
                Task::SendRequest(ch) => {
                    if self.channels[ch.0].multiplexer.is_some() {
                        self.send_multiplexed(ch);
                    } else {
                        self.send_request(ch);
                    }
                }
            }
        }
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        match self.connection_type {
            ConnectionType::Http1 => false,
            ConnectionType::Multiplexed => self.encrypted,
            ConnectionType::MultiplexedDirect => true,
        }
    }

    fn decided_preference(&self) -> Option<NetworkLayer> {
        self.eyeballs.decided()
    }

    /// The dispatch loop.
    fn start_next_request(&mut self) {
        if !matches!(
            self.eyeballs.state(),
            NetworkLayerState::IPv4 | NetworkLayerState::IPv6
        ) {
            if self.eyeballs.state() == NetworkLayerState::Unknown
                && (!self.queue.is_empty() || !self.to_send.is_empty())
            {
                self.start_host_lookup();
            }
            return;
        }
        if self.paused {
            return;
        }

        for i in 0..self.active_channel_count {
            let ch = ChannelId(i);
            let chan = &mut self.channels[i];
            if chan.resend_current && chan.state != ChannelState::Closing {
                chan.resend_current = false;
                if !self.reset_upload_data(ch) {
                    continue;
                }
                debug!(channel = %ch, reply = ?self.channels[i].current_reply(), "resending");
                self.send_request(ch);
            }
        }

        if self.is_multiplexed() {
            self.start_next_multiplexed();
            return;
        }

        if self.queue.is_empty() {
            return;
        }
        for i in 0..self.active_channel_count {
            let ch = ChannelId(i);
            let chan = &self.channels[i];
            if chan.current.is_none() && !chan.is_busy() && chan.socket.state() == SocketState::Connected {
                if self.dequeue_request(ch) {
                    self.send_request(ch);
                }
            }
        }

        if self.queue.is_empty() {
            return;
        }
        for i in 0..self.active_channel_count {
            if self.channels[i].socket.state() == SocketState::Connected {
                self.fill_pipeline(ChannelId(i));
            }
        }

        // open more channels; pre-connect and real requests can share one each
        let queued = self.queue.len();
        let mut needed = if self.pre_connect_requests > 0 {
            queued
                .saturating_sub(self.pre_connect_requests)
                .max(self.pre_connect_requests)
        } else {
            queued
        };
        let mut to_connect = Vec::new();
        for i in 0..self.active_channel_count {
            if needed == 0 {
                break;
            }
            let chan = &self.channels[i];
            let socket_state = chan.socket.state();
            if matches!(socket_state, SocketState::Connecting | SocketState::HostLookup) || chan.pending_encrypt {
                needed -= 1;
            } else if chan.current.is_none() && !chan.is_busy() && socket_state == SocketState::Unconnected {
                to_connect.push(ChannelId(i));
                needed -= 1;
            }
        }
        let preference = self.decided_preference();
        for ch in to_connect {
            if let Some(family) = preference {
                self.channels[ch.0].preference = family;
            }
            self.ensure_connection(ch);
        }
    }

    /// Assign the next queued pair to `ch`.
    fn dequeue_request(&mut self, ch: ChannelId) -> bool {
        let Some(pair) = self.queue.dequeue() else {
            return false;
        };
        if let Some(slot) = self.replies.get_mut(&pair.reply) {
            slot.reply.channel = Some(ch);
        }
        self.channels[ch.0].current = Some(pair);
        true
    }

    pub(crate) fn pause_connection(&mut self) {
        self.paused = true;
    }

    pub(crate) fn resume_connection(&mut self) {
        self.paused = false;
        for i in 0..self.active_channel_count {
            if self.channels[i].state == ChannelState::Writing {
                self.run_queue.schedule(Task::SendRequest(ChannelId(i)));
            }
        }
        self.run_queue.schedule(Task::StartNextRequest);
    }

    /// Deliver success and forget the reply.
    pub(crate) fn finish_reply(&mut self, id: ReplyId) {
        let Some(mut slot) = self.replies.remove(&id) else {
            return;
        };
        if slot.reply.is_pre_connect() {
            self.pre_connect_requests = self.pre_connect_requests.saturating_sub(1);
        }
        debug!(reply = %id, status = slot.reply.status(), "reply finished");
        slot.finish();
    }

    /// Deliver failure and forget the reply.
    pub(crate) fn fail_reply(&mut self, id: ReplyId, error: NetworkError) {
        let Some(mut slot) = self.replies.remove(&id) else {
            return;
        };
        if slot.reply.is_pre_connect() {
            self.pre_connect_requests = self.pre_connect_requests.saturating_sub(1);
        }
        debug!(reply = %id, kind = ?error.kind(), %error, "reply failed");
        slot.fail(error);
    }

    /// Fail every request staged for the multiplexed channel.
    pub(crate) fn fail_all_staged(&mut self, error: &NetworkError) {
        while let Some(pair) = self.to_send.pop_front() {
            self.fail_reply(pair.reply, error.clone());
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abandon_network_layer_lookup();
    }
}

fn event_channel(event: &Event) -> Option<ChannelId> {
    match event {
        Event::Connected(ch)
        | Event::Encrypted(ch)
        | Event::SslErrors(ch, _)
        | Event::ReadyRead(ch)
        | Event::BytesWritten(ch, _)
        | Event::Disconnected(ch)
        | Event::Error(ch, _) => Some(*ch),
        Event::LookupFinished(..) | Event::TimerFired(_) | Event::UploadReady(_) => None,
    }
}

/// Host part of a URL as a connection expects it.
pub(crate) fn url_host(url: &url::Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(d) => Some(d.to_string()),
        url::Host::Ipv4(a) => Some(IpAddr::V4(a).to_string()),
        url::Host::Ipv6(a) => Some(IpAddr::V6(a).to_string()),
    }
}
