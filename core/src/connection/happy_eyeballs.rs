/*
 * happy_eyeballs.rs
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

//! Address family decision ("happy eyeballs"): resolve the host, race IPv4 and IPv6
//! on the first two channels with a bias delay, latch the family of the winner.

use std::net::IpAddr;

use tracing::{debug, warn};

use super::run_queue::Task;
use super::{ChannelState, Connection};
use crate::error::{ErrorKind, NetworkError};
use crate::transport::{ChannelId, Lookup, LookupId, NetworkLayer, TimerToken};

/// Network layer decision of a connection, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkLayerState {
    Unknown,
    HostLookupPending,
    IPv4,
    IPv6,
    /// Both families are being tried.
    IPv4or6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Race {
    NotStarted,
    Resolving(Option<LookupId>),
    /// Connection attempts under way. The timer, when set, starts `delayed`.
    Racing {
        timer: Option<(TimerToken, ChannelId)>,
    },
    Decided(NetworkLayer),
}

#[derive(Debug)]
pub(crate) struct HappyEyeballs {
    race: Race,
    /// The first address returned was IPv6, so IPv4 is the delayed family.
    delay_ipv4: bool,
}

impl HappyEyeballs {
    pub(crate) fn new() -> Self {
        Self {
            race: Race::NotStarted,
            delay_ipv4: false,
        }
    }

    pub(crate) fn state(&self) -> NetworkLayerState {
        match self.race {
            Race::NotStarted => NetworkLayerState::Unknown,
            Race::Resolving(_) => NetworkLayerState::HostLookupPending,
            Race::Racing { .. } => NetworkLayerState::IPv4or6,
            Race::Decided(NetworkLayer::IPv6) => NetworkLayerState::IPv6,
            Race::Decided(_) => NetworkLayerState::IPv4,
        }
    }

    pub(crate) fn decided(&self) -> Option<NetworkLayer> {
        match self.race {
            Race::Decided(family) => Some(family),
            _ => None,
        }
    }

    /// Lookup or connection race in progress.
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.race, Race::Resolving(_) | Race::Racing { .. })
    }

    fn begin_lookup(&mut self, id: Option<LookupId>) {
        self.race = Race::Resolving(id);
    }

    fn is_lookup(&self, id: LookupId) -> bool {
        self.race == Race::Resolving(Some(id))
    }

    fn pending_lookup(&self) -> Option<LookupId> {
        match self.race {
            Race::Resolving(id) => id,
            _ => None,
        }
    }

    fn latch(&mut self, family: NetworkLayer) {
        self.race = Race::Decided(family);
    }

    fn start_race(&mut self, timer: Option<(TimerToken, ChannelId)>) {
        self.race = Race::Racing { timer };
    }

    /// Back to Unknown. Returns a timer that must be cancelled.
    fn reset(&mut self) -> Option<TimerToken> {
        let timer = self.take_timer().map(|(token, _)| token);
        self.race = Race::NotStarted;
        timer
    }

    /// Remove the pending delayed start, if any.
    fn take_timer(&mut self) -> Option<(TimerToken, ChannelId)> {
        match &mut self.race {
            Race::Racing { timer } => timer.take(),
            _ => None,
        }
    }

    /// The delayed channel to start when `token` fires.
    fn fire(&mut self, token: TimerToken) -> Option<ChannelId> {
        match &mut self.race {
            Race::Racing { timer: Some((t, channel)) } if *t == token => {
                let channel = *channel;
                self.race = Race::Racing { timer: None };
                Some(channel)
            }
            _ => None,
        }
    }
}

impl Connection {
    pub(super) fn start_host_lookup(&mut self) {
        self.eyeballs.begin_lookup(None);
        let host = self.lookup_host().to_string();
        if let Ok(addr) = host.parse::<IpAddr>() {
            self.host_lookup_finished(Ok(vec![addr]));
            return;
        }
        debug!(%host, "looking up host");
        match self.resolver.lookup(&host) {
            Lookup::Ready(result) => self.host_lookup_finished(result),
            Lookup::Pending(id) => self.eyeballs.begin_lookup(Some(id)),
        }
    }

    /// Give up on an outstanding lookup and any delayed connection attempt.
    pub(super) fn abandon_network_layer_lookup(&mut self) {
        if let Some(id) = self.eyeballs.pending_lookup() {
            debug!(host = %self.host, lookup = id.0, "aborting host lookup");
            self.resolver.abort(id);
        }
        if let Some(token) = self.eyeballs.reset() {
            self.timers.cancel(token);
        }
    }

    pub(super) fn on_lookup_finished(&mut self, id: LookupId, result: Result<Vec<IpAddr>, String>) {
        if !self.eyeballs.is_lookup(id) {
            debug!(lookup = id.0, "ignoring stale lookup result");
            return;
        }
        self.host_lookup_finished(result);
    }

    fn host_lookup_finished(&mut self, result: Result<Vec<IpAddr>, String>) {
        if matches!(self.eyeballs.race, Race::Racing { .. } | Race::Decided(_)) {
            return;
        }
        let addrs = result.unwrap_or_else(|e| {
            debug!(host = %self.lookup_host(), error = %e, "host lookup failed");
            Vec::new()
        });
        let has_v4 = addrs.iter().any(IpAddr::is_ipv4);
        let has_v6 = addrs.iter().any(IpAddr::is_ipv6);
        if let Some(first) = addrs.first() {
            self.eyeballs.delay_ipv4 = first.is_ipv6();
        }

        if has_v4 && has_v6 {
            self.start_network_layer_state_lookup();
        } else if has_v4 || has_v6 {
            let family = if has_v4 { NetworkLayer::IPv4 } else { NetworkLayer::IPv6 };
            debug!(host = %self.host, ?family, "network layer decided by lookup");
            self.eyeballs.latch(family);
            self.run_queue.schedule(Task::StartNextRequest);
        } else {
            if let Some(token) = self.eyeballs.reset() {
                self.timers.cancel(token);
            }
            let error = NetworkError::with_default_detail(ErrorKind::HostNotFound, &self.host);
            if self.is_multiplexed() {
                self.fail_all_staged(&error);
            } else if let Some(pair) = self.queue.dequeue() {
                // the rest start a fresh lookup
                self.fail_reply(pair.reply, error);
                self.run_queue.schedule(Task::StartNextRequest);
            } else {
                warn!(host = %self.host, "host lookup failed with nothing queued");
            }
        }
    }

    /// Both families are available: race them on the first two channels.
    fn start_network_layer_state_lookup(&mut self) {
        if self.active_channel_count > 1 {
            self.channels[0].preference = NetworkLayer::IPv4;
            self.channels[1].preference = NetworkLayer::IPv6;
            let (first, delayed) = if self.eyeballs.delay_ipv4 {
                (ChannelId(1), ChannelId(0))
            } else {
                (ChannelId(0), ChannelId(1))
            };
            let delay = self.config.happy_eyeballs_timeout();
            let token = self.timers.start(delay);
            debug!(host = %self.host, first = %first, ?delay, "racing IPv4 and IPv6");
            self.eyeballs.start_race(Some((token, delayed)));
            self.ensure_connection(first);
        } else {
            self.eyeballs.start_race(None);
            self.channels[0].preference = NetworkLayer::Any;
            self.ensure_connection(ChannelId(0));
        }
    }

    pub(super) fn on_timer(&mut self, token: TimerToken) {
        if let Some(channel) = self.eyeballs.fire(token) {
            debug!(channel = %channel, "starting delayed connection attempt");
            self.ensure_connection(channel);
        }
    }

    /// A channel connected while the family was undecided: latch its family and
    /// drop attempts of the other one.
    pub(super) fn network_layer_connected(&mut self, ch: ChannelId) {
        if let Some((token, _)) = self.eyeballs.take_timer() {
            self.timers.cancel(token);
        }
        let preference = self.channels[ch.0].preference;
        let family = match preference {
            NetworkLayer::Any => self.channels[ch.0]
                .socket
                .peer_family()
                .unwrap_or(NetworkLayer::IPv4),
            family => family,
        };
        debug!(channel = %ch, ?family, "network layer decided by connection");
        self.eyeballs.latch(family);
        for i in 0..self.active_channel_count {
            if self.channels[i].preference != preference && self.channels[i].state == ChannelState::Connecting {
                self.close(ChannelId(i));
            }
        }
    }

    /// Decide whether a socket error on `ch` reaches a reply, given the race state.
    pub(super) fn should_emit_channel_error(&mut self, ch: ChannelId) -> bool {
        let other = ChannelId(if ch.0 == 0 { 1 } else { 0 });
        if let Some((token, delayed)) = self.eyeballs.take_timer() {
            self.timers.cancel(token);
            self.ensure_connection(delayed);
        }

        if self.active_channel_count < self.channels.len() {
            if self.eyeballs.is_pending() {
                self.abandon_network_layer_lookup();
            }
            self.close(ChannelId(0));
            true
        } else if self.eyeballs.is_pending() {
            let other_trying = self
                .channels
                .get(other.0)
                .map_or(false, |c| c.is_busy() && c.state != ChannelState::Closing);
            if other_trying && ch.0 < 2 {
                debug!(channel = %ch, "suppressing error while the other family is still trying");
                self.close(ch);
                false
            } else {
                self.abandon_network_layer_lookup();
                self.close(ch);
                true
            }
        } else {
            if let Some(family) = self.eyeballs.decided() {
                let preference = self.channels[ch.0].preference;
                // A channel still pinned to the losing family never got a request:
                // requests go only to connected channels once the family is decided.
                if preference != NetworkLayer::Any && preference != family {
                    self.close(ch);
                    self.run_queue.schedule(Task::StartNextRequest);
                    return false;
                }
            } else {
                warn!(channel = %ch, "channel error while the network layer is unknown");
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        let mut he = HappyEyeballs::new();
        assert_eq!(he.state(), NetworkLayerState::Unknown);
        he.begin_lookup(Some(LookupId(7)));
        assert_eq!(he.state(), NetworkLayerState::HostLookupPending);
        assert!(he.is_lookup(LookupId(7)));
        assert!(!he.is_lookup(LookupId(8)));
        assert_eq!(he.pending_lookup(), Some(LookupId(7)));
        he.start_race(Some((TimerToken(1), ChannelId(1))));
        assert_eq!(he.state(), NetworkLayerState::IPv4or6);
        assert!(he.is_pending());
        assert_eq!(he.pending_lookup(), None);
        he.latch(NetworkLayer::IPv6);
        assert_eq!(he.state(), NetworkLayerState::IPv6);
        assert_eq!(he.decided(), Some(NetworkLayer::IPv6));
    }

    #[test]
    fn timer_fires_once_for_its_token() {
        let mut he = HappyEyeballs::new();
        he.start_race(Some((TimerToken(3), ChannelId(0))));
        assert_eq!(he.fire(TimerToken(2)), None);
        assert_eq!(he.fire(TimerToken(3)), Some(ChannelId(0)));
        assert_eq!(he.fire(TimerToken(3)), None);
        assert_eq!(he.take_timer(), None);
        assert_eq!(he.state(), NetworkLayerState::IPv4or6);
    }

    #[test]
    fn reset_returns_pending_timer() {
        let mut he = HappyEyeballs::new();
        he.start_race(Some((TimerToken(9), ChannelId(1))));
        assert_eq!(he.reset(), Some(TimerToken(9)));
        assert_eq!(he.state(), NetworkLayerState::Unknown);
        assert_eq!(he.reset(), None);
    }
}
