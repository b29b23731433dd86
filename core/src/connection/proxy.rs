/*
 * proxy.rs
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

//! HTTP proxies. Plain connections talk to a caching proxy, which is given absolute
//! request targets; encrypted connections ask their transport for a CONNECT tunnel.

use tracing::debug;

use super::{ChannelState, Connection};
use crate::config::HttpProxy;
use crate::transport::ChannelId;

impl Connection {
    /// Requests are written to a caching proxy rather than to the origin.
    pub(crate) fn through_cache_proxy(&self) -> bool {
        self.config.proxy.is_some() && !self.encrypted
    }

    /// The host channels open sockets to, and so the one whose addresses are raced.
    pub(super) fn lookup_host(&self) -> &str {
        self.config
            .proxy
            .as_ref()
            .map_or(self.host.as_str(), |proxy| proxy.host.as_str())
    }

    /// Target of a channel's `connect`. For a tunnel this stays the origin; the
    /// transport reaches it through the proxy.
    pub(super) fn endpoint(&self) -> (String, u16) {
        match &self.config.proxy {
            Some(proxy) if !self.encrypted => (proxy.host.clone(), proxy.port),
            _ => (self.host.clone(), self.port),
        }
    }

    /// Tunnel for `ch`, carrying the credentials its proxy authenticator holds.
    pub(super) fn tunnel_for(&self, ch: ChannelId) -> Option<HttpProxy> {
        if !self.encrypted {
            return None;
        }
        let proxy = self.config.proxy.as_ref()?;
        let auth = &self.channels[ch.0].proxy_authenticator;
        Some(proxy.clone().with_credentials(auth.user(), auth.password()))
    }

    /// Preset proxy credentials on every channel.
    pub fn set_proxy_credentials(&mut self, user: &str, password: &str) {
        for chan in &mut self.channels {
            chan.proxy_authenticator.set_user(user);
            chan.proxy_authenticator.set_password(password);
        }
    }

    /// The tunnel proxy refused `ch`. Ask the reply that would be served next for
    /// credentials; returns true when new ones were given and `ch` is connecting again.
    pub(super) fn tunnel_authentication_required(&mut self, ch: ChannelId) -> bool {
        let reply_id = self.channels[ch.0]
            .current_reply()
            .or_else(|| self.queue.first_reply())
            .or_else(|| self.to_send.first_reply());
        let Some(reply_id) = reply_id else {
            return false;
        };
        let chan = &mut self.channels[ch.0];
        let before = (
            chan.proxy_authenticator.user().to_string(),
            chan.proxy_authenticator.password().to_string(),
        );
        self.pause_connection();
        if let Some(slot) = self.replies.get_mut(&reply_id) {
            let chan = &mut self.channels[ch.0];
            slot.handler.proxy_authentication_required(&slot.reply, &mut chan.proxy_authenticator);
        }
        self.resume_connection();

        let auth = &self.channels[ch.0].proxy_authenticator;
        let unchanged = auth.user() == before.0 && auth.password() == before.1;
        if auth.user().is_empty() || unchanged {
            debug!(channel = %ch, reply = %reply_id, "no new proxy credentials");
            return false;
        }
        debug!(channel = %ch, reply = %reply_id, "retrying the tunnel with new proxy credentials");
        self.copy_credentials(ch, true);
        let chan = &mut self.channels[ch.0];
        chan.state = ChannelState::Idle;
        chan.pending_encrypt = false;
        self.ensure_connection(ch);
        true
    }
}
