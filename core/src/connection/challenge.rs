/*
 * challenge.rs
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

//! Answering 401 and 407 challenges: ask the reply handler for credentials while
//! the connection is paused, then share them with the other channels.

use tracing::debug;

use super::Connection;
use crate::auth::{parse_challenges, Authenticator, Challenge, Phase};
use crate::error::{ErrorKind, NetworkError};
use crate::transport::ChannelId;

impl Connection {
    /// Returns None when no offered scheme is usable, Some(true) when the request
    /// should be resent with credentials, and Some(false) when authentication was
    /// given up and the reply has failed.
    pub(super) fn handle_authenticate_challenge(&mut self, ch: ChannelId, is_proxy: bool) -> Option<bool> {
        let reply_id = self.channels[ch.0].current_reply()?;
        let header = if is_proxy { "proxy-authenticate" } else { "www-authenticate" };
        let challenges: Vec<Challenge> = self
            .replies
            .get(&reply_id)?
            .reply
            .headers()
            .get_all(header)
            .flat_map(parse_challenges)
            .collect();

        let chan = &mut self.channels[ch.0];
        let auth = if is_proxy {
            &mut chan.proxy_authenticator
        } else {
            &mut chan.authenticator
        };
        auth.parse_challenge(&challenges);
        if !auth.has_method() {
            return None;
        }

        if auth.phase() == Phase::Done {
            self.pause_connection();
            let chan = &mut self.channels[ch.0];
            let (auth, sent) = if is_proxy {
                (&mut chan.proxy_authenticator, &mut chan.proxy_credentials_sent)
            } else {
                (&mut chan.authenticator, &mut chan.credentials_sent)
            };
            if *sent {
                debug!(channel = %ch, reply = %reply_id, "credentials rejected");
                auth.mark_failed();
                *sent = false;
            }
            if let Some(slot) = self.replies.get_mut(&reply_id) {
                if is_proxy {
                    slot.handler.proxy_authentication_required(&slot.reply, auth);
                } else {
                    slot.handler.authentication_required(&slot.reply, auth);
                }
            }
            let phase = auth.phase();
            self.resume_connection();
            if phase != Phase::Done {
                self.copy_credentials(ch, is_proxy);
            }
        }

        let with_credentials = self.channels[ch.0]
            .current
            .as_ref()
            .map_or(false, |pair| pair.request.with_credentials());
        let chan = &mut self.channels[ch.0];
        let auth = if is_proxy {
            &mut chan.proxy_authenticator
        } else {
            &mut chan.authenticator
        };
        if auth.phase() == Phase::Done || !with_credentials {
            // start clean for the next request on this channel
            *auth = Authenticator::new();
            let kind = if is_proxy {
                ErrorKind::ProxyAuthenticationRequired
            } else {
                ErrorKind::AuthenticationRequired
            };
            debug!(channel = %ch, reply = %reply_id, ?kind, "authentication given up");
            if let Some(slot) = self.replies.get_mut(&reply_id) {
                slot.flush_deferred();
            }
            let error = NetworkError::with_default_detail(kind, &self.host);
            self.fail_reply(reply_id, error);
            return Some(false);
        }
        debug!(channel = %ch, reply = %reply_id, scheme = ?auth.scheme(), "resending with credentials");
        Some(true)
    }

    /// Give the other channels the credentials accepted on `from`. Connection-bound
    /// schemes keep their state where it is.
    pub(super) fn copy_credentials(&mut self, from: ChannelId, is_proxy: bool) {
        let source = {
            let chan = &mut self.channels[from.0];
            let auth = if is_proxy {
                &mut chan.proxy_authenticator
            } else {
                &mut chan.authenticator
            };
            if auth.is_negotiating_method() {
                return;
            }
            std::mem::take(auth)
        };
        for (i, chan) in self.channels.iter_mut().enumerate().take(self.active_channel_count) {
            if i == from.0 {
                continue;
            }
            let other = if is_proxy {
                &mut chan.proxy_authenticator
            } else {
                &mut chan.authenticator
            };
            source.copy_to(other);
        }
        let chan = &mut self.channels[from.0];
        if is_proxy {
            chan.proxy_authenticator = source;
        } else {
            chan.authenticator = source;
        }
    }
}
