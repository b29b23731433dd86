/*
 * redirect.rs
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

//! 3xx handling. Redirects to this connection's own origin are followed in place;
//! anything else completes the reply with its redirect target set.

use tracing::debug;
use url::Url;

use super::run_queue::Task;
use super::Connection;
use crate::error::{ErrorKind, NetworkError};
use crate::http::{RedirectPolicy, ReplyId};
use crate::transport::ChannelId;

/// Resolve and vet a Location value against the request URL and policy.
pub(crate) fn redirect_target(
    base: &Url,
    location: &str,
    policy: RedirectPolicy,
    remaining: u32,
) -> Result<Url, ErrorKind> {
    let target = base.join(location.trim()).map_err(|_| ErrorKind::ProtocolUnknown)?;
    if target.scheme() != "http" && target.scheme() != "https" {
        return Err(ErrorKind::ProtocolUnknown);
    }
    if remaining == 0 {
        return Err(ErrorKind::TooManyRedirects);
    }
    match policy {
        RedirectPolicy::SameOrigin if !same_origin(base, &target) => Err(ErrorKind::InsecureRedirect),
        RedirectPolicy::NoLessSafe if base.scheme() == "https" && target.scheme() == "http" => {
            Err(ErrorKind::InsecureRedirect)
        }
        _ => Ok(target),
    }
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
}

impl Connection {
    pub(super) fn handle_redirect(&mut self, ch: ChannelId, reply_id: ReplyId, status: u16) {
        let chan = &self.channels[ch.0];
        let Some(pair) = chan.current.as_ref() else {
            return;
        };
        let policy = pair.request.redirect_policy();
        if policy == RedirectPolicy::Manual {
            self.run_queue.schedule(Task::StartNextRequest);
            return;
        }
        let Some(location) = self
            .replies
            .get(&reply_id)
            .and_then(|slot| slot.reply.header("location"))
            .map(str::to_string)
        else {
            self.run_queue.schedule(Task::StartNextRequest);
            return;
        };

        let target = match redirect_target(pair.request.url(), &location, policy, pair.request.redirect_count()) {
            Ok(target) => target,
            Err(kind) => {
                debug!(channel = %ch, reply = %reply_id, %location, ?kind, "redirect refused");
                let error = NetworkError::with_default_detail(kind, &self.host);
                self.emit_reply_error(ch, error);
                return;
            }
        };
        if let Some(slot) = self.replies.get_mut(&reply_id) {
            slot.reply.set_redirect_url(target.clone());
        }
        if matches!(status, 307 | 308) && !self.reset_upload_data(ch) {
            return;
        }

        if policy == RedirectPolicy::UserVerified {
            let allowed = match self.replies.get_mut(&reply_id) {
                Some(slot) => slot.handler.redirect_allowed(&slot.reply, &target),
                None => false,
            };
            if !allowed {
                debug!(channel = %ch, reply = %reply_id, %target, "redirect not allowed by handler");
                self.run_queue.schedule(Task::StartNextRequest);
                return;
            }
        }

        if !self.is_own_origin(&target) {
            // the caller decides whether to follow on another connection
            debug!(channel = %ch, reply = %reply_id, %target, "redirect to another origin");
            self.run_queue.schedule(Task::StartNextRequest);
            return;
        }

        let Some(mut pair) = self.channels[ch.0].current.take() else {
            return;
        };
        debug!(channel = %ch, reply = %reply_id, status, %target, "following redirect");
        if let Some(slot) = self.replies.get_mut(&reply_id) {
            slot.handler.redirected(&slot.reply, &target);
            slot.reply.set_url(target.clone());
            slot.reply.clear();
            slot.reply.channel = None;
        }
        pair.request.redirect_to(target, status);
        self.queue.requeue(pair);
        self.run_queue.schedule(Task::StartNextRequest);
    }

    fn is_own_origin(&self, url: &Url) -> bool {
        let scheme = if self.encrypted { "https" } else { "http" };
        url.scheme() == scheme
            && url.host_str().map_or(false, |h| {
                h.trim_start_matches('[').trim_end_matches(']').eq_ignore_ascii_case(&self.host)
            })
            && url.port_or_known_default() == Some(self.port)
    }
}
