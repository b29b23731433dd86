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

//! HTTP authentication: challenge parsing and the per-channel authenticator.
//!
//! Basic and Digest are single round trip and may be sent preemptively once known.
//! SCRAM-SHA-256 needs two round trips on the same connection, so its session is
//! dropped whenever the channel reconnects. NTLM and Negotiate are recognised
//! but not supported.

mod digest;
mod scram;

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

use digest::DigestChallenge;
use scram::{ScramSession, ScramStep};

/// Failure inside an authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    message: String,
}

impl AuthError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One challenge from a WWW-Authenticate or Proxy-Authenticate header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    /// Parameter value by name (case-insensitive).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Split a header value into challenges. A header may carry several challenges,
/// e.g. `Basic realm="a", Digest realm="b", nonce="n"`. Unquoted values run to the
/// next comma or whitespace and may contain `=` (base64 padding).
pub fn parse_challenges(value: &str) -> Vec<Challenge> {
    let bytes = value.as_bytes();
    let mut out: Vec<Challenge> = Vec::new();
    let mut pos = 0;
    let skip = |pos: &mut usize, also_comma: bool| {
        while *pos < bytes.len() && (bytes[*pos] == b' ' || bytes[*pos] == b'\t' || (also_comma && bytes[*pos] == b',')) {
            *pos += 1;
        }
    };
    loop {
        skip(&mut pos, true);
        if pos >= bytes.len() {
            break;
        }
        let start = pos;
        while pos < bytes.len() && !matches!(bytes[pos], b' ' | b'\t' | b',' | b'=') {
            pos += 1;
        }
        let token = &value[start..pos];
        let mut look = pos;
        skip(&mut look, false);
        let is_param = look < bytes.len() && bytes[look] == b'=' && !out.is_empty();
        let is_token68 = is_param && {
            let after = look + 1;
            after >= bytes.len() || matches!(bytes[after], b'=' | b',' | b' ' | b'\t')
        };
        if is_param && !is_token68 {
            pos = look + 1;
            skip(&mut pos, false);
            let val = if pos < bytes.len() && bytes[pos] == b'"' {
                pos += 1;
                let mut v = String::new();
                while pos < bytes.len() && bytes[pos] != b'"' {
                    if bytes[pos] == b'\\' && pos + 1 < bytes.len() {
                        pos += 1;
                    }
                    let ch_len = value[pos..].chars().next().map_or(1, char::len_utf8);
                    v.push_str(&value[pos..pos + ch_len]);
                    pos += ch_len;
                }
                pos += 1;
                v
            } else {
                let vstart = pos;
                while pos < bytes.len() && !matches!(bytes[pos], b',' | b' ' | b'\t') {
                    pos += 1;
                }
                value[vstart..pos].to_string()
            };
            if let Some(current) = out.last_mut() {
                current.params.push((token.to_string(), val));
            }
        } else if is_token68 {
            pos = look;
            while pos < bytes.len() && bytes[pos] == b'=' {
                pos += 1;
            }
            if let Some(current) = out.last_mut() {
                current.params.push((String::new(), value[start..pos].to_string()));
            }
        } else if !token.is_empty() {
            out.push(Challenge {
                scheme: token.to_string(),
                params: Vec::new(),
            });
        } else {
            // stray '='
            pos += 1;
        }
    }
    out
}

/// Where an authenticator is in its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Credentials known (or none needed yet); the next request carries them.
    Start,
    /// Multi-round-trip exchange in progress on this channel.
    Negotiating,
    /// Response computed and sent, or nothing more can be done without new credentials.
    Done,
}

#[derive(Debug)]
pub(crate) enum AuthMethod {
    None,
    Basic,
    Digest(DigestChallenge),
    Scram(ScramSession),
}

impl AuthMethod {
    fn rank(&self) -> u8 {
        match self {
            AuthMethod::None => 0,
            AuthMethod::Basic => 1,
            AuthMethod::Digest(_) => 2,
            AuthMethod::Scram(_) => 3,
        }
    }
}

/// Credentials and scheme state of one channel, shown to the reply handler when
/// the server asks for authentication. Changing user or password restarts the exchange.
#[derive(Debug)]
pub struct Authenticator {
    user: String,
    password: String,
    realm: String,
    method: AuthMethod,
    phase: Phase,
    has_failed: bool,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            realm: String::new(),
            method: AuthMethod::None,
            phase: Phase::Start,
            has_failed: false,
        }
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn set_user(&mut self, user: &str) {
        if self.user != user {
            self.user = user.to_string();
            self.phase = Phase::Start;
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, password: &str) {
        if self.password != password {
            self.password = password.to_string();
            self.phase = Phase::Start;
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Set when credentials already sent on this connection were rejected.
    pub fn has_failed(&self) -> bool {
        self.has_failed
    }

    /// Name of the selected scheme.
    pub fn scheme(&self) -> Option<&'static str> {
        match self.method {
            AuthMethod::None => None,
            AuthMethod::Basic => Some("Basic"),
            AuthMethod::Digest(_) => Some("Digest"),
            AuthMethod::Scram(_) => Some("SCRAM-SHA-256"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.method, AuthMethod::None) && self.user.is_empty() && self.password.is_empty()
    }

    pub(crate) fn has_method(&self) -> bool {
        !matches!(self.method, AuthMethod::None)
    }

    /// Connection-bound scheme; its state cannot move to another channel.
    pub(crate) fn is_negotiating_method(&self) -> bool {
        matches!(self.method, AuthMethod::Scram(_))
    }

    pub(crate) fn mark_failed(&mut self) {
        self.has_failed = true;
        self.phase = Phase::Done;
    }

    /// Adopt the best supported challenge from a 401/407 response.
    pub(crate) fn parse_challenge(&mut self, challenges: &[Challenge]) {
        let mut best: Option<(AuthMethod, &Challenge)> = None;
        for challenge in challenges {
            let candidate = match challenge.scheme.to_ascii_lowercase().as_str() {
                "basic" => AuthMethod::Basic,
                "digest" => match DigestChallenge::from_challenge(challenge) {
                    Some(d) => AuthMethod::Digest(d),
                    None => continue,
                },
                "scram-sha-256" => AuthMethod::Scram(ScramSession::new()),
                "ntlm" | "negotiate" => {
                    debug!(scheme = %challenge.scheme, "unsupported authentication scheme");
                    continue;
                }
                _ => continue,
            };
            if best.as_ref().map_or(true, |(m, _)| candidate.rank() > m.rank()) {
                best = Some((candidate, challenge));
            }
        }
        let Some((candidate, challenge)) = best else {
            self.method = AuthMethod::None;
            return;
        };

        let no_credentials = self.user.is_empty() && self.password.is_empty();
        match candidate {
            AuthMethod::Basic => {
                if !matches!(self.method, AuthMethod::Basic) {
                    self.method = AuthMethod::Basic;
                }
                self.set_realm(challenge.param("realm").unwrap_or(""));
                if no_credentials {
                    self.phase = Phase::Done;
                }
            }
            AuthMethod::Digest(fresh) => {
                let stale = fresh.stale;
                let realm = fresh.realm.clone();
                match &mut self.method {
                    AuthMethod::Digest(current) => current.update(fresh),
                    other => *other = AuthMethod::Digest(fresh),
                }
                self.set_realm(&realm);
                if stale {
                    self.phase = Phase::Start;
                    if let AuthMethod::Digest(current) = &mut self.method {
                        current.reset_nonce_count();
                    }
                }
                if no_credentials {
                    self.phase = Phase::Done;
                }
            }
            AuthMethod::Scram(fresh) => self.parse_scram(challenge, fresh, no_credentials),
            AuthMethod::None => {}
        }
    }

    fn parse_scram(&mut self, challenge: &Challenge, fresh: ScramSession, no_credentials: bool) {
        if let Some(realm) = challenge.param("realm") {
            self.set_realm(realm);
        }
        match challenge.param("data") {
            None => {
                let started = matches!(&self.method, AuthMethod::Scram(s) if s.step() != ScramStep::Initial);
                self.method = AuthMethod::Scram(fresh);
                self.phase = if no_credentials || started {
                    Phase::Done
                } else {
                    Phase::Start
                };
            }
            Some(data) => {
                let sid = challenge.param("sid");
                let accepted = match &mut self.method {
                    AuthMethod::Scram(session) if self.phase == Phase::Negotiating => {
                        session.server_first(sid, data).is_ok()
                    }
                    _ => false,
                };
                if !accepted {
                    self.method = AuthMethod::Scram(fresh);
                    self.mark_failed();
                }
            }
        }
    }

    fn set_realm(&mut self, realm: &str) {
        if self.realm != realm {
            if self.phase == Phase::Done {
                self.phase = Phase::Start;
            }
            self.realm = realm.to_string();
        }
    }

    /// Value for the Authorization (or Proxy-Authorization) header of the next request.
    pub(crate) fn calculate_response(&mut self, method: &str, uri: &str) -> Option<String> {
        match &mut self.method {
            AuthMethod::None => None,
            AuthMethod::Basic => {
                self.phase = Phase::Done;
                let credentials = format!("{}:{}", self.user, self.password);
                Some(format!("Basic {}", BASE64.encode(credentials)))
            }
            AuthMethod::Digest(challenge) => {
                let value = challenge.response(&self.user, &self.password, method, uri);
                self.phase = Phase::Done;
                value.ok()
            }
            AuthMethod::Scram(session) => match session.step() {
                ScramStep::Initial => {
                    let data = session.client_first(&self.user).ok()?;
                    self.phase = Phase::Negotiating;
                    Some(format!("SCRAM-SHA-256 data={}", data))
                }
                ScramStep::ServerFirstReceived => {
                    let value = session.client_final(&self.password);
                    match value {
                        Ok(v) => Some(format!("SCRAM-SHA-256 {}", v)),
                        Err(e) => {
                            debug!(error = %e, "SCRAM client-final failed");
                            self.mark_failed();
                            None
                        }
                    }
                }
                ScramStep::ClientFirstSent | ScramStep::ClientFinalSent => None,
            },
        }
    }

    /// Whether an exchange is waiting for the server's final message.
    pub(crate) fn awaiting_server_final(&self) -> bool {
        matches!(&self.method, AuthMethod::Scram(s) if s.step() == ScramStep::ClientFinalSent)
    }

    /// Check `Authentication-Info` after the exchange succeeded. The session is then
    /// spent; a later challenge starts a fresh one with the same credentials.
    pub(crate) fn complete_exchange(&mut self, info: Option<&str>) -> Result<(), AuthError> {
        let AuthMethod::Scram(session) = &self.method else {
            return Ok(());
        };
        let result = match info.and_then(|v| parse_challenges(&format!("x {}", v)).pop()) {
            Some(parsed) => match parsed.param("data") {
                Some(data) => session.verify_server_final(data),
                None => Err(AuthError::new("Authentication-Info carries no data")),
            },
            None => Err(AuthError::new("missing Authentication-Info")),
        };
        self.method = AuthMethod::Scram(ScramSession::new());
        match result {
            Ok(()) => {
                self.phase = Phase::Done;
                Ok(())
            }
            Err(e) => {
                self.mark_failed();
                Err(e)
            }
        }
    }

    /// A new connection is being made for this channel.
    pub(crate) fn reset_for_connection(&mut self) {
        self.has_failed = false;
        if let AuthMethod::Scram(session) = &self.method {
            if session.step() != ScramStep::Initial {
                self.method = AuthMethod::Scram(ScramSession::new());
                self.phase = Phase::Start;
            }
        }
        if self.phase == Phase::Done {
            self.phase = Phase::Start;
        }
    }

    /// Credentials (and a single-round-trip scheme) for a sibling channel.
    pub(crate) fn copy_to(&self, other: &mut Authenticator) {
        other.set_user(&self.user);
        other.set_password(&self.password);
        if matches!(other.method, AuthMethod::None) {
            match &self.method {
                AuthMethod::Basic => other.method = AuthMethod::Basic,
                AuthMethod::Digest(d) => other.method = AuthMethod::Digest(d.clone()),
                AuthMethod::None | AuthMethod::Scram(_) => return,
            }
            other.realm = self.realm.clone();
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Start => "start",
            Phase::Negotiating => "negotiating",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}
