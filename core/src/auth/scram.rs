/*
 * scram.rs
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

//! SCRAM-SHA-256 over HTTP (RFC 7804, RFC 5802 message formats).
//!
//! One session covers one exchange: client-first, server-first (carried in a 401
//! challenge together with a session id), client-final, and the server signature
//! in `Authentication-Info`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScramStep {
    Initial,
    ClientFirstSent,
    ServerFirstReceived,
    ClientFinalSent,
}

#[derive(Debug)]
pub(crate) struct ScramSession {
    step: ScramStep,
    client_nonce: String,
    client_first_bare: String,
    sid: Option<String>,
    server_first: String,
    server_signature: Vec<u8>,
}

impl ScramSession {
    pub(crate) fn new() -> Self {
        Self {
            step: ScramStep::Initial,
            client_nonce: String::new(),
            client_first_bare: String::new(),
            sid: None,
            server_first: String::new(),
            server_signature: Vec::new(),
        }
    }

    pub(crate) fn step(&self) -> ScramStep {
        self.step
    }

    /// `data` attribute of the first Authorization header: base64 of gs2 header + client-first-bare.
    pub(crate) fn client_first(&mut self, user: &str) -> Result<String, AuthError> {
        self.client_nonce = generate_nonce()?;
        self.client_first_bare = format!("n={},r={}", sasl_name(user), self.client_nonce);
        self.step = ScramStep::ClientFirstSent;
        Ok(BASE64.encode(format!("n,,{}", self.client_first_bare)))
    }

    pub(crate) fn server_first(&mut self, sid: Option<&str>, data: &str) -> Result<(), AuthError> {
        if self.step != ScramStep::ClientFirstSent {
            return Err(AuthError::new("unexpected SCRAM server-first message"));
        }
        let decoded = BASE64
            .decode(data.trim())
            .map_err(|_| AuthError::new("invalid base64 in SCRAM server-first"))?;
        self.server_first =
            String::from_utf8(decoded).map_err(|_| AuthError::new("SCRAM server-first is not UTF-8"))?;
        self.sid = sid.map(str::to_string);
        self.step = ScramStep::ServerFirstReceived;
        Ok(())
    }

    /// Authorization value for the final client message.
    pub(crate) fn client_final(&mut self, password: &str) -> Result<String, AuthError> {
        if self.step != ScramStep::ServerFirstReceived {
            return Err(AuthError::new("SCRAM server-first not received"));
        }
        let (nonce, salt_b64, iterations) = parse_server_first(&self.server_first)?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(AuthError::new("server nonce must extend client nonce"));
        }
        let salt = BASE64
            .decode(salt_b64.as_bytes())
            .map_err(|_| AuthError::new("invalid salt base64"))?;

        let salted_password = hi(password, &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let server_key = hmac(&salted_password, b"Server Key")?;

        let client_final_no_proof = format!("c={},r={}", BASE64.encode("n,,"), nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, client_final_no_proof
        );
        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(x, y)| x ^ y)
            .collect();
        self.server_signature = hmac(&server_key, auth_message.as_bytes())?;
        self.step = ScramStep::ClientFinalSent;

        let message = format!("{},p={}", client_final_no_proof, BASE64.encode(client_proof));
        let data = BASE64.encode(message);
        Ok(match &self.sid {
            Some(sid) => format!("sid={}, data={}", sid, data),
            None => format!("data={}", data),
        })
    }

    /// Check the server signature from `Authentication-Info: sid=..., data=...`.
    pub(crate) fn verify_server_final(&self, data: &str) -> Result<(), AuthError> {
        if self.step != ScramStep::ClientFinalSent {
            return Err(AuthError::new("SCRAM client-final not sent"));
        }
        let decoded = BASE64
            .decode(data.trim())
            .map_err(|_| AuthError::new("invalid base64 in SCRAM server-final"))?;
        let text = String::from_utf8(decoded).map_err(|_| AuthError::new("SCRAM server-final is not UTF-8"))?;
        if let Some(err) = text.strip_prefix("e=") {
            return Err(AuthError::new(format!("server rejected authentication: {}", err)));
        }
        let verifier = text
            .split(',')
            .find_map(|part| part.trim().strip_prefix("v="))
            .ok_or_else(|| AuthError::new("missing v in SCRAM server-final"))?;
        let signature = BASE64
            .decode(verifier.as_bytes())
            .map_err(|_| AuthError::new("invalid server signature base64"))?;
        if signature != self.server_signature {
            return Err(AuthError::new("server signature mismatch"));
        }
        Ok(())
    }
}

fn generate_nonce() -> Result<String, AuthError> {
    let mut raw = [0u8; 18];
    getrandom::getrandom(&mut raw).map_err(|e| AuthError::new(format!("no randomness for nonce: {}", e)))?;
    Ok(BASE64.encode(raw))
}

fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

fn parse_server_first(input: &str) -> Result<(String, String, u32), AuthError> {
    let mut r = None;
    let mut s = None;
    let mut i = None;
    for part in input.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("r=") {
            r = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("s=") {
            s = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("i=") {
            i = Some(v.to_string());
        }
    }
    let r = r.ok_or_else(|| AuthError::new("missing r in server-first"))?;
    let s = s.ok_or_else(|| AuthError::new("missing s in server-first"))?;
    let i = i
        .ok_or_else(|| AuthError::new("missing i in server-first"))?
        .parse::<u32>()
        .map_err(|_| AuthError::new("invalid iteration count"))?;
    if i == 0 {
        return Err(AuthError::new("invalid iteration count"));
    }
    Ok((r, s, i))
}

fn hi(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out.to_vec()
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::new("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
