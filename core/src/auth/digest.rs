/*
 * digest.rs
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

//! HTTP Digest access authentication (RFC 7616): MD5 and SHA-256, with and
//! without `-sess`, qop=auth.

use md5::Md5;
use sha2::{Digest, Sha256};

use super::{AuthError, Challenge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "MD5-SESS" => Some(DigestAlgorithm::Md5Sess),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Some(DigestAlgorithm::Sha256Sess),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash(self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => hex(&Md5::digest(data.as_bytes())),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => hex(&Sha256::digest(data.as_bytes())),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parameters of a Digest challenge plus the nonce count for it.
#[derive(Debug, Clone)]
pub(crate) struct DigestChallenge {
    pub(crate) realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
    qop_auth: bool,
    pub(crate) stale: bool,
    nonce_count: u32,
}

impl DigestChallenge {
    /// None when the algorithm is not supported or no nonce was given.
    pub(crate) fn from_challenge(challenge: &Challenge) -> Option<Self> {
        let algorithm = match challenge.param("algorithm") {
            Some(name) => DigestAlgorithm::from_name(name)?,
            None => DigestAlgorithm::Md5,
        };
        let nonce = challenge.param("nonce")?.to_string();
        let qop = challenge.param("qop");
        let qop_auth = qop.map_or(false, |q| q.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")));
        if qop.is_some() && !qop_auth {
            // auth-int only
            return None;
        }
        Some(Self {
            realm: challenge.param("realm").unwrap_or("").to_string(),
            nonce,
            opaque: challenge.param("opaque").map(str::to_string),
            algorithm,
            qop_auth,
            stale: challenge
                .param("stale")
                .map_or(false, |s| s.eq_ignore_ascii_case("true")),
            nonce_count: 0,
        })
    }

    /// Adopt a fresh challenge. Keeps the nonce count when the server reissues the same nonce.
    pub(crate) fn update(&mut self, next: DigestChallenge) {
        let count = if next.nonce == self.nonce && !next.stale {
            self.nonce_count
        } else {
            0
        };
        *self = next;
        self.nonce_count = count;
    }

    pub(crate) fn reset_nonce_count(&mut self) {
        self.nonce_count = 0;
    }

    /// Authorization header value for one request.
    pub(crate) fn response(
        &mut self,
        user: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> Result<String, AuthError> {
        let cnonce = client_nonce()?;
        Ok(self.response_with_cnonce(user, password, method, uri, &cnonce))
    }

    fn response_with_cnonce(&mut self, user: &str, password: &str, method: &str, uri: &str, cnonce: &str) -> String {
        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);
        let alg = self.algorithm;
        let mut ha1 = alg.hash(&format!("{}:{}:{}", user, self.realm, password));
        if alg.is_session() {
            ha1 = alg.hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = alg.hash(&format!("{}:{}", method, uri));
        let response = if self.qop_auth {
            alg.hash(&format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))
        } else {
            alg.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            quote(user),
            quote(&self.realm),
            quote(&self.nonce),
            quote(uri),
            alg.as_str(),
            response
        );
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", quote(opaque)));
        }
        if self.qop_auth {
            value.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        value
    }
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn client_nonce() -> Result<String, AuthError> {
    let mut raw = [0u8; 8];
    getrandom::getrandom(&mut raw).map_err(|e| AuthError::new(format!("no randomness for cnonce: {}", e)))?;
    Ok(hex(&raw))
}
