/*
 * error.rs
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

//! Error types: the terminal failure of a reply, socket-level errors reported by
//! transports, and the crate-level error for construction and configuration.

use std::fmt;
use std::io;

/// Kind of terminal failure delivered to a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    HostNotFound,
    ConnectionRefused,
    RemoteHostClosed,
    Timeout,
    ProxyAuthenticationRequired,
    AuthenticationRequired,
    /// Malformed response.
    ProtocolFailure,
    /// Bad redirect target or unsupported scheme.
    ProtocolUnknown,
    SslHandshakeFailed,
    TooManyRedirects,
    InsecureRedirect,
    /// Internal failure; the message explains it.
    Unspecified,
}

impl ErrorKind {
    /// Default human readable detail for this kind. `host` is used by HostNotFound.
    pub fn detail(self, host: &str) -> String {
        match self {
            ErrorKind::HostNotFound => format!("Host {} not found", host),
            ErrorKind::ConnectionRefused => "Connection refused".to_string(),
            ErrorKind::RemoteHostClosed => "Connection closed".to_string(),
            ErrorKind::Timeout => "Socket operation timed out".to_string(),
            ErrorKind::ProxyAuthenticationRequired => "Proxy requires authentication".to_string(),
            ErrorKind::AuthenticationRequired => "Host requires authentication".to_string(),
            ErrorKind::ProtocolFailure => "Data corrupted".to_string(),
            ErrorKind::ProtocolUnknown => "Unknown protocol specified".to_string(),
            ErrorKind::SslHandshakeFailed => "SSL handshake failed".to_string(),
            ErrorKind::TooManyRedirects => "Too many redirects".to_string(),
            ErrorKind::InsecureRedirect => "Insecure redirect".to_string(),
            ErrorKind::Unspecified => "Unknown error".to_string(),
        }
    }
}

/// Terminal failure of a reply: a kind plus a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct NetworkError {
    kind: ErrorKind,
    message: String,
}

impl NetworkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error with the default detail for `kind`.
    pub fn with_default_detail(kind: ErrorKind, host: &str) -> Self {
        Self::new(kind, kind.detail(host))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Socket-level error reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    HostNotFound,
    ConnectionRefused,
    RemoteHostClosed,
    Timeout,
    SslHandshakeFailed,
    ProxyAuthenticationRequired,
    ProxyConnectionClosed,
    ProxyConnectionTimeout,
    Other(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::HostNotFound => write!(f, "host not found"),
            SocketError::ConnectionRefused => write!(f, "connection refused"),
            SocketError::RemoteHostClosed => write!(f, "remote host closed the connection"),
            SocketError::Timeout => write!(f, "socket operation timed out"),
            SocketError::SslHandshakeFailed => write!(f, "TLS handshake failed"),
            SocketError::ProxyAuthenticationRequired => write!(f, "proxy requires authentication"),
            SocketError::ProxyConnectionClosed => write!(f, "proxy connection closed"),
            SocketError::ProxyConnectionTimeout => write!(f, "proxy connection timed out"),
            SocketError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl SocketError {
    /// Map an I/O error from a real socket.
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => SocketError::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SocketError::RemoteHostClosed,
            io::ErrorKind::TimedOut => SocketError::Timeout,
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => SocketError::HostNotFound,
            _ => SocketError::Other(e.to_string()),
        }
    }
}

/// Crate-level error for construction, configuration and I/O outside the event loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("URL has no host: {0}")]
    MissingHost(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("XML error: {0}")]
    Xml(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
