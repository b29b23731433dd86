/*
 * lib.rs
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

//! Smistatore core: an HTTP connection manager.
//!
//! A `Connection` multiplexes many logical requests over a bounded pool of
//! channels to one host. It races IPv4 against IPv6, pipelines idempotent GETs,
//! answers authentication challenges, follows same-origin redirects and recovers
//! from dropped connections without losing or duplicating requests.
//!
//! The connection itself does no I/O. `runtime::Client` wires it to tokio sockets,
//! DNS and timers; tests drive it with scripted collaborators instead.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod net;
pub mod runtime;
pub mod transport;

pub use auth::{Authenticator, Phase};
pub use config::{BearerType, ConnectionConfig, ConnectionType, HttpProxy};
pub use connection::{ChannelState, Connection, NetworkLayerState};
pub use error::{Error, ErrorKind, NetworkError, Result, SocketError};
pub use http::{
    BytesBody, HeaderList, Method, Priority, RedirectPolicy, Reply, ReplyBuffer, ReplyHandler, ReplyId,
    Request, RequestBuilder, StreamBody, UploadBody,
};
pub use runtime::Client;
pub use transport::{ChannelId, Collaborators, Event, NetworkLayer, SocketState};
