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

//! HTTP message model: requests, replies, headers and the HTTP/1.1 codec.

pub(crate) mod decode;
pub mod h1;
pub mod headers;
pub mod reply;
pub mod request;

pub use headers::HeaderList;
pub use reply::{BufferedReply, Reply, ReplyBuffer, ReplyHandler, ReplyId};
pub use request::{
    BytesBody, Method, Priority, RedirectPolicy, Request, RequestBuilder, StreamBody, UploadBody,
    DEFAULT_MAX_REDIRECTS,
};
