/*
 * writer.rs
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

//! Request line and header block for HTTP/1.1.

use crate::http::request::Request;

/// Serialize the request line, headers and the terminating blank line.
/// The request must already be prepared; the body, if any, follows separately.
/// A caching proxy gets the target in absolute form.
pub fn request_head(request: &Request, through_proxy: bool) -> Vec<u8> {
    let target = if through_proxy {
        request.absolute_uri()
    } else {
        request.uri()
    };
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method().as_str(), target);
    for (name, value) in request.headers().iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::http::request::RequestBuilder;

    #[test]
    fn head_in_wire_order() {
        let mut b = RequestBuilder::get("http://example.com/index.html?q=1").unwrap();
        b.header("Accept", "text/html");
        let mut req = b.build();
        req.prepare(&ConnectionConfig::default(), "example.com", false).unwrap();
        let head = String::from_utf8(request_head(&req, false)).unwrap();
        assert!(head.starts_with("GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: text/html\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(head.matches("\r\n\r\n").count(), 1);
    }

    #[test]
    fn absolute_target_for_a_caching_proxy() {
        let mut req = RequestBuilder::get("http://user:pw@example.com:8080/a?q=1#top")
            .unwrap()
            .build();
        req.prepare(&ConnectionConfig::default(), "example.com", true).unwrap();
        let head = String::from_utf8(request_head(&req, true)).unwrap();
        assert!(head.starts_with("GET http://example.com:8080/a?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Connection: Keep-Alive\r\n"));
        assert!(!head.contains("\r\nConnection:"));
    }
}
