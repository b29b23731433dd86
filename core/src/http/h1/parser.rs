/*
 * parser.rs
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

//! HTTP/1.x response push parser: status line, headers, body (Content-Length,
//! chunked, or delimited by connection close).

use bytes::Buf;
use bytes::BytesMut;

/// Callback for response events. The channel implements this and forwards to the reply.
pub trait H1ResponseHandler {
    fn status(&mut self, major: u8, minor: u8, code: u16, reason: &str);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: &[u8]);
    fn trailer(&mut self, name: &str, value: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Response complete; `reset` before parsing the next one.
    Idle,
    StatusLine,
    Headers,
    /// Headers done; the channel must call `set_body_mode`.
    HeadersComplete,
    Body,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    ChunkTrailer,
    /// Body runs until the peer closes the connection.
    UntilClose,
}

/// How the body of the current response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub &'static str);

/// Push parser for one response at a time. Feed bytes via `receive`; the handler is invoked
/// as complete tokens are parsed and consumed bytes are split off the front of the buffer.
pub struct ResponseParser {
    state: ParseState,
    remaining: u64,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StatusLine,
            remaining: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ParseState::StatusLine;
        self.remaining = 0;
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == b"\r\n")
    }

    fn take_line(buf: &mut BytesMut) -> Option<Result<String, ParseError>> {
        let end = Self::find_crlf(buf)?;
        let line = buf.split_to(end + 2);
        Some(
            std::str::from_utf8(&line[..end])
                .map(str::to_string)
                .map_err(|_| ParseError("header line is not UTF-8")),
        )
    }

    fn split_field(line: &str) -> Option<(&str, &str)> {
        let colon = line.find(':')?;
        Some((line[..colon].trim(), line[colon + 1..].trim()))
    }

    fn parse_status_line<H: H1ResponseHandler>(line: &str, handler: &mut H) -> Result<(), ParseError> {
        // HTTP/1.1 200 OK, or HTTP/1.1 200 without reason
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let version = version
            .strip_prefix("HTTP/")
            .ok_or(ParseError("status line does not start with HTTP/"))?;
        let mut digits = version.split('.');
        let major = digits
            .next()
            .and_then(|d| d.parse::<u8>().ok())
            .ok_or(ParseError("invalid HTTP major version"))?;
        let minor = digits.next().and_then(|d| d.parse::<u8>().ok()).unwrap_or(0);
        let code = parts
            .next()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .filter(|c| (100..1000).contains(c))
            .ok_or(ParseError("invalid status code"))?;
        let reason = parts.next().unwrap_or("").trim();
        handler.status(major, minor, code, reason);
        Ok(())
    }

    /// Consume and parse as much as possible from buf. Stops at HeadersComplete and at the
    /// end of a response so the channel can act before the next bytes are interpreted.
    pub fn receive<H: H1ResponseHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), ParseError> {
        while !buf.is_empty() {
            match self.state {
                ParseState::StatusLine => {
                    let line = match Self::take_line(buf) {
                        Some(line) => line?,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        // tolerate stray CRLF between responses
                        continue;
                    }
                    Self::parse_status_line(&line, handler)?;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line = match Self::take_line(buf) {
                        Some(line) => line?,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    if let Some((name, value)) = Self::split_field(&line) {
                        handler.header(name, value);
                    }
                }
                ParseState::HeadersComplete | ParseState::Idle => return Ok(()),
                ParseState::Body => {
                    let n = (self.remaining.min(buf.len() as u64)) as usize;
                    let chunk = buf.split_to(n);
                    handler.body_chunk(&chunk);
                    self.remaining -= n as u64;
                    if self.remaining == 0 {
                        self.state = ParseState::Idle;
                        return Ok(());
                    }
                }
                ParseState::UntilClose => {
                    let chunk = buf.split_to(buf.len());
                    handler.body_chunk(&chunk);
                }
                ParseState::ChunkSize => {
                    let line = match Self::take_line(buf) {
                        Some(line) => line?,
                        None => return Ok(()),
                    };
                    let hex = line.split(';').next().unwrap_or("").trim();
                    self.remaining =
                        u64::from_str_radix(hex, 16).map_err(|_| ParseError("invalid chunk size"))?;
                    self.state = if self.remaining == 0 {
                        ParseState::ChunkTrailer
                    } else {
                        ParseState::ChunkData
                    };
                }
                ParseState::ChunkData => {
                    let n = (self.remaining.min(buf.len() as u64)) as usize;
                    let chunk = buf.split_to(n);
                    handler.body_chunk(&chunk);
                    self.remaining -= n as u64;
                    if self.remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    }
                }
                ParseState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let line = match Self::take_line(buf) {
                        Some(line) => line?,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.state = ParseState::Idle;
                        return Ok(());
                    }
                    if let Some((name, value)) = Self::split_field(&line) {
                        handler.trailer(name, value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Called after headers are received (state HeadersComplete).
    pub fn set_body_mode(&mut self, mode: BodyMode) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        self.state = match mode {
            BodyMode::None | BodyMode::Length(0) => ParseState::Idle,
            BodyMode::Length(n) => {
                self.remaining = n;
                ParseState::Body
            }
            BodyMode::Chunked => ParseState::ChunkSize,
            BodyMode::UntilClose => ParseState::UntilClose,
        };
    }

    /// The peer closed the connection. Completes a body delimited by close; returns
    /// whether the response is now complete.
    pub fn finish_at_close(&mut self) -> bool {
        match self.state {
            ParseState::UntilClose | ParseState::Idle => {
                self.state = ParseState::Idle;
                true
            }
            _ => false,
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        status: Option<(u8, u8, u16, String)>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        trailers: Vec<(String, String)>,
    }

    impl H1ResponseHandler for Recorder {
        fn status(&mut self, major: u8, minor: u8, code: u16, reason: &str) {
            self.status = Some((major, minor, code, reason.to_string()));
        }
        fn header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }
        fn body_chunk(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
        fn trailer(&mut self, name: &str, value: &str) {
            self.trailers.push((name.to_string(), value.to_string()));
        }
    }

    #[test]
    fn content_length_response() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: x\r\n\r\nhelloNEXT"[..]);
        p.receive(&mut buf, &mut r).unwrap();
        assert_eq!(p.state(), ParseState::HeadersComplete);
        assert_eq!(r.status, Some((1, 1, 200, "OK".to_string())));
        assert_eq!(r.headers.len(), 2);
        p.set_body_mode(BodyMode::Length(5));
        p.receive(&mut buf, &mut r).unwrap();
        assert_eq!(p.state(), ParseState::Idle);
        assert_eq!(r.body, b"hello");
        assert_eq!(&buf[..], b"NEXT");
    }

    #[test]
    fn chunked_in_pieces() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
        p.receive(&mut buf, &mut r).unwrap();
        p.set_body_mode(BodyMode::Chunked);
        buf.extend_from_slice(b"4\r\nWi");
        p.receive(&mut buf, &mut r).unwrap();
        buf.extend_from_slice(b"ki\r\n5;ext=1\r\npedia\r\n0\r\nX-T: 1\r\n");
        p.receive(&mut buf, &mut r).unwrap();
        assert_eq!(p.state(), ParseState::ChunkTrailer);
        buf.extend_from_slice(b"\r\n");
        p.receive(&mut buf, &mut r).unwrap();
        assert_eq!(p.state(), ParseState::Idle);
        assert_eq!(r.body, b"Wikipedia");
        assert_eq!(r.trailers, vec![("X-T".to_string(), "1".to_string())]);
    }

    #[test]
    fn read_until_close() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nabc"[..]);
        p.receive(&mut buf, &mut r).unwrap();
        p.set_body_mode(BodyMode::UntilClose);
        p.receive(&mut buf, &mut r).unwrap();
        assert_eq!(r.body, b"abc");
        assert!(p.finish_at_close());
        assert_eq!(p.state(), ParseState::Idle);
    }

    #[test]
    fn no_body_mode() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\n\r\n"[..]);
        p.receive(&mut buf, &mut r).unwrap();
        p.set_body_mode(BodyMode::None);
        assert_eq!(p.state(), ParseState::Idle);
    }

    #[test]
    fn malformed_status_line() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let mut buf = BytesMut::from(&b"SMTP 220 hello\r\n"[..]);
        assert!(p.receive(&mut buf, &mut r).is_err());
    }

    #[test]
    fn truncated_length_body_is_not_complete_at_close() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
        p.receive(&mut buf, &mut r).unwrap();
        p.set_body_mode(BodyMode::Length(10));
        p.receive(&mut buf, &mut r).unwrap();
        assert!(!p.finish_at_close());
    }
}
