/*
 * auth_redirect.rs
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

//! Authentication challenges and redirect handling.

mod common;

use common::{ok, single_channel, Harness};
use smistatore_core::{ChannelId, ConnectionConfig, ErrorKind, Phase, RedirectPolicy, StreamBody};

const BASIC_CHALLENGE: &str =
    "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"vault\"\r\nContent-Length: 6\r\n\r\ndenied";

fn two_channels() -> ConnectionConfig {
    ConnectionConfig {
        channel_count: 2,
        ..ConnectionConfig::default()
    }
}

fn with_policy(h: &Harness, path: &str, policy: RedirectPolicy) -> smistatore_core::Request {
    let mut b = h.request(path);
    b.redirect_policy(policy);
    b.build()
}

#[test]
fn basic_challenge_answered_and_shared() {
    let mut h = Harness::new(two_channels());
    let (mut handler, reply) = h.handler("secret");
    handler.credentials = Some(("user".to_string(), "pw".to_string()));
    let request = h.request("/secret").build();
    h.conn.submit(request, Box::new(handler));
    h.connect(0);

    h.respond(0, BASIC_CHALLENGE);
    assert_eq!(*h.auth_prompts.borrow(), 1);
    // resent on the same connection with credentials
    assert_eq!(h.socket(0).connects.len(), 1);
    assert_eq!(h.request_lines(0), vec!["GET /secret HTTP/1.1", "GET /secret HTTP/1.1"]);
    assert!(h.sent(0).contains("Authorization: Basic dXNlcjpwdw==\r\n"));
    // the 401 itself never reached the handler
    assert_eq!(reply.status(), 0);
    assert!(reply.body().is_empty());

    let sibling = h.conn.authenticator(ChannelId(1)).unwrap();
    assert_eq!(sibling.user(), "user");
    assert_eq!(sibling.password(), "pw");
    assert_eq!(sibling.realm(), "vault");

    h.respond(0, &ok("treasure"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body(), b"treasure".to_vec());
}

#[test]
fn challenge_without_credentials_gives_up() {
    let mut h = Harness::new(single_channel());
    let (_, reply) = h.get("secret", "/secret");
    h.connect(0);
    h.respond(0, BASIC_CHALLENGE);

    assert_eq!(*h.auth_prompts.borrow(), 1);
    assert_eq!(reply.error().unwrap().kind(), ErrorKind::AuthenticationRequired);
    // the held back 401 content is delivered when giving up
    assert_eq!(reply.status(), 401);
    assert_eq!(reply.body(), b"denied".to_vec());
    assert_eq!(h.request_lines(0).len(), 1);
    assert!(h.conn.authenticator(ChannelId(0)).unwrap().is_null());
}

#[test]
fn rejected_credentials_ask_again() {
    let mut h = Harness::new(single_channel());
    let (mut handler, reply) = h.handler("secret");
    handler.credentials = Some(("user".to_string(), "wrong".to_string()));
    let request = h.request("/secret").build();
    h.conn.submit(request, Box::new(handler));
    h.connect(0);

    h.respond(0, BASIC_CHALLENGE);
    assert_eq!(h.request_lines(0).len(), 2);
    // same credentials again: the handler is asked, nothing changes, give up
    h.respond(0, BASIC_CHALLENGE);
    assert_eq!(*h.auth_prompts.borrow(), 2);
    assert_eq!(reply.error().unwrap().kind(), ErrorKind::AuthenticationRequired);
    assert_eq!(h.request_lines(0).len(), 2);
}

#[test]
fn challenge_cannot_resend_a_streamed_upload() {
    let mut h = Harness::new(single_channel());
    let (mut handler, reply) = h.handler("upload");
    handler.credentials = Some(("user".to_string(), "pw".to_string()));
    let mut b = smistatore_core::RequestBuilder::post(&h.url("/upload")).unwrap();
    b.body(StreamBody::with_size(std::io::Cursor::new(b"abc".to_vec()), 3));
    let request = b.build();
    h.conn.submit(request, Box::new(handler));
    h.connect(0);
    assert!(h.sent(0).ends_with("\r\n\r\nabc"));

    h.respond(0, BASIC_CHALLENGE);
    let error = reply.error().expect("reply should have failed");
    assert_eq!(error.kind(), ErrorKind::Unspecified);
    assert_eq!(error.message(), "Cannot resend the request: its upload body cannot be rewound");
    assert_eq!(h.order(), vec!["upload!"]);
    assert_eq!(h.request_lines(0).len(), 1);
    assert!(!h.conn.has_pending_replies());
}

#[test]
fn request_without_credentials_flag_is_not_resent() {
    let mut h = Harness::new(single_channel());
    let (mut handler, reply) = h.handler("secret");
    handler.credentials = Some(("user".to_string(), "pw".to_string()));
    let mut b = h.request("/secret");
    b.with_credentials(false);
    let request = b.build();
    h.conn.submit(request, Box::new(handler));
    h.connect(0);
    h.respond(0, BASIC_CHALLENGE);

    assert_eq!(reply.error().unwrap().kind(), ErrorKind::AuthenticationRequired);
    assert_eq!(h.request_lines(0).len(), 1);
}

#[test]
fn unsupported_scheme_delivers_the_401() {
    let mut h = Harness::new(single_channel());
    let (_, reply) = h.get("secret", "/secret");
    h.connect(0);
    h.respond(
        0,
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: NTLM\r\nContent-Length: 2\r\n\r\nno",
    );
    assert_eq!(*h.auth_prompts.borrow(), 0);
    assert_eq!(reply.error().unwrap().kind(), ErrorKind::AuthenticationRequired);
    assert_eq!(reply.body(), b"no".to_vec());
}

#[test]
fn userinfo_credentials_are_sent_after_the_challenge() {
    let mut h = Harness::new(two_channels());
    let url = h.url("/secret").replace("http://", "http://alice:s%20cret@");
    let request = smistatore_core::RequestBuilder::get(&url).unwrap().build();
    let (_, reply) = h.submit("secret", request);
    h.connect(0);
    assert!(!h.sent(0).contains("Authorization"));
    assert_eq!(h.conn.authenticator(ChannelId(1)).unwrap().user(), "alice");

    h.respond(0, BASIC_CHALLENGE);
    assert_eq!(*h.auth_prompts.borrow(), 0);
    // alice:s cret
    assert!(h.sent(0).contains("Authorization: Basic YWxpY2U6cyBjcmV0\r\n"));
    h.respond(0, &ok("in"));
    assert_eq!(reply.body(), b"in".to_vec());
}

#[test]
fn scram_state_stays_on_its_channel() {
    let mut h = Harness::new(two_channels());
    let (mut handler, _reply) = h.handler("secret");
    handler.credentials = Some(("user".to_string(), "pencil".to_string()));
    let request = h.request("/secret").build();
    h.conn.submit(request, Box::new(handler));
    h.connect(0);

    h.respond(
        0,
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: SCRAM-SHA-256 realm=\"vault\"\r\nContent-Length: 0\r\n\r\n",
    );
    assert!(h.sent(0).contains("Authorization: SCRAM-SHA-256 data="));
    let own = h.conn.authenticator(ChannelId(0)).unwrap();
    assert_eq!(own.scheme(), Some("SCRAM-SHA-256"));
    assert_eq!(own.phase(), Phase::Negotiating);
    let sibling = h.conn.authenticator(ChannelId(1)).unwrap();
    assert_eq!(sibling.user(), "");
    assert_eq!(sibling.scheme(), None);
}

#[test]
fn manual_policy_delivers_the_redirect() {
    let mut h = Harness::new(single_channel());
    let (_, reply) = h.get("old", "/old");
    h.connect(0);
    h.respond(0, "HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n");

    assert_eq!(reply.status(), 302);
    assert!(reply.error().is_none());
    assert!(reply.snapshot().redirect_url.is_none());
    assert_eq!(h.request_lines(0).len(), 1);
}

#[test]
fn same_origin_redirect_followed_on_the_connection() {
    let mut h = Harness::new(single_channel());
    let request = with_policy(&h, "/old", RedirectPolicy::NoLessSafe);
    let (_, reply) = h.submit("old", request);
    h.connect(0);
    h.respond(0, "HTTP/1.1 301 Moved\r\nLocation: /new\r\nContent-Length: 5\r\n\r\nmoved");

    assert_eq!(h.request_lines(0), vec!["GET /old HTTP/1.1", "GET /new HTTP/1.1"]);
    assert_eq!(reply.snapshot().redirects.len(), 1);
    assert_eq!(reply.snapshot().redirects[0].path(), "/new");
    assert!(reply.body().is_empty());

    h.respond(0, &ok("arrived"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body(), b"arrived".to_vec());
    assert_eq!(h.order(), vec!["old"]);
}

#[test]
fn see_other_turns_post_into_get() {
    let mut h = Harness::new(single_channel());
    let mut b = smistatore_core::RequestBuilder::post(&h.url("/form")).unwrap();
    b.header("Content-Type", "text/plain");
    b.body_slice(b"x=1");
    b.redirect_policy(RedirectPolicy::NoLessSafe);
    let request = b.build();
    let (_, reply) = h.submit("form", request);
    h.connect(0);
    h.respond(0, "HTTP/1.1 303 See Other\r\nLocation: /done\r\nContent-Length: 0\r\n\r\n");

    let sent = h.sent(0);
    assert!(sent.starts_with("POST /form HTTP/1.1\r\n"));
    // the GET head follows the POST body directly
    let second = sent.split("x=1GET /done HTTP/1.1\r\n").nth(1).unwrap();
    assert!(!second.contains("Content-Length"));
    assert!(!second.contains("Content-Type"));
    h.respond(0, &ok("ok"));
    assert_eq!(reply.body(), b"ok".to_vec());
}

#[test]
fn cross_origin_redirect_is_left_to_the_caller() {
    let mut h = Harness::new(single_channel());
    let request = with_policy(&h, "/old", RedirectPolicy::NoLessSafe);
    let (_, reply) = h.submit("old", request);
    h.connect(0);
    h.respond(
        0,
        "HTTP/1.1 302 Found\r\nLocation: https://elsewhere.test/new\r\nContent-Length: 4\r\n\r\ngone",
    );

    assert!(reply.error().is_none());
    assert_eq!(reply.status(), 302);
    assert_eq!(reply.body(), b"gone".to_vec());
    let target = reply.snapshot().redirect_url.unwrap();
    assert_eq!(target.as_str(), "https://elsewhere.test/new");
    assert!(reply.snapshot().redirects.is_empty());
    assert_eq!(h.request_lines(0).len(), 1);
}

#[test]
fn same_origin_policy_refuses_other_hosts() {
    let mut h = Harness::new(single_channel());
    let request = with_policy(&h, "/old", RedirectPolicy::SameOrigin);
    let (_, reply) = h.submit("old", request);
    h.connect(0);
    h.respond(0, "HTTP/1.1 302 Found\r\nLocation: http://elsewhere.test/\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(reply.error().unwrap().kind(), ErrorKind::InsecureRedirect);
}

#[test]
fn redirect_budget_runs_out() {
    let mut h = Harness::new(single_channel());
    let mut b = h.request("/loop");
    b.redirect_policy(RedirectPolicy::NoLessSafe);
    b.max_redirects(1);
    let request = b.build();
    let (_, reply) = h.submit("loop", request);
    h.connect(0);
    let again = "HTTP/1.1 302 Found\r\nLocation: /loop\r\nContent-Length: 0\r\n\r\n";
    h.respond(0, again);
    assert_eq!(h.request_lines(0).len(), 2);
    h.respond(0, again);
    assert_eq!(reply.error().unwrap().kind(), ErrorKind::TooManyRedirects);
}

#[test]
fn unsupported_redirect_scheme() {
    let mut h = Harness::new(single_channel());
    let request = with_policy(&h, "/old", RedirectPolicy::NoLessSafe);
    let (_, reply) = h.submit("old", request);
    h.connect(0);
    h.respond(0, "HTTP/1.1 302 Found\r\nLocation: ftp://files.test/x\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(reply.error().unwrap().kind(), ErrorKind::ProtocolUnknown);
}

#[test]
fn user_verified_redirect_needs_consent() {
    let mut h = Harness::new(single_channel());
    let (handler, refused) = h.handler("refused");
    let request = with_policy(&h, "/a", RedirectPolicy::UserVerified);
    h.conn.submit(request, Box::new(handler));
    h.connect(0);
    h.respond(0, "HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n");
    assert!(refused.error().is_none());
    assert_eq!(refused.snapshot().redirect_url.unwrap().path(), "/b");
    assert_eq!(h.request_lines(0).len(), 1);

    let (mut handler, allowed) = h.handler("allowed");
    handler.allow_redirects = true;
    let request = with_policy(&h, "/c", RedirectPolicy::UserVerified);
    h.conn.submit(request, Box::new(handler));
    h.respond(0, "HTTP/1.1 302 Found\r\nLocation: /d\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(h.request_lines(0).last().unwrap(), "GET /d HTTP/1.1");
    h.respond(0, &ok("d"));
    assert_eq!(allowed.body(), b"d".to_vec());
}
