/*
 * net.rs
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

//! TLS for channel transports: rustls client configuration and a stream that is
//! either plain TCP or TLS over TCP.
//!
//! Roots come from the platform store, with webpki-roots as fallback. Multiplexed
//! connections offer `h2` before `http/1.1` through ALPN.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = root_store.add(cert);
            }
        }
        Err(e) => debug!(error = %e, "native root certificates unavailable"),
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// Client config for one connection mode. With `offer_h2` the ALPN list is
/// (h2, http/1.1); otherwise only http/1.1 is offered.
pub fn http_client_config(offer_h2: bool) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    config.alpn_protocols = if offer_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Arc::new(config)
}

static H1_CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
static H2_CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

/// Shared connector; building a root store is not cheap.
pub fn default_connector(offer_h2: bool) -> TlsConnector {
    let cell = if offer_h2 { &H2_CONNECTOR } else { &H1_CONNECTOR };
    cell.get_or_init(|| TlsConnector::from(http_client_config(offer_h2)))
        .clone()
}

/// Byte stream of a channel.
pub enum ChannelStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ChannelStream {
    /// TLS handshake over an established TCP connection.
    pub async fn upgrade(tcp: TcpStream, host: &str, connector: &TlsConnector) -> io::Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(ChannelStream::Tls(Box::new(tls)))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ChannelStream::Plain(tcp) => tcp.peer_addr(),
            ChannelStream::Tls(tls) => tls.get_ref().0.peer_addr(),
        }
    }

    /// ALPN protocol agreed during the handshake.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            ChannelStream::Plain(_) => None,
            ChannelStream::Tls(tls) => tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
        }
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
