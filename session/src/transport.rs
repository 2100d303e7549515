//! Byte-channel transports for sessions.
//!
//! The session layer consumes a narrow stream contract: ordered byte
//! delivery over TCP, TLS-over-TCP, or a UNIX domain socket. Everything
//! above the stream (framing, dispatch, lifecycle) lives in the session
//! modules.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Unified stream type over the supported transports.
pub enum IoStream {
    /// Plain TCP stream.
    Plain(TcpStream),
    /// UNIX domain socket stream.
    #[cfg(unix)]
    Unix(UnixStream),
    /// Server-side TLS stream.
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client-side TLS stream.
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Describe the remote endpoint for logging.
    pub fn peer_label(&self) -> String {
        match self {
            IoStream::Plain(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            #[cfg(unix)]
            IoStream::Unix(_) => "uds".to_string(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream
                .get_ref()
                .0
                .peer_addr()
                .map(|a| format!("tls:{a}"))
                .unwrap_or_else(|_| "tls:unknown".to_string()),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream
                .get_ref()
                .0
                .peer_addr()
                .map(|a| format!("tls:{a}"))
                .unwrap_or_else(|_| "tls:unknown".to_string()),
        }
    }
}

/// Create a TCP listener bound to the given address.
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address.
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Create a UNIX domain socket listener bound to the given path.
#[cfg(unix)]
pub fn listen_uds(path: &std::path::Path) -> tokio::io::Result<UnixListener> {
    UnixListener::bind(path)
}

/// Connect to a UNIX domain socket.
#[cfg(unix)]
pub async fn connect_uds(path: &std::path::Path) -> tokio::io::Result<UnixStream> {
    UnixStream::connect(path).await
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS transport built on rustls.
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::debug;

    /// Create a TLS server configuration from PEM material.
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert_results: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
        let certs = cert_results
            .context("Failed to parse certificate chain")?
            .into_iter()
            .map(CertificateDer::from)
            .collect::<Vec<_>>();

        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }

        let key = {
            let key_results: Result<Vec<_>, _> =
                rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
            let mut keys = key_results.context("Failed to parse private key")?;
            if keys.is_empty() {
                anyhow::bail!("No private key found");
            }
            PrivateKeyDer::from(keys.remove(0))
        };

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")?;

        Ok(config)
    }

    /// Create a TLS client configuration trusting the given CA bundle.
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        for ca_cert in ca_results.context("Failed to parse CA certificates")? {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Accept a TLS connection over an established TCP stream.
    pub async fn accept_tls(acceptor: &TlsAcceptor, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer = tcp_stream.peer_addr().ok();
        let tls_stream = acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {peer:?}"))?;
        debug!("TLS connection accepted from {peer:?}");
        Ok(IoStream::Tls(tls_stream))
    }

    /// Connect via TLS over an established TCP stream.
    pub async fn connect_tls(
        config: ClientConfig,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {sni}"))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed (SNI: {sni})"))?;
        debug!("TLS connection established (SNI: {sni})");
        Ok(IoStream::TlsClient(tls_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        let io_stream = IoStream::Plain(stream);

        assert!(io_stream.peer_label().starts_with("127.0.0.1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uds_listen_connect() {
        let dir = std::env::temp_dir().join(format!("lattice-uds-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.sock");
        let _ = std::fs::remove_file(&path);

        let listener = listen_uds(&path).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = connect_uds(&path).await.unwrap();
        accept.await.unwrap();
        assert_eq!(IoStream::Unix(stream).peer_label(), "uds");

        let _ = std::fs::remove_file(&path);
    }
}
