//! BoringSSL TLS dialer.
//!
//! Produces a transport-ready connection whose ClientHello follows the
//! supplied profile spec: cipher order, curve order, signature
//! algorithms, version bounds, ALPN, GREASE and extension permutation.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use boring::ssl::{SslConnector, SslMethod, SslOptions, SslSessionCacheMode, SslVersion};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fingerprint::tls::{
    boring_group_name, boring_sigalg_name, openssl_cipher_name, version, ClientHelloSpec,
};
use crate::response::TlsInfo;
use crate::transport::proxy::{establish_tunnel, ProxyUrl};

// FFI bindings for BoringSSL ClientHello extension control.
use boring_sys::SSL_CTX;
use std::os::raw::c_int;

extern "C" {
    /// Enable GREASE (Generate Random Extensions And Sustain Extensibility).
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    /// Enable extension order permutation (Chromium behavior).
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    /// HTTP/2 ("h2").
    H2,
    /// HTTP/1.1 ("http/1.1").
    Http1,
    /// No ALPN negotiated (plain TCP, or server stayed silent).
    None,
}

impl AlpnProtocol {
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2 => "h2",
            Self::Http1 => "http/1.1",
            Self::None => "",
        }
    }
}

/// Stream that is either plain TCP (http) or TLS (https).
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl std::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybeTlsStream::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            MaybeTlsStream::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A dialed connection with its negotiated parameters.
#[derive(Debug)]
pub struct DialedConnection {
    pub stream: MaybeTlsStream,
    pub alpn: AlpnProtocol,
    pub tls: Option<TlsInfo>,
}

/// TLS dialer with per-I/O-step timeouts.
#[derive(Clone)]
pub struct TlsDialer {
    io_timeout: Duration,
}

impl TlsDialer {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    /// Open a connection to `host:port` and perform a TLS handshake that
    /// emits the ClientHello computed from `spec` narrowed to `alpn_set`.
    ///
    /// SNI is the literal `host`. ALPN advertises the intersection of the
    /// profile's list with `alpn_set`, preserving profile order. When a
    /// proxy is given, the proxy-specific tunnel is established first.
    pub async fn dial_tls(
        &self,
        host: &str,
        port: u16,
        spec: &ClientHelloSpec,
        alpn_set: &[&str],
        proxy: Option<&ProxyUrl>,
        cancel: &CancellationToken,
    ) -> Result<DialedConnection> {
        let narrowed = spec.with_alpn(alpn_set)?;
        let tcp = self.open_tcp(host, port, proxy, cancel).await?;

        let connector = configure_ssl(&narrowed)?;
        let config = connector
            .configure()
            .map_err(|e| Error::tls(format!("SSL configuration: {e}")))?;

        let handshake = tokio_boring::connect(config, host, tcp);
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = tokio::time::timeout(self.io_timeout, handshake) => match result {
                // A handshake that cannot finish within the I/O window is
                // charged to the identity in effect, like a TLS alert.
                Err(_) => return Err(Error::tls(format!("handshake timed out after {:?}", self.io_timeout))),
                Ok(Err(e)) => return Err(Error::tls(e.to_string())),
                Ok(Ok(stream)) => stream,
            },
        };

        let ssl = stream.ssl();
        let alpn = match ssl.selected_alpn_protocol() {
            Some(b"h2") => AlpnProtocol::H2,
            Some(b"http/1.1") => AlpnProtocol::Http1,
            // Servers without ALPN support stay silent; HTTP/1.1 applies
            // whenever the caller permitted it.
            None if alpn_set.contains(&"http/1.1") => AlpnProtocol::Http1,
            _ => AlpnProtocol::None,
        };
        let tls = TlsInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            alpn: alpn.as_str().to_string(),
        };
        tracing::debug!(host, %port, alpn = alpn.as_str(), version = %tls.version, "TLS handshake complete");

        Ok(DialedConnection {
            stream: MaybeTlsStream::Tls(stream),
            alpn,
            tls: Some(tls),
        })
    }

    /// Open a plain TCP connection (http URLs, probes), optionally tunneled.
    pub async fn dial_plain(
        &self,
        host: &str,
        port: u16,
        proxy: Option<&ProxyUrl>,
        cancel: &CancellationToken,
    ) -> Result<DialedConnection> {
        let tcp = self.open_tcp(host, port, proxy, cancel).await?;
        Ok(DialedConnection {
            stream: MaybeTlsStream::Plain(tcp),
            alpn: AlpnProtocol::None,
            tls: None,
        })
    }

    async fn open_tcp(
        &self,
        host: &str,
        port: u16,
        proxy: Option<&ProxyUrl>,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        match proxy {
            Some(proxy) => {
                // Any failure on the way to the target through a proxy is
                // the proxy's failure, including timeouts.
                let connect = async {
                    TcpStream::connect(proxy.addr())
                        .await
                        .map_err(|e| Error::proxy(format!("connect {}: {e}", proxy.identity())))
                };
                let mut stream = self.bounded(cancel, connect).await.map_err(not_canceled_to_proxy)?;
                self.bounded(cancel, establish_tunnel(&mut stream, proxy, host, port))
                    .await
                    .map_err(not_canceled_to_proxy)?;
                Ok(stream)
            }
            None => {
                let addr = format!("{host}:{port}");
                let connect = async {
                    TcpStream::connect(&addr)
                        .await
                        .map_err(|e| Error::transport(format!("connect {addr}: {e}")))
                };
                self.bounded(cancel, connect).await
            }
        }
    }

    /// Run one I/O step under the per-step timeout and the cancel token.
    async fn bounded<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = tokio::time::timeout(self.io_timeout, fut) => match result {
                Err(_) => Err(Error::elapsed("I/O step", self.io_timeout)),
                Ok(res) => res,
            },
        }
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Build a BoringSSL connector matching the (ALPN-narrowed) spec.
fn configure_ssl(spec: &ClientHelloSpec) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| Error::tls(format!("SSL connector: {e}")))?;

    let cipher_list: Vec<&str> = spec
        .cipher_suites
        .iter()
        .filter_map(|&suite| openssl_cipher_name(suite))
        .collect();
    if !cipher_list.is_empty() {
        builder
            .set_cipher_list(&cipher_list.join(":"))
            .map_err(|e| Error::tls(format!("cipher list: {e}")))?;
    }

    let groups: Vec<&str> = spec
        .groups()
        .iter()
        .filter_map(|&g| boring_group_name(g))
        .collect();
    if !groups.is_empty() {
        builder
            .set_curves_list(&groups.join(":"))
            .map_err(|e| Error::tls(format!("curves: {e}")))?;
    }

    let sigalgs: Vec<&str> = spec
        .signature_schemes()
        .iter()
        .filter_map(|&s| boring_sigalg_name(s))
        .collect();
    if !sigalgs.is_empty() {
        builder
            .set_sigalgs_list(&sigalgs.join(":"))
            .map_err(|e| Error::tls(format!("signature algorithms: {e}")))?;
    }

    builder
        .set_min_proto_version(Some(ssl_version(spec.min_version)?))
        .map_err(|e| Error::tls(format!("min TLS version: {e}")))?;
    builder
        .set_max_proto_version(Some(ssl_version(spec.max_version)?))
        .map_err(|e| Error::tls(format!("max TLS version: {e}")))?;

    if !spec.offers_session_ticket() {
        builder.set_options(SslOptions::NO_TICKET);
    }
    builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

    builder
        .set_alpn_protos(&alpn_wire(&spec.alpn_protocols()))
        .map_err(|e| Error::tls(format!("ALPN: {e}")))?;

    // GREASE and extension-order permutation are Chromium behaviors;
    // Firefox and Safari specs turn both off.
    unsafe {
        let ctx = builder.as_ptr() as *mut SSL_CTX;
        SSL_CTX_set_grease_enabled(ctx, spec.grease as c_int);
        SSL_CTX_set_permute_extensions(ctx, spec.grease as c_int);
    }

    Ok(builder.build())
}

/// Reclassify timeouts and transport errors on the proxy path; a tunnel
/// that cannot be built means the proxy is unreachable.
fn not_canceled_to_proxy(err: Error) -> Error {
    match err {
        Error::Canceled => Error::Canceled,
        Error::ProxyUnreachable(msg) => Error::ProxyUnreachable(msg),
        other => Error::proxy(other.to_string()),
    }
}

fn ssl_version(code: u16) -> Result<SslVersion> {
    match code {
        version::TLS12 => Ok(SslVersion::TLS1_2),
        version::TLS13 => Ok(SslVersion::TLS1_3),
        other => Err(Error::config(format!("unsupported TLS version {other:#06x}"))),
    }
}

/// ALPN protocol list in TLS wire format (length-prefixed strings).
fn alpn_wire(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(16);
    for p in protocols {
        wire.push(p.len() as u8);
        wire.extend_from_slice(p.as_bytes());
    }
    wire
}
