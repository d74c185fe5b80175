//! The HTTP engine: one wire-accurate exchange per call.
//!
//! The engine owns everything observable above TLS: the composed header
//! list (profile defaults in registered order, overrides substituted in
//! place), the Cookie header, redirect handling, and response
//! normalization. Protocol choice flows from the selector through ALPN.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, Uri};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::headers::HostPlacement;
use crate::fingerprint::{Profile, ProfileId};
use crate::response::Response;
use crate::session::Session;
use crate::transport::dialer::{AlpnProtocol, TlsDialer};
use crate::transport::h1::H1Connection;
use crate::transport::h2::H2Connection;
use crate::transport::proxy::ProxyUrl;

/// Which protocol the exchange may use; maps to the ALPN set the dialer
/// advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolSelector {
    ForceHttp1,
    ForceHttp2,
    #[default]
    Auto,
}

impl ProtocolSelector {
    /// ALPN protocols to advertise, in profile-preference order.
    pub fn alpn_set(&self) -> &'static [&'static str] {
        match self {
            Self::ForceHttp1 => &["http/1.1"],
            Self::ForceHttp2 => &["h2"],
            Self::Auto => &["h2", "http/1.1"],
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "1.1" | "http1" | "force-http1" => Ok(Self::ForceHttp1),
            "2" | "http2" | "force-http2" => Ok(Self::ForceHttp2),
            "auto" => Ok(Self::Auto),
            other => Err(Error::config(format!("unknown http-version {other:?}"))),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub follow_redirects: bool,
    pub max_redirects: u32,
    /// Response body ceiling in bytes.
    pub max_body: usize,
    /// Round-trip timeout covering the whole exchange including redirects.
    pub request_timeout: Duration,
    /// Per-I/O-step timeout inside the dialer.
    pub io_timeout: Duration,
    /// Idle HTTP/2 connections older than this are not reused.
    pub idle_conn_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirects: 10,
            max_body: 16 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(10),
            idle_conn_timeout: Duration::from_secs(90),
        }
    }
}

/// Key for reusable HTTP/2 connections. A connection is only shared when
/// everything that shaped its handshake matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    host: String,
    port: u16,
    proxy: Option<String>,
    profile: ProfileId,
}

struct PooledH2 {
    conn: H2Connection,
    last_used: Instant,
}

/// The request engine.
pub struct HttpEngine {
    dialer: TlsDialer,
    config: EngineConfig,
    h2_conns: RwLock<HashMap<ConnKey, PooledH2>>,
}

impl HttpEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            dialer: TlsDialer::new(config.io_timeout),
            config,
            h2_conns: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Perform one HTTP exchange: request, redirect chain, cookie merge.
    ///
    /// The returned response carries the final URL, ordered headers, the
    /// bounded body, and negotiated TLS parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        overrides: &[(String, String)],
        body: Option<Bytes>,
        session: &Session,
        profile: &'static Profile,
        selector: ProtocolSelector,
        proxy: Option<&ProxyUrl>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let exchange = self.execute_inner(
            method, url, overrides, body, session, profile, selector, proxy, cancel,
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = tokio::time::timeout(self.config.request_timeout, exchange) => match result {
                Err(_) => Err(Error::elapsed("HTTP round trip", self.config.request_timeout)),
                Ok(res) => res,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_inner(
        &self,
        method: Method,
        url: &str,
        overrides: &[(String, String)],
        body: Option<Bytes>,
        session: &Session,
        profile: &'static Profile,
        selector: ProtocolSelector,
        proxy: Option<&ProxyUrl>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let proxy_id = proxy.map(|p| p.identity());
        let mut current_url = Url::parse(url)?;
        let mut current_method = method;
        let mut current_body = body;
        let mut referer: Option<String> = None;
        let mut visited: Vec<String> = Vec::new();
        let follow = self.config.follow_redirects && self.config.max_redirects > 0;

        loop {
            let url_string = current_url.to_string();
            if visited.contains(&url_string) {
                return Err(Error::RedirectLoop(url_string));
            }
            visited.push(url_string.clone());

            let cookie_header = session.cookie_header(&url_string, proxy_id.as_deref());
            let response = self
                .perform_hop(
                    &current_method,
                    &current_url,
                    overrides,
                    current_body.clone(),
                    cookie_header,
                    referer.as_deref(),
                    profile,
                    selector,
                    proxy,
                    cancel,
                )
                .await?;

            // Cookie merge happens at every hop, before redirect handling.
            let set_cookies = response.header_all("set-cookie");
            session.merge_response_cookies(&set_cookies, &url_string, proxy_id.as_deref());

            if !(response.is_redirect() && follow) {
                return Ok(response);
            }
            let Some(location) = response.redirect_location() else {
                return Ok(response);
            };

            let hops_so_far = visited.len() as u32 - 1;
            if hops_so_far >= self.config.max_redirects {
                return Err(Error::too_many_redirects(hops_so_far + 1));
            }

            let next_url = current_url
                .join(location)
                .map_err(|e| Error::transport(format!("invalid redirect target {location:?}: {e}")))?;
            tracing::debug!(from = %url_string, to = %next_url, status = response.status, "following redirect");

            // 301/302/303 rewrite to GET and drop the body; 307/308 keep both.
            if matches!(response.status, 301 | 302 | 303) {
                current_method = Method::GET;
                current_body = None;
            }
            referer = Some(url_string);
            current_url = next_url;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn perform_hop(
        &self,
        method: &Method,
        url: &Url,
        overrides: &[(String, String)],
        body: Option<Bytes>,
        cookie_header: Option<String>,
        referer: Option<&str>,
        profile: &'static Profile,
        selector: ProtocolSelector,
        proxy: Option<&ProxyUrl>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("URL {url} has no host")))?;
        let is_https = url.scheme() == "https";
        let port = url.port().unwrap_or(if is_https { 443 } else { 80 });

        if !is_https {
            // Plaintext is HTTP/1.1 only; there is no ALPN to negotiate.
            let headers = compose_headers(
                profile,
                method,
                url,
                overrides,
                cookie_header.as_deref(),
                referer,
                WireFormat::Http1,
            );
            let dialed = self.dialer.dial_plain(host, port, proxy, cancel).await?;
            let mut conn = H1Connection::new(dialed.stream, self.config.max_body);
            let target = request_target(url);
            let response = conn
                .send_request(method, &target, &headers, body.as_ref())
                .await?;
            return Ok(response.with_url(url.to_string()));
        }

        let key = ConnKey {
            host: host.to_string(),
            port,
            proxy: proxy.map(|p| p.identity()),
            profile: profile.id,
        };

        // Reuse a multiplexed HTTP/2 connection when the selector allows it.
        if selector != ProtocolSelector::ForceHttp1 {
            if let Some(conn) = self.checkout_h2(&key).await {
                let headers = compose_headers(
                    profile,
                    method,
                    url,
                    overrides,
                    cookie_header.as_deref(),
                    referer,
                    WireFormat::Http2 {
                        pseudo_order: profile.pseudo_order,
                    },
                );
                let uri: Uri = url.as_str().parse().map_err(|e| {
                    Error::config(format!("URL {url} is not a valid URI: {e}"))
                })?;
                match conn
                    .send_request(method.clone(), &uri, &headers, body.clone(), self.config.max_body)
                    .await
                {
                    Ok(response) => return Ok(response.with_url(url.to_string())),
                    Err(err) => {
                        tracing::debug!(%err, "pooled HTTP/2 connection failed, dialing fresh");
                        self.h2_conns.write().await.remove(&key);
                    }
                }
            }
        }

        let dialed = self
            .dialer
            .dial_tls(
                host,
                port,
                &profile.client_hello,
                selector.alpn_set(),
                proxy,
                cancel,
            )
            .await?;
        let tls = dialed.tls.clone().unwrap_or_default();

        match dialed.alpn {
            AlpnProtocol::H2 => {
                let headers = compose_headers(
                    profile,
                    method,
                    url,
                    overrides,
                    cookie_header.as_deref(),
                    referer,
                    WireFormat::Http2 {
                        pseudo_order: profile.pseudo_order,
                    },
                );
                let conn = H2Connection::handshake(dialed.stream, &profile.http2).await?;
                self.h2_conns.write().await.insert(
                    key,
                    PooledH2 {
                        conn: conn.clone(),
                        last_used: Instant::now(),
                    },
                );
                let uri: Uri = url.as_str().parse().map_err(|e| {
                    Error::config(format!("URL {url} is not a valid URI: {e}"))
                })?;
                let response = conn
                    .send_request(method.clone(), &uri, &headers, body, self.config.max_body)
                    .await?;
                Ok(response.with_url(url.to_string()).with_tls(tls))
            }
            AlpnProtocol::Http1 => {
                let headers = compose_headers(
                    profile,
                    method,
                    url,
                    overrides,
                    cookie_header.as_deref(),
                    referer,
                    WireFormat::Http1,
                );
                let mut conn = H1Connection::new(dialed.stream, self.config.max_body);
                let target = request_target(url);
                let response = conn
                    .send_request(method, &target, &headers, body.as_ref())
                    .await?;
                Ok(response.with_url(url.to_string()).with_tls(tls))
            }
            AlpnProtocol::None => Err(Error::tls(format!(
                "server selected no usable ALPN protocol for {host}"
            ))),
        }
    }

    async fn checkout_h2(&self, key: &ConnKey) -> Option<H2Connection> {
        let conns = self.h2_conns.read().await;
        let entry = conns.get(key)?;
        if entry.last_used.elapsed() > self.config.idle_conn_timeout {
            drop(conns);
            self.h2_conns.write().await.remove(key);
            return None;
        }
        Some(entry.conn.clone())
    }
}

/// Target wire format for header composition.
#[derive(Debug, Clone, Copy)]
pub enum WireFormat {
    Http1,
    Http2 {
        pseudo_order: crate::fingerprint::http2::PseudoHeaderOrder,
    },
}

/// Compose the full ordered header list for one hop.
///
/// Order: HTTP/2 pseudo-headers (profile order) or the HTTP/1.1 `Host`
/// at the profile's registered position; then the profile defaults in
/// registered order with per-request overrides substituted in place;
/// then overrides with no default counterpart; then Referer and Cookie.
pub fn compose_headers(
    profile: &Profile,
    method: &Method,
    url: &Url,
    overrides: &[(String, String)],
    cookie_header: Option<&str>,
    referer: Option<&str>,
    wire: WireFormat,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(profile.default_headers.len() + 6);
    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    if let WireFormat::Http2 { pseudo_order } = wire {
        for name in pseudo_order.names() {
            let value = match name {
                ":method" => method.as_str().to_string(),
                ":scheme" => url.scheme().to_string(),
                ":authority" => authority.clone(),
                ":path" => request_target(url),
                _ => unreachable!(),
            };
            headers.push((name.to_string(), value));
        }
    }

    let mut consumed = vec![false; overrides.len()];
    for (name, default_value) in &profile.default_headers {
        let value = overrides
            .iter()
            .enumerate()
            .find(|(_, (o_name, _))| o_name.eq_ignore_ascii_case(name))
            .map(|(idx, (_, o_value))| {
                consumed[idx] = true;
                o_value.clone()
            })
            .unwrap_or_else(|| default_value.to_string());
        headers.push((name.to_string(), value));
    }

    for (idx, (name, value)) in overrides.iter().enumerate() {
        if !consumed[idx] && !name.starts_with(':') {
            headers.push((name.clone(), value.clone()));
        }
    }

    if let Some(referer) = referer {
        upsert(&mut headers, "Referer", referer);
    }
    if let Some(cookie) = cookie_header {
        upsert(&mut headers, "Cookie", cookie);
    }

    match wire {
        WireFormat::Http1 => {
            let host_entry = ("Host".to_string(), authority);
            match profile.host_placement {
                HostPlacement::AfterRequestLine => headers.insert(0, host_entry),
                HostPlacement::AfterConnectionHeaders => {
                    let pos = headers
                        .iter()
                        .rposition(|(name, _)| is_connection_class(name))
                        .map(|idx| idx + 1)
                        .unwrap_or(0);
                    headers.insert(pos, host_entry);
                }
            }
            headers
        }
        WireFormat::Http2 { .. } => {
            // HTTP/2 forbids connection-specific headers and lowercases
            // field names on the wire.
            headers
                .into_iter()
                .filter(|(name, _)| {
                    !is_connection_class(name) && !name.eq_ignore_ascii_case("host")
                })
                .map(|(name, value)| {
                    if name.starts_with(':') {
                        (name, value)
                    } else {
                        (name.to_ascii_lowercase(), value)
                    }
                })
                .collect()
        }
    }
}

/// Origin-form request target: /path?query.
pub fn request_target(url: &Url) -> String {
    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn is_connection_class(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("keep-alive")
}

fn upsert(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some((_, v)) => *v = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}
