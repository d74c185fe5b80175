//! HTTP/2 client connection with SETTINGS fingerprinting.
//!
//! Uses the h2 crate directly so the SETTINGS frame advertises the
//! profile's values instead of a generic client's.

use bytes::Bytes;
use h2::client::SendRequest;
use http::{Method, Request, Uri};

use crate::error::{Error, Result};
use crate::fingerprint::http2::Http2Settings;
use crate::response::Response;
use crate::transport::dialer::MaybeTlsStream;

/// Chromium's connection-level flow window (initial 65535 plus the
/// WINDOW_UPDATE Chrome sends immediately after the preface).
const CHROME_CONNECTION_WINDOW_SIZE: u32 = 15_728_640;

/// One multiplexed HTTP/2 connection. Cloning shares the connection.
#[derive(Clone)]
pub struct H2Connection {
    send_request: SendRequest<Bytes>,
}

impl H2Connection {
    /// Perform the HTTP/2 handshake with the profile's SETTINGS and spawn
    /// the connection driver.
    pub async fn handshake(stream: MaybeTlsStream, settings: &Http2Settings) -> Result<Self> {
        let mut builder = h2::client::Builder::new();
        builder
            .header_table_size(settings.header_table_size)
            .initial_window_size(settings.initial_window_size)
            .initial_connection_window_size(CHROME_CONNECTION_WINDOW_SIZE)
            .max_concurrent_streams(settings.max_concurrent_streams)
            .max_frame_size(settings.max_frame_size)
            .max_header_list_size(settings.max_header_list_size)
            .enable_push(settings.enable_push);

        let (send_request, connection) = builder
            .handshake(stream)
            .await
            .map_err(|e| Error::transport(format!("HTTP/2 handshake: {e}")))?;

        // The driver owns all connection I/O; nothing moves without it.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("HTTP/2 connection closed: {e}");
            }
        });

        Ok(Self { send_request })
    }

    /// Send one request over this connection.
    ///
    /// `headers` are the regular (non-pseudo) headers in profile order;
    /// pseudo-headers are derived from `uri` by the framing layer.
    pub async fn send_request(
        &self,
        method: Method,
        uri: &Uri,
        headers: &[(String, String)],
        body: Option<Bytes>,
        max_body: usize,
    ) -> Result<Response> {
        let mut sender = self
            .send_request
            .clone()
            .ready()
            .await
            .map_err(|e| Error::transport(format!("HTTP/2 not ready: {e}")))?;

        let mut builder = Request::builder().method(method).uri(uri.clone());
        for (name, value) in headers {
            if !name.starts_with(':') {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        let request = builder
            .body(())
            .map_err(|e| Error::transport(format!("build HTTP/2 request: {e}")))?;

        let has_body = body.is_some();
        let (response_future, mut send_stream) = sender
            .send_request(request, !has_body)
            .map_err(|e| Error::transport(format!("send HTTP/2 request: {e}")))?;

        if let Some(body) = body {
            send_stream
                .send_data(body, true)
                .map_err(|e| Error::transport(format!("send HTTP/2 body: {e}")))?;
        }

        let response = response_future
            .await
            .map_err(|e| Error::transport(format!("HTTP/2 response: {e}")))?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let mut recv_stream = response.into_body();
        let mut body_bytes = Vec::new();
        while let Some(chunk) = recv_stream.data().await {
            let chunk = chunk.map_err(|e| Error::transport(format!("read HTTP/2 body: {e}")))?;
            if body_bytes.len() + chunk.len() > max_body {
                return Err(Error::ResponseTooLarge { limit: max_body });
            }
            body_bytes.extend_from_slice(&chunk);
            let _ = recv_stream.flow_control().release_capacity(chunk.len());
        }

        Ok(Response::new(status, headers, Bytes::from(body_bytes), "HTTP/2"))
    }
}
