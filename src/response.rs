//! Normalized HTTP response with transparent decompression.

use std::io::Read;

use bytes::Bytes;

use crate::error::{Error, Result};

/// TLS parameters negotiated for the connection that produced a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Negotiated protocol version, e.g. "TLSv1.3".
    pub version: String,
    /// Negotiated cipher suite name.
    pub cipher: String,
    /// ALPN-selected protocol ("h2", "http/1.1"), empty for plain HTTP.
    pub alpn: String,
}

/// Normalized HTTP response.
///
/// Headers preserve wire order and repeated values. The body is stored
/// as received; `decoded_body` applies Content-Encoding.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: Bytes,
    http_version: String,
    /// URL of the last hop after any redirect chain.
    pub final_url: String,
    pub tls: Option<TlsInfo>,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes, http_version: impl Into<String>) -> Self {
        Self {
            status,
            headers,
            body,
            http_version: http_version.into(),
            final_url: String::new(),
            tls: None,
        }
    }

    /// Set the URL this response was actually served from.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.final_url = url.into();
        self
    }

    /// Attach negotiated TLS parameters.
    pub fn with_tls(mut self, tls: TlsInfo) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn http_version(&self) -> &str {
        &self.http_version
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn redirect_location(&self) -> Option<&str> {
        self.header("Location")
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header in wire order, case-insensitive.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header("Content-Encoding")
    }

    /// Decode the body per Content-Encoding (gzip, deflate, br).
    ///
    /// Falls back to magic-byte sniffing for servers that compress
    /// without declaring it.
    pub fn decoded_body(&self) -> Result<Bytes> {
        match self.content_encoding().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => decode_gzip(&self.body),
            Some("deflate") => decode_deflate(&self.body),
            Some("br") => decode_brotli(&self.body),
            _ => {
                if self.body.len() >= 2 && self.body[0] == 0x1f && self.body[1] == 0x8b {
                    return decode_gzip(&self.body);
                }
                Ok(self.body.clone())
            }
        }
    }

    /// Decoded body as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        let decoded = self.decoded_body()?;
        String::from_utf8(decoded.to_vec())
            .map_err(|e| Error::transport(format!("UTF-8 decode error: {e}")))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let text = self.text()?;
        serde_json::from_str(&text).map_err(Error::from)
    }
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::transport(format!("gzip decode: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    // Servers disagree on whether "deflate" means zlib-wrapped or raw.
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut decoded)
        .is_ok()
    {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::transport(format!("deflate decode: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::transport(format!("brotli decode: {e}")))?;
    Ok(Bytes::from(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn repeated_headers_preserve_order() {
        let resp = Response::new(
            200,
            vec![
                ("Set-Cookie".into(), "a=1".into()),
                ("Content-Type".into(), "text/html".into()),
                ("Set-Cookie".into(), "b=2".into()),
            ],
            Bytes::new(),
            "HTTP/1.1",
        );
        assert_eq!(resp.header_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(resp.header("content-type"), Some("text/html"));
    }

    #[test]
    fn gzip_body_decodes() {
        let compressed = gzip(b"hello world");
        let resp = Response::new(
            200,
            vec![("Content-Encoding".into(), "gzip".into())],
            Bytes::from(compressed),
            "HTTP/1.1",
        );
        assert_eq!(resp.text().unwrap(), "hello world");
    }

    #[test]
    fn undeclared_gzip_is_sniffed() {
        let compressed = gzip(b"sniffed");
        let resp = Response::new(200, vec![], Bytes::from(compressed), "HTTP/1.1");
        assert_eq!(resp.text().unwrap(), "sniffed");
    }

    #[test]
    fn identity_body_passes_through() {
        let resp = Response::new(200, vec![], Bytes::from_static(b"plain"), "HTTP/1.1");
        assert_eq!(resp.decoded_body().unwrap(), Bytes::from_static(b"plain"));
    }

    #[test]
    fn redirect_helpers() {
        let resp = Response::new(
            302,
            vec![("Location".into(), "https://a.test/next".into())],
            Bytes::new(),
            "HTTP/1.1",
        );
        assert!(resp.is_redirect());
        assert_eq!(resp.redirect_location(), Some("https://a.test/next"));
    }
}
