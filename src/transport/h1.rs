//! HTTP/1.1 over a raw stream.
//!
//! Request serialization is byte-level on purpose: the engine hands this
//! module the complete header list in its final order (including `Host`
//! at the profile's position) and it is written verbatim. httparse is
//! used only for the response side.

use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::response::Response;
use crate::transport::dialer::MaybeTlsStream;

/// Maximum response header block size.
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of response headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// One HTTP/1.1 connection.
pub struct H1Connection {
    stream: MaybeTlsStream,
    /// Response body ceiling; exceeding it fails the exchange.
    max_body: usize,
    should_close: bool,
}

impl H1Connection {
    pub fn new(stream: MaybeTlsStream, max_body: usize) -> Self {
        Self {
            stream,
            max_body,
            should_close: false,
        }
    }

    /// Whether the server asked for the connection to be closed.
    pub fn should_close(&self) -> bool {
        self.should_close
    }

    /// Send one request and read the response.
    ///
    /// `target` is the request-target (origin-form); `headers` are
    /// emitted exactly as given, in order, with their exact casing.
    pub async fn send_request(
        &mut self,
        method: &Method,
        target: &str,
        headers: &[(String, String)],
        body: Option<&Bytes>,
    ) -> Result<Response> {
        let request_bytes = build_request(method, target, headers, body)?;
        self.stream.write_all(&request_bytes).await.map_err(|e| {
            Error::transport(format!("write request: {e}"))
        })?;
        if let Some(body) = body {
            self.stream
                .write_all(body)
                .await
                .map_err(|e| Error::transport(format!("write body: {e}")))?;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| Error::transport(format!("flush: {e}")))?;

        self.read_response(method).await
    }

    /// Read one response, skipping 1xx interim responses.
    async fn read_response(&mut self, method: &Method) -> Result<Response> {
        let mut buffer = Vec::with_capacity(8 * 1024);

        loop {
            loop {
                if buffer.len() >= MAX_HEADERS_SIZE {
                    return Err(Error::transport("response headers too large"));
                }
                if find_header_end(&buffer).is_some() {
                    break;
                }
                let mut read_buf = vec![0u8; 8192];
                let n = self
                    .stream
                    .read(&mut read_buf)
                    .await
                    .map_err(|e| Error::transport(format!("read response: {e}")))?;
                if n == 0 {
                    return Err(Error::transport("connection closed before response head"));
                }
                buffer.extend_from_slice(&read_buf[..n]);
            }

            let (response, consumed) = self.parse_response(&buffer, method).await?;
            buffer.drain(..consumed);

            // RFC 9112 Section 6: interim responses precede the final one.
            if (100..200).contains(&response.status) {
                continue;
            }
            return Ok(response);
        }
    }

    async fn parse_response(
        &mut self,
        buffer: &[u8],
        request_method: &Method,
    ) -> Result<(Response, usize)> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut parsed = httparse::Response::new(&mut header_storage);

        let headers_len = match parsed
            .parse(buffer)
            .map_err(|e| Error::transport(format!("parse response: {e}")))?
        {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                return Err(Error::transport("incomplete response headers"));
            }
        };

        let status = parsed
            .code
            .ok_or_else(|| Error::transport("missing status code"))?;
        let version = format!("HTTP/1.{}", parsed.version.unwrap_or(1));

        let headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .filter(|h| !h.name.is_empty())
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        if let Some(conn) = header_value(&headers, "connection") {
            if conn.to_ascii_lowercase().contains("close") {
                self.should_close = true;
            }
        }

        // RFC 9112 Section 6.1: HEAD, 1xx, 204, 304 carry no body.
        let has_body =
            !matches!(status, 100..=199 | 204 | 304) && *request_method != Method::HEAD;
        if !has_body {
            return Ok((Response::new(status, headers, Bytes::new(), version), headers_len));
        }

        let transfer_encoding = header_value(&headers, "transfer-encoding");
        let is_chunked = transfer_encoding
            .map(|v| {
                v.split(',')
                    .next_back()
                    .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        let content_length = if transfer_encoding.is_some() {
            None
        } else if let Some(cl) = header_value(&headers, "content-length") {
            Some(parse_content_length(cl)?)
        } else {
            None
        };

        let body_start = &buffer[headers_len..];
        let (body, consumed) = if is_chunked {
            let body = self.read_chunked_body(body_start.to_vec()).await?;
            (body, buffer.len())
        } else if let Some(len) = content_length {
            if len > self.max_body {
                return Err(Error::ResponseTooLarge { limit: self.max_body });
            }
            let body = self.read_fixed_body(body_start, len).await?;
            (body, headers_len + body_start.len().min(len))
        } else {
            // No framing: body runs to connection close.
            self.should_close = true;
            let body = self.read_until_close(body_start).await?;
            (body, buffer.len())
        };

        Ok((Response::new(status, headers, body, version), consumed))
    }

    async fn read_until_close(&mut self, initial: &[u8]) -> Result<Bytes> {
        let mut body = initial.to_vec();
        let mut read_buf = vec![0u8; 8192];
        loop {
            self.check_body_cap(body.len())?;
            let n = self
                .stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::transport(format!("read body: {e}")))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&read_buf[..n]);
        }
        self.check_body_cap(body.len())?;
        Ok(Bytes::from(body))
    }

    async fn read_fixed_body(&mut self, initial: &[u8], content_length: usize) -> Result<Bytes> {
        let initial_len = initial.len().min(content_length);
        let mut body = Vec::with_capacity(content_length.min(self.max_body));
        body.extend_from_slice(&initial[..initial_len]);

        while body.len() < content_length {
            let remaining = content_length - body.len();
            let mut chunk = vec![0u8; remaining.min(8192)];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::transport(format!("read body: {e}")))?;
            if n == 0 {
                return Err(Error::transport(format!(
                    "connection closed with {} of {} body bytes",
                    body.len(),
                    content_length
                )));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(Bytes::from(body))
    }

    async fn read_chunked_body(&mut self, initial: Vec<u8>) -> Result<Bytes> {
        let mut body = Vec::new();
        let mut buffer = initial;
        let mut read_buf = vec![0u8; 8192];

        loop {
            let (chunk_size, line_end) = loop {
                if let Some(found) = find_chunk_size(&buffer) {
                    break found;
                }
                let n = self
                    .stream
                    .read(&mut read_buf)
                    .await
                    .map_err(|e| Error::transport(format!("read chunk size: {e}")))?;
                if n == 0 {
                    return Err(Error::transport("connection closed in chunk size"));
                }
                buffer.extend_from_slice(&read_buf[..n]);
            };
            buffer.drain(..line_end);

            if chunk_size == 0 {
                self.consume_trailers(&mut buffer).await?;
                break;
            }
            self.check_body_cap(body.len() + chunk_size)?;

            let chunk_end = chunk_size + 2; // data + CRLF
            while buffer.len() < chunk_end {
                let n = self
                    .stream
                    .read(&mut read_buf)
                    .await
                    .map_err(|e| Error::transport(format!("read chunk data: {e}")))?;
                if n == 0 {
                    return Err(Error::transport("connection closed in chunk data"));
                }
                buffer.extend_from_slice(&read_buf[..n]);
            }
            body.extend_from_slice(&buffer[..chunk_size]);
            buffer.drain(..chunk_end);
        }

        Ok(Bytes::from(body))
    }

    async fn consume_trailers(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let mut read_buf = vec![0u8; 4096];
        loop {
            if let Some(pos) = find_crlf(buffer) {
                if pos == 0 {
                    buffer.drain(..2);
                    return Ok(());
                }
                buffer.drain(..pos + 2);
                continue;
            }
            let n = self
                .stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::transport(format!("read trailers: {e}")))?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    fn check_body_cap(&self, len: usize) -> Result<()> {
        if len > self.max_body {
            Err(Error::ResponseTooLarge { limit: self.max_body })
        } else {
            Ok(())
        }
    }
}

/// Serialize the request head. Headers go out exactly as given.
fn build_request(
    method: &Method,
    target: &str,
    headers: &[(String, String)],
    body: Option<&Bytes>,
) -> Result<Vec<u8>> {
    for (name, value) in headers {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }

    let mut request = Vec::with_capacity(1024);
    request.extend_from_slice(method.as_str().as_bytes());
    request.push(b' ');
    request.extend_from_slice(target.as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in headers {
        request.extend_from_slice(name.as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    if let Some(body) = body {
        let explicit_framing = headers.iter().any(|(name, _)| {
            name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
        });
        if !explicit_framing {
            request.extend_from_slice(b"Content-Length: ");
            request.extend_from_slice(body.len().to_string().as_bytes());
            request.extend_from_slice(b"\r\n");
        }
    }

    request.extend_from_slice(b"\r\n");
    Ok(request)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse a chunk-size line, returning (size, bytes consumed through CRLF).
fn find_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    let pos = find_crlf(buffer)?;
    let line = std::str::from_utf8(&buffer[..pos]).ok()?;
    let size_part = line.split(';').next()?;
    let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
    Some((size, pos + 2))
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// RFC 9110 Section 5.1: header names are tokens.
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::transport("empty header name"));
    }
    if !name.bytes().all(is_tchar) {
        return Err(Error::transport(format!("invalid header name {name:?}")));
    }
    Ok(())
}

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// RFC 9110 Section 5.5: no NUL/CR/LF in values (header injection).
fn validate_header_value(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(Error::transport("CR/LF/NUL in header value"));
    }
    Ok(())
}

/// Parse Content-Length per RFC 9112 Section 6.2: repeated values must agree.
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parsed: Option<usize> = None;
    for part in value.split(',') {
        let val = part
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::transport(format!("invalid Content-Length {value:?}")))?;
        match parsed {
            None => parsed = Some(val),
            Some(prev) if prev != val => {
                return Err(Error::transport(format!(
                    "conflicting Content-Length values {value:?}"
                )));
            }
            Some(_) => {}
        }
    }
    parsed.ok_or_else(|| Error::transport("empty Content-Length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_head_preserves_order_and_casing() {
        let headers = vec![
            ("Host".to_string(), "a.test".to_string()),
            ("User-Agent".to_string(), "UA".to_string()),
            ("DNT".to_string(), "1".to_string()),
        ];
        let bytes = build_request(&Method::GET, "/path?q=1", &headers, None).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "GET /path?q=1 HTTP/1.1\r\nHost: a.test\r\nUser-Agent: UA\r\nDNT: 1\r\n\r\n"
        );
    }

    #[test]
    fn content_length_added_only_when_missing() {
        let body = Bytes::from_static(b"data");
        let bytes =
            build_request(&Method::POST, "/", &[("Host".into(), "a".into())], Some(&body)).unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("Content-Length: 4\r\n"));

        let explicit = vec![("Content-Length".to_string(), "4".to_string())];
        let bytes = build_request(&Method::POST, "/", &explicit, Some(&body)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn header_injection_is_rejected() {
        let bad = vec![("X".to_string(), "v\r\nEvil: 1".to_string())];
        assert!(build_request(&Method::GET, "/", &bad, None).is_err());
        let bad_name = vec![("Bad Name".to_string(), "v".to_string())];
        assert!(build_request(&Method::GET, "/", &bad_name, None).is_err());
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(find_chunk_size(b"5\r\nhello"), Some((5, 3)));
        assert_eq!(find_chunk_size(b"a\r\n"), Some((10, 3)));
        assert_eq!(find_chunk_size(b"5;ext=val\r\ndata"), Some((5, 11)));
        assert_eq!(find_chunk_size(b"0\r\n"), Some((0, 3)));
        assert_eq!(find_chunk_size(b"XYZ\r\n"), None);
        assert_eq!(find_chunk_size(b"10"), None);
    }

    #[test]
    fn header_end_detection() {
        assert_eq!(
            find_header_end(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"),
            Some(38)
        );
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn content_length_agreement() {
        assert_eq!(parse_content_length("100").unwrap(), 100);
        assert_eq!(parse_content_length("100, 100").unwrap(), 100);
        assert!(parse_content_length("100, 200").is_err());
        assert!(parse_content_length("abc").is_err());
        assert!(parse_content_length("-1").is_err());
    }
}
