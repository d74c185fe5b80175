//! RFC 6265 cookie handling.
//!
//! Manual cookie storage: the jar is a plain insertion-ordered list so
//! the serialized `Cookie` header order is observable and stable. A
//! stored cookie that matches (name, domain, path) replaces the prior
//! entry in place; an expired cookie deletes it.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use url::Url;

use crate::error::{Error, Result};

/// SameSite attribute (RFC 6265bis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// One cookie with its RFC 6265 attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub expires: Option<DateTime<Utc>>,
    /// Host-only flag: set when the Set-Cookie carried no Domain attribute.
    pub host_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(&domain.into()),
            path: "/".to_string(),
            secure: false,
            http_only: false,
            same_site: None,
            expires: None,
            host_only: true,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Parse a `Set-Cookie` header value in the context of the request URL.
    ///
    /// Domain defaults to the request host (host-only); Path defaults to
    /// the directory of the request path per RFC 6265 Section 5.1.4.
    pub fn from_set_cookie_header(header: &str, request_url: &str) -> Result<Self> {
        let parsed_url = Url::parse(request_url)
            .map_err(|e| Error::transport(format!("cookie context URL: {e}")))?;
        let request_domain = parsed_url
            .host_str()
            .ok_or_else(|| Error::transport("cookie context URL has no host"))?;

        let parts: Vec<&str> = header.split(';').map(str::trim).collect();
        let (name, value) = match parts[0].split_once('=') {
            Some((n, v)) => (n.trim().to_string(), v.trim().to_string()),
            None => return Err(Error::transport("Set-Cookie without '='")),
        };
        if name.is_empty() {
            return Err(Error::transport("Set-Cookie with empty name"));
        }

        let mut cookie = Cookie::new(name, value, request_domain);
        cookie.path = default_path(parsed_url.path());

        let mut domain_attr_present = false;
        let mut max_age: Option<i64> = None;

        for attr in parts.iter().skip(1) {
            if attr.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if attr.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if let Some((key, val)) = attr.split_once('=') {
                match key.trim().to_ascii_lowercase().as_str() {
                    "domain" => {
                        cookie.domain = normalize_domain(val.trim());
                        domain_attr_present = true;
                    }
                    "path" => cookie.path = val.trim().to_string(),
                    "expires" => cookie.expires = parse_cookie_date(val.trim()),
                    "max-age" => max_age = val.trim().parse().ok(),
                    "samesite" => {
                        cookie.same_site = match val.trim().to_ascii_lowercase().as_str() {
                            "strict" => Some(SameSite::Strict),
                            "lax" => Some(SameSite::Lax),
                            "none" => Some(SameSite::None),
                            _ => None,
                        };
                    }
                    _ => {}
                }
            }
        }

        cookie.host_only = !domain_attr_present;

        // RFC 6265 Section 5.3: Max-Age takes precedence over Expires.
        if let Some(max_age) = max_age {
            cookie.expires = Some(if max_age > 0 {
                Utc::now() + chrono::Duration::seconds(max_age)
            } else {
                Utc::now() - chrono::Duration::seconds(1)
            });
        }

        // RFC 6265 Section 5.3: never set cookies on a public suffix.
        if is_public_suffix(&cookie.domain) {
            return Err(Error::transport(format!(
                "cookie rejected for public suffix {}",
                cookie.domain
            )));
        }

        Ok(cookie)
    }

    /// SameSite with the missing-attribute default applied.
    pub fn effective_same_site(&self) -> SameSite {
        self.same_site.unwrap_or(SameSite::Lax)
    }

    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|t| t < Utc::now())
    }

    /// Whether this cookie should be sent on a request to `url`.
    pub fn matches_url(&self, url: &str) -> bool {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return false,
        };
        let request_domain = match parsed.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        };
        if self.secure && parsed.scheme() != "https" {
            return false;
        }
        if self.is_expired() {
            return false;
        }
        self.domain_matches(&request_domain) && self.path_matches(parsed.path())
    }

    /// RFC 6265 Section 5.1.3 domain matching.
    pub fn domain_matches(&self, request_domain: &str) -> bool {
        let cookie_domain = self.domain.to_ascii_lowercase();
        let request_domain = request_domain.to_ascii_lowercase();
        if self.host_only {
            return request_domain == cookie_domain;
        }
        if request_domain == cookie_domain {
            return true;
        }
        request_domain.ends_with(&format!(".{cookie_domain}"))
    }

    /// RFC 6265 Section 5.1.4 path matching.
    pub fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if !request_path.starts_with(&self.path) {
            return false;
        }
        if self.path.ends_with('/') {
            return true;
        }
        request_path.as_bytes().get(self.path.len()) == Some(&b'/')
    }

    /// Serialize as one Netscape cookie-file line (tab-separated: domain,
    /// include-subdomains, path, secure, expires epoch, name, value).
    pub fn to_file_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.domain,
            if self.host_only { "FALSE" } else { "TRUE" },
            self.path,
            if self.secure { "TRUE" } else { "FALSE" },
            self.expires.map(|dt| dt.timestamp()).unwrap_or(0),
            self.name,
            self.value
        )
    }

    pub fn from_file_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 7 {
            return Err(Error::config(format!(
                "cookie file line has {} fields, expected 7",
                parts.len()
            )));
        }
        let include_subdomains = parts[1].eq_ignore_ascii_case("true");
        Ok(Cookie {
            name: parts[5].to_string(),
            value: parts[6].to_string(),
            domain: normalize_domain(parts[0]),
            path: parts[2].to_string(),
            secure: parts[3].eq_ignore_ascii_case("true"),
            http_only: false,
            same_site: None,
            expires: parts[4]
                .parse::<i64>()
                .ok()
                .filter(|&ts| ts > 0)
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            host_only: !include_subdomains,
        })
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Insertion-ordered cookie jar.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie: replace on (name, domain, path), delete on expiry.
    pub fn store(&mut self, cookie: Cookie) {
        let pos = self.cookies.iter().position(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        });
        if cookie.is_expired() {
            if let Some(pos) = pos {
                self.cookies.remove(pos);
            }
            return;
        }
        match pos {
            Some(pos) => self.cookies[pos] = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// Merge every `Set-Cookie` value from a response into the jar.
    /// Malformed cookies are skipped, matching browser behavior.
    pub fn store_from_response(&mut self, set_cookie_values: &[&str], request_url: &str) {
        for value in set_cookie_values {
            match Cookie::from_set_cookie_header(value, request_url) {
                Ok(cookie) => self.store(cookie),
                Err(err) => tracing::debug!(%err, "ignoring malformed Set-Cookie"),
            }
        }
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookies_for_url(&self, url: &str) -> Vec<&Cookie> {
        self.cookies.iter().filter(|c| c.matches_url(url)).collect()
    }

    /// Build the `Cookie` header value for a request, in jar insertion order.
    pub fn cookie_header(&self, url: &str) -> Option<String> {
        let matched = self.cookies_for_url(url);
        if matched.is_empty() {
            return None;
        }
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<&Cookie> {
        let domain = normalize_domain(domain);
        self.cookies
            .iter()
            .find(|c| c.domain == domain && c.name == name)
    }

    pub fn remove(&mut self, domain: &str, name: &str) -> Option<Cookie> {
        let domain = normalize_domain(domain);
        let pos = self
            .cookies
            .iter()
            .position(|c| c.domain == domain && c.name == name)?;
        Some(self.cookies.remove(pos))
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Write the jar as a Netscape-format cookie file.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(b"# Netscape HTTP Cookie File\n").await?;
        for cookie in &self.cookies {
            file.write_all(format!("{}\n", cookie.to_file_line()).as_bytes())
                .await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Load cookies from a Netscape-format cookie file into the jar.
    pub async fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        while reader.read_line(&mut line).await? > 0 {
            let trimmed = line.trim_end();
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                if let Ok(cookie) = Cookie::from_file_line(trimmed) {
                    self.store(cookie);
                }
            }
            line.clear();
        }
        Ok(())
    }
}

fn normalize_domain(domain: &str) -> String {
    domain
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// RFC 6265 Section 5.1.4: the default path is the request path up to,
/// but not including, its last slash.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

fn parse_cookie_date(date_str: &str) -> Option<DateTime<Utc>> {
    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S GMT", // RFC 1123
        "%A, %d-%b-%y %H:%M:%S GMT", // RFC 850
        "%a, %d-%b-%Y %H:%M:%S GMT", // RFC 1036 variation
        "%a %b %e %H:%M:%S %Y",      // asctime()
        "%d %b %Y %H:%M:%S GMT",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(date_str, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    date_str
        .parse::<i64>()
        .ok()
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// Reject cookie domains that are public suffixes (".com", ".co.uk").
fn is_public_suffix(domain: &str) -> bool {
    let domain = domain.strip_prefix('.').unwrap_or(domain);
    psl::suffix(domain.as_bytes())
        .map(|suffix| suffix.is_known() && suffix.as_bytes() == domain.as_bytes())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_set_cookie() {
        let c = Cookie::from_set_cookie_header("sid=abc123; Path=/; Secure", "https://example.test/login").unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain, "example.test");
        assert!(c.host_only);
        assert!(c.secure);
        assert_eq!(c.path, "/");
    }

    #[test]
    fn path_defaults_to_request_directory() {
        let c = Cookie::from_set_cookie_header("a=1", "https://example.test/shop/cart").unwrap();
        assert_eq!(c.path, "/shop");
        let root = Cookie::from_set_cookie_header("a=1", "https://example.test/").unwrap();
        assert_eq!(root.path, "/");
    }

    #[test]
    fn missing_same_site_defaults_to_lax() {
        let c = Cookie::from_set_cookie_header("a=1", "https://example.test/").unwrap();
        assert_eq!(c.same_site, None);
        assert_eq!(c.effective_same_site(), SameSite::Lax);
    }

    #[test]
    fn replacement_is_keyed_on_name_domain_path() {
        let mut jar = CookieJar::new();
        jar.store(Cookie::new("s", "1", "a.test"));
        jar.store(Cookie::new("s", "2", "a.test"));
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.get("a.test", "s").unwrap().value, "2");

        // Different path is a distinct cookie.
        jar.store(Cookie::new("s", "3", "a.test").with_path("/api"));
        assert_eq!(jar.len(), 2);
    }

    #[test]
    fn max_age_zero_deletes() {
        let mut jar = CookieJar::new();
        jar.store(Cookie::new("s", "1", "a.test"));
        jar.store_from_response(&["s=gone; Max-Age=0"], "https://a.test/");
        assert!(jar.is_empty());
    }

    #[test]
    fn past_expires_deletes() {
        let mut jar = CookieJar::new();
        jar.store(Cookie::new("s", "1", "a.test"));
        jar.store_from_response(
            &["s=gone; Expires=Thu, 01 Jan 1970 00:00:00 GMT"],
            "https://a.test/",
        );
        assert!(jar.is_empty());
    }

    #[test]
    fn cookie_header_follows_insertion_order() {
        let mut jar = CookieJar::new();
        jar.store(Cookie::new("first", "1", "a.test"));
        jar.store(Cookie::new("second", "2", "a.test"));
        jar.store(Cookie::new("third", "3", "a.test"));
        assert_eq!(
            jar.cookie_header("https://a.test/").unwrap(),
            "first=1; second=2; third=3"
        );
    }

    #[test]
    fn secure_cookie_not_sent_over_http() {
        let mut jar = CookieJar::new();
        jar.store(Cookie::new("s", "1", "a.test").with_secure(true));
        assert!(jar.cookie_header("http://a.test/").is_none());
        assert!(jar.cookie_header("https://a.test/").is_some());
    }

    #[test]
    fn host_only_vs_domain_matching() {
        let host_only = Cookie::new("a", "1", "a.test");
        assert!(host_only.domain_matches("a.test"));
        assert!(!host_only.domain_matches("sub.a.test"));

        let c = Cookie::from_set_cookie_header("a=1; Domain=a.test", "https://a.test/").unwrap();
        assert!(!c.host_only);
        assert!(c.domain_matches("sub.a.test"));
    }

    #[test]
    fn path_matching_rejects_prefix_collisions() {
        let c = Cookie::new("a", "1", "a.test").with_path("/api");
        assert!(c.path_matches("/api"));
        assert!(c.path_matches("/api/v2"));
        assert!(!c.path_matches("/apiv2"));
    }

    #[test]
    fn public_suffix_is_rejected() {
        assert!(Cookie::from_set_cookie_header("a=1; Domain=com", "https://example.com/").is_err());
    }

    #[test]
    fn file_line_round_trip() {
        let original = Cookie::from_set_cookie_header(
            "sid=v; Domain=a.test; Path=/p; Secure; Expires=Fri, 01 Jan 2100 00:00:00 GMT",
            "https://a.test/",
        )
        .unwrap();
        let reloaded = Cookie::from_file_line(&original.to_file_line()).unwrap();
        assert_eq!(reloaded.name, original.name);
        assert_eq!(reloaded.value, original.value);
        assert_eq!(reloaded.domain, original.domain);
        assert_eq!(reloaded.path, original.path);
        assert_eq!(reloaded.secure, original.secure);
        assert_eq!(reloaded.host_only, original.host_only);
        assert_eq!(
            reloaded.expires.map(|t| t.timestamp()),
            original.expires.map(|t| t.timestamp())
        );
    }

    #[tokio::test]
    async fn jar_survives_save_and_reload() {
        let mut jar = CookieJar::new();
        jar.store(
            Cookie::new("s", "1", "a.test").with_expires(Utc::now() + chrono::Duration::days(1)),
        );
        jar.store(Cookie::new("session", "x", "b.test"));

        let dir = std::env::temp_dir().join(format!("wraith-jar-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("cookies.txt");
        jar.save_to_file(&path).await.unwrap();

        let mut reloaded = CookieJar::new();
        reloaded.load_from_file(&path).await.unwrap();
        // Session cookie (no expiry) and the dated cookie both survive.
        assert_eq!(reloaded.len(), 2);

        // The reloaded jar accepts the same Set-Cookie stream with the
        // same final state as the original.
        let stream = ["s=2; Max-Age=3600", "extra=1"];
        let mut a = jar.clone();
        let mut b = reloaded.clone();
        a.store_from_response(&stream.to_vec(), "https://a.test/");
        b.store_from_response(&stream.to_vec(), "https://a.test/");
        assert_eq!(a.get("a.test", "s").unwrap().value, b.get("a.test", "s").unwrap().value);
        assert_eq!(a.len(), b.len());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
