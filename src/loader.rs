//! Input file formats: URL lists, proxy lists, header/body JSON.
//!
//! One item per line for the list formats; blank lines and `#` comments
//! are skipped. Header and body files are UTF-8 JSON objects mapping
//! string to string.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::transport::proxy::ProxyUrl;

/// Parse a newline-delimited URL list.
pub fn parse_url_list(input: &str) -> Result<Vec<String>> {
    let mut urls = Vec::new();
    for (line_no, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        url::Url::parse(line)
            .map_err(|e| Error::config(format!("line {}: bad URL {line:?}: {e}", line_no + 1)))?;
        urls.push(line.to_string());
    }
    Ok(urls)
}

/// Serialize a URL list back to the file format.
pub fn serialize_url_list(urls: &[String]) -> String {
    let mut out = String::with_capacity(urls.iter().map(|u| u.len() + 1).sum());
    for url in urls {
        out.push_str(url);
        out.push('\n');
    }
    out
}

/// Parse a newline-delimited proxy list.
pub fn parse_proxy_list(input: &str) -> Result<Vec<ProxyUrl>> {
    let mut proxies = Vec::new();
    for (line_no, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let proxy = ProxyUrl::parse(line)
            .map_err(|e| Error::config(format!("line {}: {e}", line_no + 1)))?;
        proxies.push(proxy);
    }
    Ok(proxies)
}

/// Parse a comma-separated proxy list (the inline CLI form).
pub fn parse_proxy_csv(input: &str) -> Result<Vec<ProxyUrl>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ProxyUrl::parse)
        .collect()
}

/// Parse a header or body JSON object (string -> string).
///
/// A BTreeMap gives deterministic iteration; callers that care about
/// wire order pass explicit override lists instead.
pub fn parse_json_map(input: &str) -> Result<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(input)?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::config("expected a JSON object of string values"))?;
    let mut map = BTreeMap::new();
    for (key, value) in object {
        let value = value
            .as_str()
            .ok_or_else(|| Error::config(format!("value of {key:?} is not a string")))?;
        map.insert(key.clone(), value.to_string());
    }
    Ok(map)
}
