//! Bot-challenge response classification.
//!
//! Detection is heuristic: a marker substring in the body or a redirect
//! to a known challenge host means the response is a challenge page, not
//! content. The marker set is operator-tunable because benign pages can
//! contain marker text.

use crate::response::Response;

/// Challenge classification rules.
#[derive(Debug, Clone)]
pub struct ChallengeRules {
    /// Case-insensitive substrings matched against the decoded body.
    pub body_markers: Vec<String>,
    /// Hosts that serve challenge pages; a redirect Location pointing at
    /// one of these is a block regardless of body content.
    pub challenge_hosts: Vec<String>,
}

impl ChallengeRules {
    /// Empty rule set: nothing is ever classified as a challenge.
    pub fn disabled() -> Self {
        Self {
            body_markers: Vec::new(),
            challenge_hosts: Vec::new(),
        }
    }

    /// Classify a response. Returns the matched marker or host.
    pub fn classify(&self, response: &Response) -> Option<String> {
        if let Some(location) = response.redirect_location() {
            for host in &self.challenge_hosts {
                if url::Url::parse(location)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(host)))
                    .unwrap_or(false)
                {
                    return Some(format!("redirect to challenge host {host}"));
                }
            }
        }

        if self.body_markers.is_empty() {
            return None;
        }
        let body = match response.text() {
            Ok(text) => text.to_ascii_lowercase(),
            Err(_) => return None,
        };
        self.body_markers
            .iter()
            .find(|marker| body.contains(&marker.to_ascii_lowercase()))
            .map(|marker| format!("body marker {marker:?}"))
    }
}

impl Default for ChallengeRules {
    fn default() -> Self {
        Self {
            body_markers: [
                "verify you are human",
                "checking your browser",
                "just a moment",
                "attention required",
                "cf-browser-verification",
                "cf_chl_opt",
                "g-recaptcha",
                "h-captcha",
                "data-sitekey",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            challenge_hosts: vec!["challenges.cloudflare.com".to_string()],
        }
    }
}
