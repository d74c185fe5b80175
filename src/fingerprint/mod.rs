//! Browser profiles and the profile registry.
//!
//! A profile bundles everything observable about a browser identity: the
//! TLS ClientHello spec, the HTTP/2 SETTINGS fingerprint, and the default
//! header list with its ordering. Profiles are compiled-in and immutable
//! after registration; a dispatch either binds one completely or fails.

pub mod headers;
pub mod http2;
pub mod tls;

use std::sync::LazyLock;

use crate::error::{Error, Result};
use headers::HostPlacement;
use http2::{Http2Settings, PseudoHeaderOrder};
use tls::ClientHelloSpec;

/// Browser identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProfileId {
    #[default]
    Chrome,
    Firefox,
    Safari,
    Edge,
}

impl ProfileId {
    /// All registered identities.
    pub const ALL: [ProfileId; 4] = [
        ProfileId::Chrome,
        ProfileId::Firefox,
        ProfileId::Safari,
        ProfileId::Edge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Safari => "safari",
            Self::Edge => "edge",
        }
    }

    /// Parse a profile name as it appears in configuration.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            "safari" => Ok(Self::Safari),
            "edge" => Ok(Self::Edge),
            other => Err(Error::UnknownProfile(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable browser profile.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: ProfileId,
    pub client_hello: ClientHelloSpec,
    pub http2: Http2Settings,
    pub pseudo_order: PseudoHeaderOrder,
    /// Default headers in registered order, exact casing.
    pub default_headers: Vec<(&'static str, &'static str)>,
    pub host_placement: HostPlacement,
}

impl Profile {
    /// Default User-Agent string for this profile.
    pub fn user_agent(&self) -> &'static str {
        self.default_headers
            .iter()
            .find(|(name, _)| *name == "User-Agent")
            .map(|(_, value)| *value)
            .unwrap_or("wraith/0.1")
    }
}

static CHROME: LazyLock<Profile> = LazyLock::new(|| Profile {
    id: ProfileId::Chrome,
    client_hello: ClientHelloSpec::chrome_120(),
    http2: Http2Settings::chrome(),
    pseudo_order: PseudoHeaderOrder::MethodSchemeAuthorityPath,
    default_headers: headers::chrome_120_headers(),
    host_placement: HostPlacement::AfterConnectionHeaders,
});

static FIREFOX: LazyLock<Profile> = LazyLock::new(|| Profile {
    id: ProfileId::Firefox,
    client_hello: ClientHelloSpec::firefox_120(),
    http2: Http2Settings::firefox(),
    pseudo_order: PseudoHeaderOrder::MethodPathAuthorityScheme,
    default_headers: headers::firefox_120_headers(),
    host_placement: HostPlacement::AfterRequestLine,
});

static SAFARI: LazyLock<Profile> = LazyLock::new(|| Profile {
    id: ProfileId::Safari,
    client_hello: ClientHelloSpec::safari_16(),
    http2: Http2Settings::safari(),
    pseudo_order: PseudoHeaderOrder::MethodSchemePathAuthority,
    default_headers: headers::safari_16_headers(),
    host_placement: HostPlacement::AfterRequestLine,
});

static EDGE: LazyLock<Profile> = LazyLock::new(|| Profile {
    id: ProfileId::Edge,
    client_hello: ClientHelloSpec::edge_120(),
    http2: Http2Settings::chrome(),
    pseudo_order: PseudoHeaderOrder::MethodSchemeAuthorityPath,
    default_headers: headers::edge_120_headers(),
    host_placement: HostPlacement::AfterConnectionHeaders,
});

/// Look up a profile by identity. Total over registered identities.
pub fn lookup(id: ProfileId) -> &'static Profile {
    match id {
        ProfileId::Chrome => &CHROME,
        ProfileId::Firefox => &FIREFOX,
        ProfileId::Safari => &SAFARI,
        ProfileId::Edge => &EDGE,
    }
}

/// Look up a profile by configuration name.
pub fn lookup_name(name: &str) -> Result<&'static Profile> {
    ProfileId::parse(name).map(lookup)
}

/// Draw a uniformly random registered profile.
pub fn random_profile() -> &'static Profile {
    use rand::Rng;
    lookup(ProfileId::ALL[rand::thread_rng().gen_range(0..ProfileId::ALL.len())])
}
