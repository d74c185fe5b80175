//! Browser TLS ClientHello specifications.
//!
//! Each profile carries a full ClientHello spec: cipher suites in exact
//! order, extensions in exact order, and each extension's payload form.
//! All three are observable on the wire, so the data here must match a
//! real browser version and never drift at runtime. A profile change
//! (e.g. Chrome 120 -> 121) is a new spec, not a mutation of this one.

use crate::error::{Error, Result};

/// TLS protocol version code points.
pub mod version {
    pub const TLS12: u16 = 0x0303;
    pub const TLS13: u16 = 0x0304;
}

/// IANA cipher suite code points used by the registered profiles.
pub mod cipher {
    pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
    pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;
    pub const TLS_CHACHA20_POLY1305_SHA256: u16 = 0x1303;
    pub const ECDHE_ECDSA_AES_128_GCM_SHA256: u16 = 0xc02b;
    pub const ECDHE_RSA_AES_128_GCM_SHA256: u16 = 0xc02f;
    pub const ECDHE_ECDSA_AES_256_GCM_SHA384: u16 = 0xc02c;
    pub const ECDHE_RSA_AES_256_GCM_SHA384: u16 = 0xc030;
    pub const ECDHE_ECDSA_CHACHA20_POLY1305: u16 = 0xcca9;
    pub const ECDHE_RSA_CHACHA20_POLY1305: u16 = 0xcca8;
    pub const ECDHE_ECDSA_AES_128_CBC_SHA: u16 = 0xc009;
    pub const ECDHE_ECDSA_AES_256_CBC_SHA: u16 = 0xc00a;
    pub const ECDHE_RSA_AES_128_CBC_SHA: u16 = 0xc013;
    pub const ECDHE_RSA_AES_256_CBC_SHA: u16 = 0xc014;
    pub const RSA_AES_128_GCM_SHA256: u16 = 0x009c;
    pub const RSA_AES_256_GCM_SHA384: u16 = 0x009d;
    pub const RSA_AES_128_CBC_SHA: u16 = 0x002f;
    pub const RSA_AES_256_CBC_SHA: u16 = 0x0035;
}

/// Supported-groups (curve) code points.
pub mod group {
    pub const X25519: u16 = 0x001d;
    pub const SECP256R1: u16 = 0x0017;
    pub const SECP384R1: u16 = 0x0018;
    pub const SECP521R1: u16 = 0x0019;
}

/// Signature scheme code points.
pub mod sigscheme {
    pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;
    pub const ECDSA_SECP384R1_SHA384: u16 = 0x0503;
    pub const ECDSA_SECP521R1_SHA512: u16 = 0x0603;
    pub const RSA_PSS_RSAE_SHA256: u16 = 0x0804;
    pub const RSA_PSS_RSAE_SHA384: u16 = 0x0805;
    pub const RSA_PSS_RSAE_SHA512: u16 = 0x0806;
    pub const RSA_PKCS1_SHA256: u16 = 0x0401;
    pub const RSA_PKCS1_SHA384: u16 = 0x0501;
    pub const RSA_PKCS1_SHA512: u16 = 0x0601;
}

/// PSK key exchange modes.
pub mod psk_mode {
    pub const DHE: u8 = 1;
}

/// Renegotiation-info payload mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renegotiation {
    /// Empty renegotiated_connection field (initial handshake as client).
    OnceAsClient,
}

/// One TLS extension with its payload shape.
///
/// The extension list is a closed sum: byte-faithfulness is encoded in
/// the variant payloads, and the dialer/template encoder dispatch by
/// match rather than through trait objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsExtension {
    /// server_name (0); the host is filled in at dial time.
    ServerName,
    /// extended_master_secret (23), empty payload.
    ExtendedMasterSecret,
    /// renegotiation_info (65281).
    RenegotiationInfo { mode: Renegotiation },
    /// supported_groups (10).
    SupportedGroups { groups: Vec<u16> },
    /// ec_point_formats (11).
    EcPointFormats { formats: Vec<u8> },
    /// session_ticket (35), empty payload (fresh session).
    SessionTicket,
    /// application_layer_protocol_negotiation (16).
    Alpn { protocols: Vec<&'static str> },
    /// status_request (5), OCSP.
    StatusRequest,
    /// signature_algorithms (13).
    SignatureAlgorithms { schemes: Vec<u16> },
    /// signed_certificate_timestamp (18), empty payload.
    SignedCertificateTimestamp,
    /// key_share (51); template encoding uses zeroed key material of the
    /// group's canonical length.
    KeyShare { groups: Vec<u16> },
    /// psk_key_exchange_modes (45).
    PskKeyExchangeModes { modes: Vec<u8> },
    /// supported_versions (43).
    SupportedVersions { versions: Vec<u16> },
    /// application_settings / ALPS (17513).
    ApplicationSettings { protocols: Vec<&'static str> },
}

impl TlsExtension {
    /// IANA extension type code point.
    pub fn extension_id(&self) -> u16 {
        match self {
            Self::ServerName => 0,
            Self::StatusRequest => 5,
            Self::SupportedGroups { .. } => 10,
            Self::EcPointFormats { .. } => 11,
            Self::SignatureAlgorithms { .. } => 13,
            Self::Alpn { .. } => 16,
            Self::SignedCertificateTimestamp => 18,
            Self::ExtendedMasterSecret => 23,
            Self::SessionTicket => 35,
            Self::SupportedVersions { .. } => 43,
            Self::PskKeyExchangeModes { .. } => 45,
            Self::KeyShare { .. } => 51,
            Self::ApplicationSettings { .. } => 17513,
            Self::RenegotiationInfo { .. } => 65281,
        }
    }

    /// Encode the extension payload (without the type/length prefix).
    fn encode_payload(&self, out: &mut Vec<u8>, sni_host: &str) {
        match self {
            Self::ServerName => {
                // server_name_list: one entry of type host_name (0)
                let host = sni_host.as_bytes();
                put_u16(out, (host.len() + 3) as u16);
                out.push(0);
                put_u16(out, host.len() as u16);
                out.extend_from_slice(host);
            }
            Self::ExtendedMasterSecret | Self::SessionTicket | Self::SignedCertificateTimestamp => {
            }
            Self::StatusRequest => {
                // CertificateStatusRequest: ocsp(1), empty responder list and extensions
                out.push(1);
                put_u16(out, 0);
                put_u16(out, 0);
            }
            Self::RenegotiationInfo { mode } => match mode {
                Renegotiation::OnceAsClient => out.push(0),
            },
            Self::SupportedGroups { groups } => {
                put_u16(out, (groups.len() * 2) as u16);
                for g in groups {
                    put_u16(out, *g);
                }
            }
            Self::EcPointFormats { formats } => {
                out.push(formats.len() as u8);
                out.extend_from_slice(formats);
            }
            Self::SignatureAlgorithms { schemes } => {
                put_u16(out, (schemes.len() * 2) as u16);
                for s in schemes {
                    put_u16(out, *s);
                }
            }
            Self::Alpn { protocols } | Self::ApplicationSettings { protocols } => {
                let list_len: usize = protocols.iter().map(|p| p.len() + 1).sum();
                put_u16(out, list_len as u16);
                for p in protocols {
                    out.push(p.len() as u8);
                    out.extend_from_slice(p.as_bytes());
                }
            }
            Self::KeyShare { groups } => {
                let entries_len: usize = groups.iter().map(|g| 4 + key_share_len(*g)).sum();
                put_u16(out, entries_len as u16);
                for g in groups {
                    put_u16(out, *g);
                    let klen = key_share_len(*g);
                    put_u16(out, klen as u16);
                    out.resize(out.len() + klen, 0);
                }
            }
            Self::PskKeyExchangeModes { modes } => {
                out.push(modes.len() as u8);
                out.extend_from_slice(modes);
            }
            Self::SupportedVersions { versions } => {
                out.push((versions.len() * 2) as u8);
                for v in versions {
                    put_u16(out, *v);
                }
            }
        }
    }
}

/// Canonical public-key length for a key-share group.
fn key_share_len(group: u16) -> usize {
    match group {
        g if g == group::X25519 => 32,
        g if g == group::SECP256R1 => 65,
        g if g == group::SECP384R1 => 97,
        g if g == group::SECP521R1 => 133,
        _ => 32,
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Full ClientHello specification for one browser profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    /// TLS version floor.
    pub min_version: u16,
    /// TLS version ceiling.
    pub max_version: u16,
    /// Cipher suites in exact order (IANA code points).
    pub cipher_suites: Vec<u16>,
    /// Extensions in exact order, each with its payload.
    pub extensions: Vec<TlsExtension>,
    /// GREASE values injected by the handshake library (Chromium only).
    pub grease: bool,
}

impl ClientHelloSpec {
    /// Chrome 120 ClientHello.
    pub fn chrome_120() -> Self {
        use cipher::*;
        Self {
            min_version: version::TLS12,
            max_version: version::TLS13,
            cipher_suites: vec![
                TLS_AES_128_GCM_SHA256,
                TLS_AES_256_GCM_SHA384,
                TLS_CHACHA20_POLY1305_SHA256,
                ECDHE_ECDSA_AES_128_GCM_SHA256,
                ECDHE_RSA_AES_128_GCM_SHA256,
                ECDHE_ECDSA_AES_256_GCM_SHA384,
                ECDHE_RSA_AES_256_GCM_SHA384,
                ECDHE_ECDSA_CHACHA20_POLY1305,
                ECDHE_RSA_CHACHA20_POLY1305,
                ECDHE_RSA_AES_128_CBC_SHA,
                ECDHE_RSA_AES_256_CBC_SHA,
                RSA_AES_128_GCM_SHA256,
                RSA_AES_256_GCM_SHA384,
                RSA_AES_128_CBC_SHA,
                RSA_AES_256_CBC_SHA,
            ],
            extensions: vec![
                TlsExtension::ServerName,
                TlsExtension::ExtendedMasterSecret,
                TlsExtension::RenegotiationInfo {
                    mode: Renegotiation::OnceAsClient,
                },
                TlsExtension::SupportedGroups {
                    groups: vec![group::X25519, group::SECP256R1, group::SECP384R1],
                },
                TlsExtension::EcPointFormats { formats: vec![0] },
                TlsExtension::SessionTicket,
                TlsExtension::Alpn {
                    protocols: vec!["h2", "http/1.1"],
                },
                TlsExtension::StatusRequest,
                TlsExtension::SignatureAlgorithms {
                    schemes: vec![
                        sigscheme::ECDSA_SECP256R1_SHA256,
                        sigscheme::RSA_PSS_RSAE_SHA256,
                        sigscheme::RSA_PKCS1_SHA256,
                        sigscheme::ECDSA_SECP384R1_SHA384,
                        sigscheme::RSA_PSS_RSAE_SHA384,
                        sigscheme::RSA_PKCS1_SHA384,
                        sigscheme::RSA_PSS_RSAE_SHA512,
                        sigscheme::RSA_PKCS1_SHA512,
                    ],
                },
                TlsExtension::SignedCertificateTimestamp,
                TlsExtension::KeyShare {
                    groups: vec![group::X25519, group::SECP256R1],
                },
                TlsExtension::PskKeyExchangeModes {
                    modes: vec![psk_mode::DHE],
                },
                TlsExtension::SupportedVersions {
                    versions: vec![version::TLS13, version::TLS12],
                },
                TlsExtension::ApplicationSettings {
                    protocols: vec!["h2", "http/1.1"],
                },
            ],
            grease: true,
        }
    }

    /// Firefox 120 ClientHello.
    ///
    /// Firefox prefers ChaCha20 above AES-256, supports P-521, carries the
    /// ECDSA CBC suites Chrome dropped, and does not use GREASE or ALPS.
    pub fn firefox_120() -> Self {
        use cipher::*;
        Self {
            min_version: version::TLS12,
            max_version: version::TLS13,
            cipher_suites: vec![
                TLS_AES_128_GCM_SHA256,
                TLS_CHACHA20_POLY1305_SHA256,
                TLS_AES_256_GCM_SHA384,
                ECDHE_ECDSA_AES_128_GCM_SHA256,
                ECDHE_RSA_AES_128_GCM_SHA256,
                ECDHE_ECDSA_CHACHA20_POLY1305,
                ECDHE_RSA_CHACHA20_POLY1305,
                ECDHE_ECDSA_AES_256_GCM_SHA384,
                ECDHE_RSA_AES_256_GCM_SHA384,
                ECDHE_ECDSA_AES_256_CBC_SHA,
                ECDHE_ECDSA_AES_128_CBC_SHA,
                ECDHE_RSA_AES_128_CBC_SHA,
                ECDHE_RSA_AES_256_CBC_SHA,
                RSA_AES_128_GCM_SHA256,
                RSA_AES_256_GCM_SHA384,
                RSA_AES_128_CBC_SHA,
                RSA_AES_256_CBC_SHA,
            ],
            extensions: vec![
                TlsExtension::ServerName,
                TlsExtension::ExtendedMasterSecret,
                TlsExtension::RenegotiationInfo {
                    mode: Renegotiation::OnceAsClient,
                },
                TlsExtension::SupportedGroups {
                    groups: vec![
                        group::X25519,
                        group::SECP256R1,
                        group::SECP384R1,
                        group::SECP521R1,
                    ],
                },
                TlsExtension::EcPointFormats { formats: vec![0] },
                TlsExtension::SessionTicket,
                TlsExtension::Alpn {
                    protocols: vec!["h2", "http/1.1"],
                },
                TlsExtension::StatusRequest,
                TlsExtension::SignatureAlgorithms {
                    schemes: vec![
                        sigscheme::ECDSA_SECP256R1_SHA256,
                        sigscheme::ECDSA_SECP384R1_SHA384,
                        sigscheme::ECDSA_SECP521R1_SHA512,
                        sigscheme::RSA_PSS_RSAE_SHA256,
                        sigscheme::RSA_PSS_RSAE_SHA384,
                        sigscheme::RSA_PSS_RSAE_SHA512,
                        sigscheme::RSA_PKCS1_SHA256,
                        sigscheme::RSA_PKCS1_SHA384,
                        sigscheme::RSA_PKCS1_SHA512,
                    ],
                },
                TlsExtension::KeyShare {
                    groups: vec![group::X25519, group::SECP256R1],
                },
                TlsExtension::PskKeyExchangeModes {
                    modes: vec![psk_mode::DHE],
                },
                TlsExtension::SupportedVersions {
                    versions: vec![version::TLS13, version::TLS12],
                },
            ],
            grease: false,
        }
    }

    /// Safari 16 ClientHello.
    pub fn safari_16() -> Self {
        use cipher::*;
        Self {
            min_version: version::TLS12,
            max_version: version::TLS13,
            cipher_suites: vec![
                TLS_AES_128_GCM_SHA256,
                TLS_AES_256_GCM_SHA384,
                TLS_CHACHA20_POLY1305_SHA256,
                ECDHE_ECDSA_AES_256_GCM_SHA384,
                ECDHE_ECDSA_AES_128_GCM_SHA256,
                ECDHE_ECDSA_CHACHA20_POLY1305,
                ECDHE_RSA_AES_256_GCM_SHA384,
                ECDHE_RSA_AES_128_GCM_SHA256,
                ECDHE_RSA_CHACHA20_POLY1305,
                ECDHE_ECDSA_AES_256_CBC_SHA,
                ECDHE_ECDSA_AES_128_CBC_SHA,
                ECDHE_RSA_AES_256_CBC_SHA,
                ECDHE_RSA_AES_128_CBC_SHA,
            ],
            extensions: vec![
                TlsExtension::ServerName,
                TlsExtension::ExtendedMasterSecret,
                TlsExtension::RenegotiationInfo {
                    mode: Renegotiation::OnceAsClient,
                },
                TlsExtension::SupportedGroups {
                    groups: vec![
                        group::X25519,
                        group::SECP256R1,
                        group::SECP384R1,
                        group::SECP521R1,
                    ],
                },
                TlsExtension::EcPointFormats { formats: vec![0] },
                TlsExtension::SessionTicket,
                TlsExtension::Alpn {
                    protocols: vec!["h2", "http/1.1"],
                },
                TlsExtension::StatusRequest,
                TlsExtension::SignatureAlgorithms {
                    schemes: vec![
                        sigscheme::ECDSA_SECP256R1_SHA256,
                        sigscheme::RSA_PSS_RSAE_SHA256,
                        sigscheme::RSA_PKCS1_SHA256,
                        sigscheme::ECDSA_SECP384R1_SHA384,
                        sigscheme::RSA_PSS_RSAE_SHA384,
                        sigscheme::RSA_PKCS1_SHA384,
                        sigscheme::RSA_PSS_RSAE_SHA512,
                        sigscheme::RSA_PKCS1_SHA512,
                    ],
                },
                TlsExtension::KeyShare {
                    groups: vec![group::X25519],
                },
                TlsExtension::PskKeyExchangeModes {
                    modes: vec![psk_mode::DHE],
                },
                TlsExtension::SupportedVersions {
                    versions: vec![version::TLS13, version::TLS12],
                },
            ],
            grease: false,
        }
    }

    /// Edge 120 shares the Chromium TLS stack with Chrome.
    pub fn edge_120() -> Self {
        Self::chrome_120()
    }

    /// ALPN protocol list carried by this spec, in order.
    pub fn alpn_protocols(&self) -> Vec<&'static str> {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                TlsExtension::Alpn { protocols } => Some(protocols.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Narrow the ALPN (and ALPS) lists to `requested`, preserving the
    /// spec's order. Fails if the intersection is empty.
    pub fn with_alpn(&self, requested: &[&str]) -> Result<Self> {
        let mut narrowed = self.clone();
        let mut intersection: Vec<&'static str> = Vec::new();
        for ext in &mut narrowed.extensions {
            match ext {
                TlsExtension::Alpn { protocols } => {
                    protocols.retain(|p| requested.contains(p));
                    intersection = protocols.clone();
                }
                TlsExtension::ApplicationSettings { protocols } => {
                    protocols.retain(|p| requested.contains(p));
                }
                _ => {}
            }
        }
        if intersection.is_empty() {
            return Err(Error::config(format!(
                "no common ALPN protocol between profile and request ({requested:?})"
            )));
        }
        Ok(narrowed)
    }

    /// Extension IDs in wire order.
    pub fn extension_ids(&self) -> Vec<u16> {
        self.extensions.iter().map(|e| e.extension_id()).collect()
    }

    /// Supported-groups list, if the spec carries one.
    pub fn groups(&self) -> &[u16] {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                TlsExtension::SupportedGroups { groups } => Some(groups.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Signature scheme list, if the spec carries one.
    pub fn signature_schemes(&self) -> &[u16] {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                TlsExtension::SignatureAlgorithms { schemes } => Some(schemes.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Whether the spec offers a session ticket extension.
    pub fn offers_session_ticket(&self) -> bool {
        self.extensions
            .iter()
            .any(|e| matches!(e, TlsExtension::SessionTicket))
    }

    /// Deterministic template encoding of the ClientHello body.
    ///
    /// Random, session id, and key-share material are zeroed so the
    /// output is byte-identical across runs; everything else (cipher
    /// order, extension order, extension payloads) is the exact wire
    /// layout. This is what golden-byte tests pin.
    pub fn encode_template(&self, sni_host: &str) -> Vec<u8> {
        let mut hello = Vec::with_capacity(512);

        put_u16(&mut hello, version::TLS12); // legacy_version
        hello.resize(hello.len() + 32, 0); // random (zeroed)
        hello.push(0); // session_id length

        put_u16(&mut hello, (self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            put_u16(&mut hello, *suite);
        }

        hello.push(1); // compression_methods
        hello.push(0); // null

        let mut ext_block = Vec::with_capacity(384);
        for ext in &self.extensions {
            let mut payload = Vec::new();
            ext.encode_payload(&mut payload, sni_host);
            put_u16(&mut ext_block, ext.extension_id());
            put_u16(&mut ext_block, payload.len() as u16);
            ext_block.extend_from_slice(&payload);
        }
        put_u16(&mut hello, ext_block.len() as u16);
        hello.extend_from_slice(&ext_block);

        hello
    }

    /// JA3-style fingerprint string:
    /// `version,ciphers,extensions,groups,point-formats`.
    pub fn ja3_string(&self) -> String {
        let join = |vals: &[u16]| {
            vals.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("-")
        };
        let points = self
            .extensions
            .iter()
            .find_map(|ext| match ext {
                TlsExtension::EcPointFormats { formats } => Some(
                    formats
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join("-"),
                ),
                _ => None,
            })
            .unwrap_or_default();
        format!(
            "{},{},{},{},{}",
            self.max_version,
            join(&self.cipher_suites),
            join(&self.extension_ids()),
            join(self.groups()),
            points
        )
    }
}

/// OpenSSL cipher-list name for a TLS 1.2 suite code point, for handing
/// to BoringSSL. TLS 1.3 suites are fixed by the library and excluded.
pub fn openssl_cipher_name(suite: u16) -> Option<&'static str> {
    use cipher::*;
    Some(match suite {
        ECDHE_ECDSA_AES_128_GCM_SHA256 => "ECDHE-ECDSA-AES128-GCM-SHA256",
        ECDHE_RSA_AES_128_GCM_SHA256 => "ECDHE-RSA-AES128-GCM-SHA256",
        ECDHE_ECDSA_AES_256_GCM_SHA384 => "ECDHE-ECDSA-AES256-GCM-SHA384",
        ECDHE_RSA_AES_256_GCM_SHA384 => "ECDHE-RSA-AES256-GCM-SHA384",
        ECDHE_ECDSA_CHACHA20_POLY1305 => "ECDHE-ECDSA-CHACHA20-POLY1305",
        ECDHE_RSA_CHACHA20_POLY1305 => "ECDHE-RSA-CHACHA20-POLY1305",
        ECDHE_ECDSA_AES_128_CBC_SHA => "ECDHE-ECDSA-AES128-SHA",
        ECDHE_ECDSA_AES_256_CBC_SHA => "ECDHE-ECDSA-AES256-SHA",
        ECDHE_RSA_AES_128_CBC_SHA => "ECDHE-RSA-AES128-SHA",
        ECDHE_RSA_AES_256_CBC_SHA => "ECDHE-RSA-AES256-SHA",
        RSA_AES_128_GCM_SHA256 => "AES128-GCM-SHA256",
        RSA_AES_256_GCM_SHA384 => "AES256-GCM-SHA384",
        RSA_AES_128_CBC_SHA => "AES128-SHA",
        RSA_AES_256_CBC_SHA => "AES256-SHA",
        _ => return None,
    })
}

/// BoringSSL group-list name for a supported-group code point.
pub fn boring_group_name(group_id: u16) -> Option<&'static str> {
    Some(match group_id {
        g if g == group::X25519 => "X25519",
        g if g == group::SECP256R1 => "P-256",
        g if g == group::SECP384R1 => "P-384",
        g if g == group::SECP521R1 => "P-521",
        _ => return None,
    })
}

/// BoringSSL sigalgs-list name for a signature scheme code point.
pub fn boring_sigalg_name(scheme: u16) -> Option<&'static str> {
    use sigscheme::*;
    Some(match scheme {
        ECDSA_SECP256R1_SHA256 => "ecdsa_secp256r1_sha256",
        ECDSA_SECP384R1_SHA384 => "ecdsa_secp384r1_sha384",
        ECDSA_SECP521R1_SHA512 => "ecdsa_secp521r1_sha512",
        RSA_PSS_RSAE_SHA256 => "rsa_pss_rsae_sha256",
        RSA_PSS_RSAE_SHA384 => "rsa_pss_rsae_sha384",
        RSA_PSS_RSAE_SHA512 => "rsa_pss_rsae_sha512",
        RSA_PKCS1_SHA256 => "rsa_pkcs1_sha256",
        RSA_PKCS1_SHA384 => "rsa_pkcs1_sha384",
        RSA_PKCS1_SHA512 => "rsa_pkcs1_sha512",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_cipher_order_is_exact() {
        let spec = ClientHelloSpec::chrome_120();
        let wire: Vec<u8> = spec
            .cipher_suites
            .iter()
            .flat_map(|c| c.to_be_bytes())
            .collect();
        let expected = [
            0x13u8, 0x01, 0x13, 0x02, 0x13, 0x03, 0xc0, 0x2b, 0xc0, 0x2f, 0xc0, 0x2c, 0xc0, 0x30,
            0xcc, 0xa9, 0xcc, 0xa8, 0xc0, 0x13, 0xc0, 0x14, 0x00, 0x9c, 0x00, 0x9d, 0x00, 0x2f,
            0x00, 0x35,
        ];
        assert_eq!(wire, expected);
    }

    #[test]
    fn chrome_extension_order_is_exact() {
        let spec = ClientHelloSpec::chrome_120();
        assert_eq!(
            spec.extension_ids(),
            vec![0, 23, 65281, 10, 11, 35, 16, 5, 13, 18, 51, 45, 43, 17513]
        );
    }

    #[test]
    fn firefox_has_no_grease_or_alps() {
        let spec = ClientHelloSpec::firefox_120();
        assert!(!spec.grease);
        assert!(!spec
            .extensions
            .iter()
            .any(|e| matches!(e, TlsExtension::ApplicationSettings { .. })));
        assert!(spec.groups().contains(&group::SECP521R1));
    }

    #[test]
    fn template_encoding_is_deterministic() {
        let a = ClientHelloSpec::chrome_120().encode_template("example.test");
        let b = ClientHelloSpec::chrome_120().encode_template("example.test");
        assert_eq!(a, b);
        // Different SNI changes only the server_name payload.
        let c = ClientHelloSpec::chrome_120().encode_template("other.test");
        assert_ne!(a, c);
    }

    #[test]
    fn template_starts_with_legacy_version_and_zero_random() {
        let bytes = ClientHelloSpec::firefox_120().encode_template("example.test");
        assert_eq!(&bytes[..2], &[0x03, 0x03]);
        assert!(bytes[2..34].iter().all(|&b| b == 0));
        assert_eq!(bytes[34], 0); // empty session id
    }

    #[test]
    fn alpn_narrowing_preserves_profile_order() {
        let spec = ClientHelloSpec::chrome_120();
        let narrowed = spec.with_alpn(&["http/1.1"]).unwrap();
        assert_eq!(narrowed.alpn_protocols(), vec!["http/1.1"]);
        // Full set keeps h2 first, as the profile registered it.
        let both = spec.with_alpn(&["http/1.1", "h2"]).unwrap();
        assert_eq!(both.alpn_protocols(), vec!["h2", "http/1.1"]);
    }

    #[test]
    fn alpn_narrowing_rejects_empty_intersection() {
        let spec = ClientHelloSpec::safari_16();
        assert!(spec.with_alpn(&["h3"]).is_err());
    }

    #[test]
    fn sni_payload_carries_literal_host() {
        let bytes = ClientHelloSpec::chrome_120().encode_template("a.test");
        let needle = b"a.test";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn ja3_string_shape() {
        let ja3 = ClientHelloSpec::chrome_120().ja3_string();
        let fields: Vec<&str> = ja3.split(',').collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "772"); // 0x0304
        assert!(fields[1].starts_with("4865-")); // 0x1301
    }

    #[test]
    fn every_profile_cipher_maps_to_boring_or_tls13() {
        for spec in [
            ClientHelloSpec::chrome_120(),
            ClientHelloSpec::firefox_120(),
            ClientHelloSpec::safari_16(),
        ] {
            for suite in &spec.cipher_suites {
                let tls13 = (0x1301..=0x1303).contains(suite);
                assert!(
                    tls13 || openssl_cipher_name(*suite).is_some(),
                    "unmapped cipher {suite:#06x}"
                );
            }
        }
    }
}
