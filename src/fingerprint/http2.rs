//! HTTP/2 fingerprint configuration (SETTINGS frame and pseudo-header order).

/// HTTP/2 SETTINGS for fingerprinting.
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Http2Settings {
    /// Chromium SETTINGS (Chrome and Edge).
    pub fn chrome() -> Self {
        Self {
            header_table_size: 65536,
            enable_push: false,
            max_concurrent_streams: 1000,
            initial_window_size: 6_291_456,
            max_frame_size: 16384,
            max_header_list_size: 262_144,
        }
    }

    /// Firefox SETTINGS: larger stream window, no header list cap.
    pub fn firefox() -> Self {
        Self {
            header_table_size: 65536,
            enable_push: false,
            max_concurrent_streams: 100,
            initial_window_size: 131_072,
            max_frame_size: 16384,
            max_header_list_size: u32::MAX,
        }
    }

    /// Safari SETTINGS.
    pub fn safari() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: 100,
            initial_window_size: 2_097_152,
            max_frame_size: 16384,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self::chrome()
    }
}

/// Pseudo-header emission order for HTTP/2 requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PseudoHeaderOrder {
    /// :method, :scheme, :authority, :path
    #[default]
    MethodSchemeAuthorityPath,
    /// :method, :path, :authority, :scheme (Firefox)
    MethodPathAuthorityScheme,
    /// :method, :scheme, :path, :authority (Safari)
    MethodSchemePathAuthority,
}

impl PseudoHeaderOrder {
    /// Pseudo-header names in emission order.
    pub fn names(&self) -> [&'static str; 4] {
        match self {
            Self::MethodSchemeAuthorityPath => [":method", ":scheme", ":authority", ":path"],
            Self::MethodPathAuthorityScheme => [":method", ":path", ":authority", ":scheme"],
            Self::MethodSchemePathAuthority => [":method", ":scheme", ":path", ":authority"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_settings_values() {
        let s = Http2Settings::chrome();
        assert_eq!(s.header_table_size, 65536);
        assert_eq!(s.initial_window_size, 6_291_456);
        assert_eq!(s.max_concurrent_streams, 1000);
        assert!(!s.enable_push);
    }

    #[test]
    fn pseudo_order_names() {
        assert_eq!(
            PseudoHeaderOrder::default().names(),
            [":method", ":scheme", ":authority", ":path"]
        );
        assert_eq!(
            PseudoHeaderOrder::MethodPathAuthorityScheme.names()[1],
            ":path"
        );
    }
}
