//! Transport layer: proxy tunnels, the TLS dialer, and protocol framing.

pub mod dialer;
pub mod h1;
pub mod h2;
pub mod proxy;
