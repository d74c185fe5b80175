//! Error types for the wraith crate.
//!
//! Each variant carries a single meaning the dispatcher can switch on;
//! `retry_class` is the one place that mapping lives.

use std::io;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How hard the dispatcher should penalize the proxy in effect when an
/// attempt fails with a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPenalty {
    /// Failure at the transport layer (TCP, CONNECT/SOCKS5, TLS) or a
    /// classified block: count as a hard failure.
    Hard,
    /// HTTP-layer failure on an otherwise working transport.
    Transient,
    /// The proxy was not at fault (e.g. deadline elapsed while queued).
    None,
}

/// Whether the dispatcher may retry an attempt that failed with this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Fatal,
    Retryable(ProxyPenalty),
}

/// Errors that can occur while configuring or executing requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request or pool configuration is self-inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The named browser profile is not registered.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// TCP connect to the proxy, CONNECT exchange, or SOCKS5 handshake failed.
    #[error("proxy unreachable: {0}")]
    ProxyUnreachable(String),

    /// TLS alert or I/O error during the handshake.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// HTTP I/O, bad framing, or too many redirects.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Response body exceeded the configured ceiling.
    #[error("response body exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },

    /// The same URL appeared twice in one redirect chain.
    #[error("redirect loop at {0}")]
    RedirectLoop(String),

    /// A timer elapsed before the operation completed.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// The job's cancel token fired.
    #[error("canceled")]
    Canceled,

    /// Submission rejected: the priority queue is at capacity.
    #[error("job queue is full")]
    QueueFull,

    /// Submission rejected: the pool is above its memory soft limit.
    #[error("memory pressure: admission paused")]
    MemoryPressure,

    /// The response matched a bot-challenge heuristic.
    #[error("challenge detected: {0}")]
    ChallengeDetected(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(message.into())
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        Self::ProxyUnreachable(message.into())
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::TimedOut(message.into())
    }

    pub fn too_many_redirects(count: u32) -> Self {
        Self::TransportFailure(format!("TooManyRedirects: {count} redirects"))
    }

    pub fn elapsed(what: &str, after: Duration) -> Self {
        Self::TimedOut(format!("{what} after {after:?}"))
    }

    /// Classify for the dispatcher's retry loop.
    pub fn retry_class(&self) -> RetryClass {
        use ProxyPenalty::*;
        match self {
            Self::ProxyUnreachable(_) | Self::TlsHandshakeFailed(_) => RetryClass::Retryable(Hard),
            Self::ChallengeDetected(_) => RetryClass::Retryable(Hard),
            Self::TransportFailure(_) => RetryClass::Retryable(Transient),
            Self::TimedOut(_) => RetryClass::Retryable(None),
            Self::ConfigurationInvalid(_)
            | Self::UnknownProfile(_)
            | Self::ResponseTooLarge { .. }
            | Self::RedirectLoop(_)
            | Self::Canceled
            | Self::QueueFull
            | Self::MemoryPressure => RetryClass::Fatal,
        }
    }

    /// Short stable name for logs and user-visible failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationInvalid(_) => "configuration_invalid",
            Self::UnknownProfile(_) => "unknown_profile",
            Self::ProxyUnreachable(_) => "proxy_unreachable",
            Self::TlsHandshakeFailed(_) => "tls_handshake_failed",
            Self::TransportFailure(_) => "transport_failure",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::RedirectLoop(_) => "redirect_loop",
            Self::TimedOut(_) => "timed_out",
            Self::Canceled => "canceled",
            Self::QueueFull => "queue_full",
            Self::MemoryPressure => "memory_pressure",
            Self::ChallengeDetected(_) => "challenge_detected",
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::TransportFailure(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigurationInvalid(format!("URL parse error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigurationInvalid(format!("JSON error: {err}"))
    }
}
