//! # Wraith
//!
//! Fingerprint-faithful HTTP request engine. Wraith performs HTTPS
//! requests that match a chosen browser identity at every observable
//! layer: the TLS ClientHello (BoringSSL with per-profile cipher, curve,
//! signature and extension configuration), ALPN-negotiated HTTP/1.1 or
//! HTTP/2 with profile header ordering and SETTINGS, cookies, and
//! redirect behavior. Requests run through a health-monitored proxy pool
//! under a retrying, rate-limited, cancelable dispatcher driven by a
//! bounded priority worker pool.

// Core data
pub mod cookie;
pub mod error;
pub mod response;
pub mod session;

// Browser profiles
pub mod fingerprint;

// Transport layer
pub mod transport;

// Request pipeline
pub mod challenge;
pub mod dispatch;
pub mod engine;
pub mod pool;
pub mod worker;

// Input formats
pub mod loader;

// Re-exports for convenient access
pub use challenge::ChallengeRules;
pub use cookie::{Cookie, CookieJar, SameSite};
pub use dispatch::{DispatchConfig, Dispatcher, JobOutcome, Priority, RequestJob};
pub use engine::{EngineConfig, HttpEngine, ProtocolSelector};
pub use error::{Error, Result};
pub use fingerprint::{lookup as lookup_profile, Profile, ProfileId};
pub use pool::{PoolConfig, PoolMetrics, ProxyOutcome, ProxyPool, ProxyState, RotationPolicy};
pub use response::{Response, TlsInfo};
pub use session::{CookieConfig, CookiePersistence, Session, SessionMap};
pub use transport::dialer::{AlpnProtocol, TlsDialer};
pub use transport::proxy::ProxyUrl;
pub use worker::{StatsSnapshot, WorkerConfig, WorkerPool};
