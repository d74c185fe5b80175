//! Background proxy health probing.
//!
//! A probe is an ordinary GET through the proxy to a configured test
//! URL with a short timeout; its outcome feeds the pool's state machine
//! exactly like a dispatched request's would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use tokio_util::sync::CancellationToken;

use crate::engine::{HttpEngine, ProtocolSelector};
use crate::fingerprint::{self, ProfileId};
use crate::pool::{ProxyOutcome, ProxyPool};
use crate::session::{CookiePersistence, SessionMap};

/// Runs health passes against every proxy in a pool.
pub struct ProbeRunner {
    pool: Arc<ProxyPool>,
    engine: Arc<HttpEngine>,
    /// Probes carry no user state; this map exists only to satisfy the
    /// engine's session contract.
    sessions: SessionMap,
}

impl ProbeRunner {
    pub fn new(pool: Arc<ProxyPool>, engine: Arc<HttpEngine>) -> Self {
        Self {
            pool,
            engine,
            sessions: SessionMap::new(CookiePersistence::None, Duration::from_secs(3600)),
        }
    }

    /// Run one health pass over all registered proxies.
    ///
    /// Probes run here, never inside `acquire`; the pool lock is only
    /// touched when an outcome is recorded.
    pub async fn probe_all(&self, cancel: &CancellationToken) {
        let targets = self.pool.probe_targets();
        let probe_url = self.pool.config().probe_url.clone();
        let probe_timeout = self.pool.config().probe_timeout;

        for proxy in targets {
            if cancel.is_cancelled() {
                return;
            }
            let identity = proxy.identity();
            let session = self.sessions.get_or_create("probe");
            let profile = fingerprint::lookup(ProfileId::Chrome);

            let started = Instant::now();
            let exchange = self.engine.execute(
                Method::GET,
                &probe_url,
                &[],
                None,
                &session,
                profile,
                ProtocolSelector::Auto,
                Some(&proxy),
                cancel,
            );
            let outcome = match tokio::time::timeout(probe_timeout, exchange).await {
                Ok(Ok(response)) if response.is_success() => ProxyOutcome::Success {
                    latency: started.elapsed(),
                },
                Ok(Ok(response)) => {
                    ProxyOutcome::HardFailure(format!("probe HTTP {}", response.status))
                }
                Ok(Err(err)) => ProxyOutcome::HardFailure(format!("probe: {err}")),
                Err(_) => ProxyOutcome::HardFailure(format!(
                    "probe timed out after {probe_timeout:?}"
                )),
            };
            tracing::debug!(proxy = %identity, ?outcome, "probe complete");
            self.pool.release(&identity, outcome);
        }
    }

    /// Spawn the periodic probe loop. An initial pass runs immediately.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = self.pool.config().probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.probe_all(&cancel).await,
                }
            }
        })
    }
}
