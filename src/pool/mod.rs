//! Upstream proxy pool: health state, selection policy, metrics.
//!
//! The pool owns its records exclusively and exposes operations; the
//! dispatcher and the background prober both feed the same state machine
//! through `release`. All operations are short and lock-internal, so
//! callers never hold pool state across await points.

pub mod probe;

use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

use crate::transport::proxy::ProxyUrl;

/// Health state of one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Active,
    Degraded,
    Failed,
    Disabled,
}

/// Rotation policy, fixed at pool construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    /// Advance an index on every acquire; state is ignored.
    PerRequest,
    /// Keep returning the current proxy; advance only on hard failure.
    StickyUntilError,
    /// Prefer Active proxies with the lowest observed latency.
    #[default]
    HealthAware,
}

impl RotationPolicy {
    pub fn parse(name: &str) -> crate::error::Result<Self> {
        match name {
            "per-request" => Ok(Self::PerRequest),
            "on-error" => Ok(Self::StickyUntilError),
            "health-aware" => Ok(Self::HealthAware),
            other => Err(crate::error::Error::config(format!(
                "unknown proxy-rotation {other:?}"
            ))),
        }
    }
}

/// Outcome of one request or probe through a proxy.
#[derive(Debug, Clone)]
pub enum ProxyOutcome {
    Success { latency: Duration },
    /// HTTP-layer failure on a working transport.
    TransientFailure(String),
    /// Transport-layer failure or a classified block.
    HardFailure(String),
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub policy: RotationPolicy,
    /// Consecutive hard failures before a proxy transitions to Failed.
    pub max_failures: u32,
    /// Latency above this marks an Active proxy Degraded; below it, a
    /// Degraded proxy recovers.
    pub degraded_latency: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            policy: RotationPolicy::HealthAware,
            max_failures: 3,
            degraded_latency: Duration::from_secs(10),
            probe_interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            probe_url: "https://httpbin.org/ip".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ProxyRecord {
    url: ProxyUrl,
    identity: String,
    state: ProxyState,
    last_check: Option<SystemTime>,
    latency: Option<Duration>,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    region: Option<String>,
    last_selected: Option<Instant>,
}

impl ProxyRecord {
    fn new(url: ProxyUrl) -> Self {
        let identity = url.identity();
        Self {
            url,
            identity,
            state: ProxyState::Active,
            last_check: None,
            latency: None,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            last_error: None,
            region: None,
            last_selected: None,
        }
    }

    fn uptime(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            100.0
        } else {
            self.successes as f64 / total as f64 * 100.0
        }
    }
}

/// Point-in-time health report for one proxy.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyHealth {
    pub url: String,
    pub state: ProxyState,
    pub latency_ms: Option<u64>,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub uptime: f64,
    pub last_error: Option<String>,
    pub region: Option<String>,
}

/// Aggregate pool metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub active: usize,
    pub degraded: usize,
    pub failed: usize,
    pub disabled: usize,
    pub avg_latency_ms: u64,
    pub avg_uptime: f64,
}

struct PoolInner {
    records: Vec<ProxyRecord>,
    cursor: usize,
}

/// The proxy pool.
pub struct ProxyPool {
    inner: RwLock<PoolInner>,
    config: PoolConfig,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyUrl>, config: PoolConfig) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                records: proxies.into_iter().map(ProxyRecord::new).collect(),
                cursor: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Register a proxy at runtime. Duplicate identities are ignored.
    pub fn add(&self, url: ProxyUrl) {
        let mut inner = self.inner.write();
        let identity = url.identity();
        if !inner.records.iter().any(|r| r.identity == identity) {
            inner.records.push(ProxyRecord::new(url));
        }
    }

    /// Remove a proxy by identity.
    pub fn remove(&self, identity: &str) -> bool {
        let mut inner = self.inner.write();
        let before = inner.records.len();
        inner.records.retain(|r| r.identity != identity);
        inner.cursor = 0;
        inner.records.len() != before
    }

    /// Select a proxy per policy, honoring a session's pin.
    ///
    /// Returns `None` when no proxies are configured, or when the policy
    /// is health-aware and every proxy is Disabled.
    pub fn acquire(&self, session: Option<&crate::session::Session>) -> Option<ProxyUrl> {
        let mut inner = self.inner.write();
        if inner.records.is_empty() {
            return None;
        }

        // A pinned proxy wins unless it is Failed or Disabled, in which
        // case the pin is rewritten to the fresh policy choice.
        if let Some(session) = session {
            if let Some(pin) = session.pinned_proxy() {
                if let Some(record) = inner.records.iter_mut().find(|r| r.identity == pin) {
                    if !matches!(record.state, ProxyState::Failed | ProxyState::Disabled) {
                        record.last_selected = Some(Instant::now());
                        return Some(record.url.clone());
                    }
                }
                let choice = self.select(&mut inner)?;
                session.pin_proxy(choice.identity());
                return Some(choice);
            }
        }

        self.select(&mut inner)
    }

    fn select(&self, inner: &mut PoolInner) -> Option<ProxyUrl> {
        let chosen = match self.config.policy {
            RotationPolicy::PerRequest => {
                let idx = inner.cursor % inner.records.len();
                inner.cursor = (inner.cursor + 1) % inner.records.len();
                Some(idx)
            }
            RotationPolicy::StickyUntilError => Some(inner.cursor % inner.records.len()),
            RotationPolicy::HealthAware => {
                let active = best_by_latency(&inner.records, |r| r.state == ProxyState::Active);
                match active {
                    Some(idx) => Some(idx),
                    // Fall back to any non-Disabled proxy; all Disabled
                    // means nothing is selectable.
                    None => best_by_latency(&inner.records, |r| r.state != ProxyState::Disabled),
                }
            }
        }?;

        let record = &mut inner.records[chosen];
        record.last_selected = Some(Instant::now());
        Some(record.url.clone())
    }

    /// Feed one outcome into the proxy's state machine.
    pub fn release(&self, identity: &str, outcome: ProxyOutcome) {
        let mut inner = self.inner.write();
        let sticky = self.config.policy == RotationPolicy::StickyUntilError;
        let records_len = inner.records.len();
        let Some(idx) = inner.records.iter().position(|r| r.identity == identity) else {
            return;
        };
        let max_failures = self.config.max_failures;
        let degraded_latency = self.config.degraded_latency;
        let record = &mut inner.records[idx];
        record.last_check = Some(SystemTime::now());

        // A manually disabled proxy stays disabled until explicit enable.
        let manually_disabled = record.state == ProxyState::Disabled;

        match outcome {
            ProxyOutcome::Success { latency } => {
                record.successes += 1;
                record.consecutive_failures = 0;
                record.latency = Some(latency);
                record.last_error = None;
                if !manually_disabled {
                    record.state = if latency > degraded_latency {
                        ProxyState::Degraded
                    } else {
                        ProxyState::Active
                    };
                }
            }
            ProxyOutcome::TransientFailure(error) => {
                record.failures += 1;
                record.consecutive_failures += 1;
                record.last_error = Some(error);
                if !manually_disabled && record.state == ProxyState::Active {
                    record.state = ProxyState::Degraded;
                }
            }
            ProxyOutcome::HardFailure(error) => {
                record.failures += 1;
                record.consecutive_failures += 1;
                record.last_error = Some(error.clone());
                if !manually_disabled && record.consecutive_failures >= max_failures {
                    tracing::warn!(proxy = %record.identity, %error, "proxy marked failed");
                    record.state = ProxyState::Failed;
                }
                if sticky && records_len > 0 {
                    inner.cursor = (inner.cursor + 1) % records_len;
                }
            }
        }
    }

    /// Manually disable a proxy.
    pub fn disable(&self, identity: &str) {
        if let Some(record) = self
            .inner
            .write()
            .records
            .iter_mut()
            .find(|r| r.identity == identity)
        {
            record.state = ProxyState::Disabled;
        }
    }

    /// Manually enable a proxy, resetting its counters.
    pub fn enable(&self, identity: &str) {
        if let Some(record) = self
            .inner
            .write()
            .records
            .iter_mut()
            .find(|r| r.identity == identity)
        {
            record.state = ProxyState::Active;
            record.consecutive_failures = 0;
            record.failures = 0;
            record.successes = 0;
            record.last_error = None;
        }
    }

    /// Tag a proxy with a geographic region.
    pub fn set_region(&self, identity: &str, region: impl Into<String>) {
        if let Some(record) = self
            .inner
            .write()
            .records
            .iter_mut()
            .find(|r| r.identity == identity)
        {
            record.region = Some(region.into());
        }
    }

    /// Proxies to probe: every registered record, so Failed proxies can
    /// recover and Degraded ones re-prove themselves.
    pub fn probe_targets(&self) -> Vec<ProxyUrl> {
        self.inner.read().records.iter().map(|r| r.url.clone()).collect()
    }

    /// Health report for one proxy.
    pub fn health(&self, identity: &str) -> Option<ProxyHealth> {
        self.inner
            .read()
            .records
            .iter()
            .find(|r| r.identity == identity)
            .map(health_of)
    }

    /// Health report for every proxy.
    pub fn health_all(&self) -> Vec<ProxyHealth> {
        self.inner.read().records.iter().map(health_of).collect()
    }

    /// Aggregate metrics snapshot.
    pub fn snapshot(&self) -> PoolMetrics {
        let inner = self.inner.read();
        let mut metrics = PoolMetrics {
            total: inner.records.len(),
            active: 0,
            degraded: 0,
            failed: 0,
            disabled: 0,
            avg_latency_ms: 0,
            avg_uptime: 0.0,
        };
        let mut latency_sum = Duration::ZERO;
        let mut latency_count = 0u32;
        for record in &inner.records {
            match record.state {
                ProxyState::Active => metrics.active += 1,
                ProxyState::Degraded => metrics.degraded += 1,
                ProxyState::Failed => metrics.failed += 1,
                ProxyState::Disabled => metrics.disabled += 1,
            }
            if let Some(latency) = record.latency {
                latency_sum += latency;
                latency_count += 1;
            }
            metrics.avg_uptime += record.uptime();
        }
        if latency_count > 0 {
            metrics.avg_latency_ms = (latency_sum / latency_count).as_millis() as u64;
        }
        if metrics.total > 0 {
            metrics.avg_uptime /= metrics.total as f64;
        }
        metrics
    }
}

fn health_of(record: &ProxyRecord) -> ProxyHealth {
    ProxyHealth {
        url: record.identity.clone(),
        state: record.state,
        latency_ms: record.latency.map(|l| l.as_millis() as u64),
        successes: record.successes,
        failures: record.failures,
        consecutive_failures: record.consecutive_failures,
        uptime: record.uptime(),
        last_error: record.last_error.clone(),
        region: record.region.clone(),
    }
}

/// Lowest observed latency among records passing the filter; ties go to
/// the least-recently-used.
fn best_by_latency(records: &[ProxyRecord], filter: impl Fn(&ProxyRecord) -> bool) -> Option<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, r)| filter(r))
        .min_by_key(|(_, r)| {
            (
                r.latency.unwrap_or(Duration::ZERO),
                r.last_selected.map(|t| std::cmp::Reverse(t.elapsed())),
            )
        })
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies(n: usize) -> Vec<ProxyUrl> {
        (0..n)
            .map(|i| ProxyUrl::parse(&format!("http://10.0.0.{}:8080", i + 1)).unwrap())
            .collect()
    }

    fn pool(n: usize, policy: RotationPolicy, max_failures: u32) -> ProxyPool {
        ProxyPool::new(
            proxies(n),
            PoolConfig {
                policy,
                max_failures,
                ..PoolConfig::default()
            },
        )
    }

    #[test]
    fn empty_pool_acquires_none() {
        let pool = pool(0, RotationPolicy::HealthAware, 3);
        assert!(pool.acquire(None).is_none());
    }

    #[test]
    fn per_request_round_robins_regardless_of_state() {
        let pool = pool(2, RotationPolicy::PerRequest, 1);
        let first = pool.acquire(None).unwrap().identity();
        pool.release(&first, ProxyOutcome::HardFailure("down".into()));
        let ids: Vec<String> = (0..4).map(|_| pool.acquire(None).unwrap().identity()).collect();
        // Failed proxy keeps appearing in the rotation.
        assert!(ids.contains(&first));
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn sticky_advances_only_on_hard_failure() {
        let pool = pool(2, RotationPolicy::StickyUntilError, 3);
        let first = pool.acquire(None).unwrap().identity();
        assert_eq!(pool.acquire(None).unwrap().identity(), first);
        pool.release(&first, ProxyOutcome::TransientFailure("500".into()));
        assert_eq!(pool.acquire(None).unwrap().identity(), first);
        pool.release(&first, ProxyOutcome::HardFailure("refused".into()));
        assert_ne!(pool.acquire(None).unwrap().identity(), first);
    }

    #[test]
    fn health_aware_skips_failed_until_probe_success() {
        let pool = pool(2, RotationPolicy::HealthAware, 1);
        let p1 = pool.acquire(None).unwrap().identity();
        pool.release(&p1, ProxyOutcome::HardFailure("refused".into()));
        assert_eq!(pool.health(&p1).unwrap().state, ProxyState::Failed);

        for _ in 0..10 {
            assert_ne!(pool.acquire(None).unwrap().identity(), p1);
        }

        // One successful probe restores eligibility.
        pool.release(&p1, ProxyOutcome::Success { latency: Duration::from_millis(50) });
        assert_eq!(pool.health(&p1).unwrap().state, ProxyState::Active);
    }

    #[test]
    fn health_aware_prefers_lowest_latency() {
        let pool = pool(3, RotationPolicy::HealthAware, 3);
        let ids: Vec<String> = pool.health_all().iter().map(|h| h.url.clone()).collect();
        pool.release(&ids[0], ProxyOutcome::Success { latency: Duration::from_millis(300) });
        pool.release(&ids[1], ProxyOutcome::Success { latency: Duration::from_millis(20) });
        pool.release(&ids[2], ProxyOutcome::Success { latency: Duration::from_millis(150) });
        assert_eq!(pool.acquire(None).unwrap().identity(), ids[1]);
    }

    #[test]
    fn health_aware_falls_back_to_non_disabled() {
        let pool = pool(2, RotationPolicy::HealthAware, 1);
        let ids: Vec<String> = pool.health_all().iter().map(|h| h.url.clone()).collect();
        pool.release(&ids[0], ProxyOutcome::HardFailure("x".into()));
        pool.release(&ids[1], ProxyOutcome::HardFailure("x".into()));
        // Both Failed: still selectable as a last resort.
        assert!(pool.acquire(None).is_some());
        pool.disable(&ids[0]);
        pool.disable(&ids[1]);
        assert!(pool.acquire(None).is_none());
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let pool = pool(1, RotationPolicy::HealthAware, 3);
        let id = pool.acquire(None).unwrap().identity();
        pool.release(&id, ProxyOutcome::HardFailure("1".into()));
        pool.release(&id, ProxyOutcome::HardFailure("2".into()));
        pool.release(&id, ProxyOutcome::Success { latency: Duration::from_millis(10) });
        pool.release(&id, ProxyOutcome::HardFailure("3".into()));
        // Two more needed to reach max_failures=3 again.
        assert_ne!(pool.health(&id).unwrap().state, ProxyState::Failed);
    }

    #[test]
    fn latency_threshold_degrades_and_recovers() {
        let pool = pool(1, RotationPolicy::HealthAware, 3);
        let id = pool.acquire(None).unwrap().identity();
        pool.release(&id, ProxyOutcome::Success { latency: Duration::from_secs(30) });
        assert_eq!(pool.health(&id).unwrap().state, ProxyState::Degraded);
        pool.release(&id, ProxyOutcome::Success { latency: Duration::from_millis(80) });
        assert_eq!(pool.health(&id).unwrap().state, ProxyState::Active);
    }

    #[test]
    fn manual_disable_survives_outcomes_until_enable() {
        let pool = pool(1, RotationPolicy::HealthAware, 3);
        let id = pool.acquire(None).unwrap().identity();
        pool.disable(&id);
        pool.release(&id, ProxyOutcome::Success { latency: Duration::from_millis(5) });
        assert_eq!(pool.health(&id).unwrap().state, ProxyState::Disabled);
        pool.enable(&id);
        let health = pool.health(&id).unwrap();
        assert_eq!(health.state, ProxyState::Active);
        assert_eq!(health.failures, 0);
    }

    #[test]
    fn pinned_proxy_wins_until_failed() {
        use crate::session::{CookiePersistence, SessionMap};
        let sessions = SessionMap::new(CookiePersistence::Session, Duration::from_secs(60));
        let session = sessions.get_or_create("s");

        let pool = pool(2, RotationPolicy::HealthAware, 1);
        let ids: Vec<String> = pool.health_all().iter().map(|h| h.url.clone()).collect();
        session.pin_proxy(ids[1].clone());

        assert_eq!(pool.acquire(Some(&session)).unwrap().identity(), ids[1]);

        pool.release(&ids[1], ProxyOutcome::HardFailure("refused".into()));
        // Pin is rewritten to the new choice.
        let chosen = pool.acquire(Some(&session)).unwrap().identity();
        assert_eq!(chosen, ids[0]);
        assert_eq!(session.pinned_proxy().as_deref(), Some(ids[0].as_str()));
    }

    #[test]
    fn snapshot_counts_and_uptime() {
        let pool = pool(3, RotationPolicy::HealthAware, 1);
        let ids: Vec<String> = pool.health_all().iter().map(|h| h.url.clone()).collect();
        pool.release(&ids[0], ProxyOutcome::Success { latency: Duration::from_millis(100) });
        pool.release(&ids[1], ProxyOutcome::HardFailure("x".into()));
        let metrics = pool.snapshot();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.active, 2); // ids[0] and the untouched ids[2]
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.avg_latency_ms, 100);
    }

    #[test]
    fn add_and_remove_at_runtime() {
        let pool = pool(1, RotationPolicy::HealthAware, 3);
        pool.add(ProxyUrl::parse("socks5://10.1.0.1:1080").unwrap());
        assert_eq!(pool.snapshot().total, 2);
        // Duplicate identity is ignored.
        pool.add(ProxyUrl::parse("socks5://10.1.0.1:1080").unwrap());
        assert_eq!(pool.snapshot().total, 2);
        assert!(pool.remove("socks5://10.1.0.1:1080"));
        assert_eq!(pool.snapshot().total, 1);
    }
}
