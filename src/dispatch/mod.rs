//! The request dispatcher: end-to-end execution of one job.
//!
//! Owns retry, delay, profile selection, proxy binding, and rate-gate
//! decisions. Exactly one outcome leaves this module per job, including
//! under cancellation.

pub mod limiter;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::challenge::ChallengeRules;
use crate::engine::{HttpEngine, ProtocolSelector};
use crate::error::{Error, ProxyPenalty, Result, RetryClass};
use crate::fingerprint::{self, Profile, ProfileId};
use crate::pool::{ProxyOutcome, ProxyPool};
use crate::response::Response;
use crate::session::{CookieConfig, SessionMap};
use limiter::RateGates;

/// Job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One request job. Producers create it, the worker pool queues it, the
/// dispatcher consumes it; at most one outcome is ever published.
#[derive(Debug, Clone)]
pub struct RequestJob {
    pub id: String,
    pub url: String,
    pub method: Method,
    /// Per-request header overrides, substituted into the profile's
    /// default list in place.
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub priority: Priority,
    pub session_tag: Option<String>,
    /// Explicit profile; absent means configured default or random draw.
    pub profile: Option<ProfileId>,
    /// Overall budget for the job, measured from dispatch start.
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RequestJob {
    pub fn get(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            priority: Priority::Normal,
            session_tag: None,
            profile: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session(mut self, tag: impl Into<String>) -> Self {
        self.session_tag = Some(tag.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Estimated bytes a queued job holds (admission accounting).
    pub fn queued_size(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0) + self.url.len() + 256
    }
}

/// Final outcome of one job.
#[derive(Debug)]
pub enum JobOutcome {
    Success(Response),
    Failure {
        error: Error,
        /// Last HTTP status observed, if any attempt got that far.
        status: Option<u16>,
        /// URL in effect when the job ended.
        url: String,
        /// Proxy identity in effect, if any.
        proxy: Option<String>,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                error: Error::Canceled,
                ..
            }
        )
    }

    /// Stable kind string: "success" or the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure { error, .. } => error.kind(),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Retries after the first attempt; 0 means exactly one attempt.
    pub retry_limit: u32,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub randomize_delay: bool,
    /// Draw the profile uniformly from `profile_set` per dispatch.
    pub randomize_profile: bool,
    pub profile_set: Vec<ProfileId>,
    pub default_profile: ProfileId,
    pub protocol: ProtocolSelector,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub global_rps: Option<u32>,
    pub per_host_rps: Option<u32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            delay_min: Duration::from_millis(100),
            delay_max: Duration::from_millis(500),
            randomize_delay: true,
            randomize_profile: false,
            profile_set: ProfileId::ALL.to_vec(),
            default_profile: ProfileId::Chrome,
            protocol: ProtocolSelector::Auto,
            backoff_base: Duration::from_millis(400),
            backoff_max: Duration::from_secs(30),
            global_rps: None,
            per_host_rps: None,
        }
    }
}

impl DispatchConfig {
    /// Reject self-inconsistent configurations.
    pub fn validate(&self) -> Result<()> {
        if self.delay_min > self.delay_max {
            return Err(Error::config(format!(
                "delay_min {:?} exceeds delay_max {:?}",
                self.delay_min, self.delay_max
            )));
        }
        if self.randomize_profile && self.profile_set.is_empty() {
            return Err(Error::config("randomize_profile with an empty profile set"));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::config("backoff_base must be positive"));
        }
        Ok(())
    }
}

/// The dispatcher.
pub struct Dispatcher {
    engine: Arc<HttpEngine>,
    pool: Arc<ProxyPool>,
    sessions: Arc<SessionMap>,
    gates: RateGates,
    challenge: ChallengeRules,
    config: DispatchConfig,
    cookie_config: CookieConfig,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<HttpEngine>,
        pool: Arc<ProxyPool>,
        sessions: Arc<SessionMap>,
        challenge: ChallengeRules,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;
        let gates = RateGates::new(config.global_rps, config.per_host_rps);
        Ok(Self {
            engine,
            pool,
            sessions,
            gates,
            challenge,
            config,
            cookie_config: CookieConfig::default(),
        })
    }

    /// Configure cookie-file persistence.
    pub fn with_cookie_config(mut self, cookie_config: CookieConfig) -> Self {
        self.cookie_config = cookie_config;
        self
    }

    /// Force the cookie file to disk (shutdown path).
    pub async fn flush_cookies(&self) {
        if let Some(path) = &self.cookie_config.file {
            if let Err(err) = self.sessions.save_cookie_file(path).await {
                tracing::warn!(%err, "cookie file write failed");
            }
        }
    }

    pub fn sessions(&self) -> &Arc<SessionMap> {
        &self.sessions
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Execute one job to completion: profile, session, rate gates,
    /// delay, then up to `retry_limit + 1` attempts.
    pub async fn dispatch(&self, job: &RequestJob) -> JobOutcome {
        let started = Instant::now();
        let deadline = job.deadline.map(|d| started + d);
        let profile = self.resolve_profile(job);
        let session = self
            .sessions
            .get_or_create(job.session_tag.as_deref().unwrap_or(""));

        // Serialize dispatches on the session for the whole attempt loop.
        let lock_fut = session.lock_dispatch();
        let _guard = tokio::select! {
            _ = job.cancel.cancelled() => {
                return self.fail(job, Error::Canceled, None, None);
            }
            guard = lock_fut => guard,
        };

        let host = url::Url::parse(&job.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if let Err(err) = self
            .gates
            .acquire(&host, remaining(deadline), &job.cancel)
            .await
        {
            return self.fail(job, err, None, None);
        }

        if let Err(err) = self.inter_request_delay(deadline, &job.cancel).await {
            return self.fail(job, err, None, None);
        }

        let mut last_error: Option<Error> = None;
        let mut last_status: Option<u16> = None;
        let mut last_url = job.url.clone();
        let mut last_proxy: Option<String> = None;

        for attempt in 0..=self.config.retry_limit {
            if remaining(deadline) == Some(Duration::ZERO) {
                let error = Error::timeout("job deadline exceeded");
                return self.finalize(job, error, last_status, last_url, last_proxy);
            }

            let proxy = self.pool.acquire(Some(&session));
            let proxy_id = proxy.as_ref().map(|p| p.identity());
            // First acquisition on a tagged session pins the proxy so the
            // session sticks to one egress identity.
            if job.session_tag.is_some() && session.pinned_proxy().is_none() {
                if let Some(id) = &proxy_id {
                    session.pin_proxy(id.clone());
                }
            }
            last_proxy = proxy_id.clone();

            let attempt_started = Instant::now();
            let exchange = self.engine.execute(
                job.method.clone(),
                &job.url,
                &job.headers,
                job.body.clone(),
                &session,
                profile,
                self.config.protocol,
                proxy.as_ref(),
                &job.cancel,
            );
            let result = match remaining(deadline) {
                Some(budget) => match tokio::time::timeout(budget, exchange).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout("job deadline exceeded")),
                },
                None => exchange.await,
            };

            let error = match result {
                Ok(response) => {
                    last_status = Some(response.status);
                    last_url = response.final_url.clone();

                    if let Some(reason) = self.challenge.classify(&response) {
                        // The transport worked but the identity was
                        // flagged; the proxy takes a hard penalty.
                        if let Some(id) = &proxy_id {
                            self.pool.release(id, ProxyOutcome::HardFailure(reason.clone()));
                        }
                        Error::ChallengeDetected(reason)
                    } else if response.status == 429 || response.status >= 500 {
                        if let Some(id) = &proxy_id {
                            self.pool.release(
                                id,
                                ProxyOutcome::TransientFailure(format!("HTTP {}", response.status)),
                            );
                        }
                        Error::transport(format!("HTTP {}", response.status))
                    } else {
                        // 2xx, 3xx, and non-429 4xx are terminal successes.
                        if let Some(id) = &proxy_id {
                            self.pool.release(
                                id,
                                ProxyOutcome::Success {
                                    latency: attempt_started.elapsed(),
                                },
                            );
                        }
                        if let Err(err) = self.sessions.maybe_flush(&self.cookie_config).await {
                            tracing::debug!(%err, "cookie flush failed");
                        }
                        return JobOutcome::Success(response);
                    }
                }
                Err(error) => {
                    match error.retry_class() {
                        RetryClass::Retryable(ProxyPenalty::Hard) => {
                            if let Some(id) = &proxy_id {
                                self.pool
                                    .release(id, ProxyOutcome::HardFailure(error.to_string()));
                            }
                        }
                        RetryClass::Retryable(ProxyPenalty::Transient) => {
                            if let Some(id) = &proxy_id {
                                self.pool
                                    .release(id, ProxyOutcome::TransientFailure(error.to_string()));
                            }
                        }
                        RetryClass::Retryable(ProxyPenalty::None) => {}
                        RetryClass::Fatal => {
                            return self.finalize(job, error, last_status, last_url, last_proxy);
                        }
                    }
                    error
                }
            };

            tracing::debug!(
                job = %job.id,
                attempt,
                error = %error,
                proxy = proxy_id.as_deref().unwrap_or("direct"),
                "attempt failed"
            );
            last_error = Some(error);

            if attempt < self.config.retry_limit {
                if let Err(err) = self.backoff(attempt, deadline, &job.cancel).await {
                    return self.finalize(job, err, last_status, last_url, last_proxy);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| Error::transport("no attempt was made"));
        self.finalize(job, error, last_status, last_url, last_proxy)
    }

    fn resolve_profile(&self, job: &RequestJob) -> &'static Profile {
        let id = match job.profile {
            Some(id) => id,
            None if self.config.randomize_profile => {
                let set = &self.config.profile_set;
                set[rand::thread_rng().gen_range(0..set.len())]
            }
            None => self.config.default_profile,
        };
        fingerprint::lookup(id)
    }

    /// Uniform draw from [delay_min, delay_max]; fixed delay_min when
    /// randomization is off. Counts against the job deadline.
    async fn inter_request_delay(
        &self,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let delay = if self.config.randomize_delay && self.config.delay_max > self.config.delay_min
        {
            let span = (self.config.delay_max - self.config.delay_min).as_millis() as u64;
            self.config.delay_min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
        } else {
            self.config.delay_min
        };
        sleep_within(delay, deadline, cancel, "inter-request delay").await
    }

    /// Exponential base-2 backoff with uniform jitter in [0, backoff_base].
    async fn backoff(
        &self,
        attempt: u32,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.config.backoff_max);
        let jitter =
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.backoff_base.as_millis() as u64));
        sleep_within(exp + jitter, deadline, cancel, "retry backoff").await
    }

    fn fail(
        &self,
        job: &RequestJob,
        error: Error,
        status: Option<u16>,
        proxy: Option<String>,
    ) -> JobOutcome {
        self.finalize(job, error, status, job.url.clone(), proxy)
    }

    fn finalize(
        &self,
        job: &RequestJob,
        error: Error,
        status: Option<u16>,
        url: String,
        proxy: Option<String>,
    ) -> JobOutcome {
        tracing::debug!(job = %job.id, kind = error.kind(), "job failed");
        JobOutcome::Failure {
            error,
            status,
            url,
            proxy,
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Sleep, cut short by the deadline (`TimedOut`) or cancel (`Canceled`).
async fn sleep_within(
    duration: Duration,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    what: &str,
) -> Result<()> {
    let capped = match remaining(deadline) {
        Some(budget) if budget < duration => {
            // Sleep out the rest of the budget, then report the deadline.
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(budget) => {}
            }
            return Err(Error::elapsed(what, budget));
        }
        _ => duration,
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        _ = tokio::time::sleep(capped) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::pool::PoolConfig;
    use crate::session::CookiePersistence;

    fn dispatcher(config: DispatchConfig, proxies: Vec<&str>) -> Dispatcher {
        let pool = Arc::new(ProxyPool::new(
            proxies
                .into_iter()
                .map(|p| crate::transport::proxy::ProxyUrl::parse(p).unwrap())
                .collect(),
            PoolConfig {
                max_failures: 1,
                ..PoolConfig::default()
            },
        ));
        Dispatcher::new(
            Arc::new(HttpEngine::new(EngineConfig {
                io_timeout: Duration::from_millis(300),
                request_timeout: Duration::from_millis(500),
                ..EngineConfig::default()
            })),
            pool,
            Arc::new(SessionMap::new(CookiePersistence::Session, Duration::from_secs(60))),
            ChallengeRules::default(),
            config,
        )
        .unwrap()
    }

    fn quick_config() -> DispatchConfig {
        DispatchConfig {
            retry_limit: 0,
            delay_min: Duration::ZERO,
            delay_max: Duration::ZERO,
            randomize_delay: false,
            backoff_base: Duration::from_millis(10),
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn config_validation() {
        let mut config = DispatchConfig::default();
        config.delay_min = Duration::from_secs(2);
        config.delay_max = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.randomize_profile = true;
        config.profile_set.clear();
        assert!(config.validate().is_err());

        assert!(DispatchConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn canceled_job_yields_one_canceled_outcome() {
        let dispatcher = dispatcher(quick_config(), vec![]);
        let job = RequestJob::get("j1", "https://unreachable.invalid/");
        job.cancel.cancel();
        let outcome = dispatcher.dispatch(&job).await;
        assert!(outcome.is_canceled());
        assert_eq!(outcome.kind(), "canceled");
    }

    #[tokio::test]
    async fn retries_zero_means_one_attempt() {
        // Direct connect to a refusing port: one attempt, one failure.
        let dispatcher = dispatcher(quick_config(), vec![]);
        let job = RequestJob::get("j1", "http://127.0.0.1:1/");
        let outcome = dispatcher.dispatch(&job).await;
        match outcome {
            JobOutcome::Failure { error, proxy, .. } => {
                assert!(matches!(error, Error::TransportFailure(_)), "{error}");
                assert!(proxy.is_none());
            }
            JobOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn failed_proxy_attempts_rotate_and_penalize() {
        // Both proxies refuse TCP; with retry_limit=1 the dispatcher
        // tries one then the other, hard-failing each.
        let mut config = quick_config();
        config.retry_limit = 1;
        config.backoff_base = Duration::from_millis(5);
        let dispatcher = dispatcher(config, vec!["http://127.0.0.1:1", "http://127.0.0.2:1"]);
        let job = RequestJob::get("j1", "https://target.invalid/");
        let outcome = dispatcher.dispatch(&job).await;
        assert!(!outcome.is_success());
        let failed = dispatcher
            .pool()
            .health_all()
            .iter()
            .filter(|h| h.state == crate::pool::ProxyState::Failed)
            .count();
        assert_eq!(failed, 2);
        match outcome {
            JobOutcome::Failure { error, proxy, .. } => {
                assert!(matches!(error, Error::ProxyUnreachable(_)), "{error}");
                assert!(proxy.is_some());
            }
            JobOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn deadline_cuts_backoff_short_with_timed_out() {
        let mut config = quick_config();
        config.retry_limit = 3;
        config.backoff_base = Duration::from_millis(400);
        config.backoff_max = Duration::from_secs(2);
        let dispatcher = dispatcher(config, vec![]);
        let job = RequestJob::get("j1", "http://127.0.0.1:1/").with_deadline(Duration::from_millis(300));

        let started = Instant::now();
        let outcome = dispatcher.dispatch(&job).await;
        assert_eq!(outcome.kind(), "timed_out");
        // The backoff did not run to completion.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn tagged_session_pins_first_proxy() {
        let mut config = quick_config();
        config.retry_limit = 0;
        let dispatcher = dispatcher(config, vec!["http://127.0.0.1:1"]);
        let job = RequestJob::get("j1", "https://target.invalid/").with_session("tag");
        let _ = dispatcher.dispatch(&job).await;
        let session = dispatcher.sessions().get("tag").unwrap();
        assert_eq!(session.pinned_proxy().as_deref(), Some("http://127.0.0.1:1"));
    }
}
