//! Bounded concurrent dispatch with priority ordering.
//!
//! Workers are homogeneous tokio tasks: dequeue one job, take a rate
//! token and an in-flight permit, run the dispatcher, publish the
//! outcome to the job's sink. The pool never retries; that is the
//! dispatcher's decision alone.

pub mod memory;
pub mod queue;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Dispatcher, JobOutcome, RequestJob};
use crate::error::{Error, Result};
use memory::{MemoryGauge, Reservation};
use queue::PriorityQueue;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Hard ceiling on concurrently dispatching jobs.
    pub max_in_flight: usize,
    /// Pool-level token bucket, independent of the dispatcher's gates.
    pub requests_per_second: Option<u32>,
    /// Soft memory ceiling in bytes; 0 disables it.
    pub memory_soft_limit: usize,
    pub memory_hysteresis: usize,
    pub memory_check_interval: Duration,
    /// Rolling window for the throughput figure in `stats`.
    pub stats_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1000,
            max_in_flight: 64,
            requests_per_second: None,
            memory_soft_limit: 512 * 1024 * 1024,
            memory_hysteresis: 64 * 1024 * 1024,
            memory_check_interval: Duration::from_secs(5),
            stats_window: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("worker count must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue capacity must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(Error::config("max_in_flight must be positive"));
        }
        Ok(())
    }
}

struct QueuedJob {
    job: RequestJob,
    sink: oneshot::Sender<JobOutcome>,
    /// Held until the outcome is published.
    _reservation: Reservation,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    in_flight: AtomicUsize,
    latency_total_ms: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    /// Queue depth per priority: [high, normal, low].
    pub queue_depth: [usize; 3],
    pub in_flight: usize,
    pub mean_latency_ms: u64,
    /// Completions per second over the rolling window.
    pub throughput_rps: f64,
}

/// The worker pool.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    queue: Arc<PriorityQueue<QueuedJob>>,
    gauge: Arc<MemoryGauge>,
    rate: Option<crate::dispatch::limiter::RateGates>,
    in_flight_permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    completions: Arc<Mutex<VecDeque<Instant>>>,
    accepting: AtomicBool,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Build the pool and start its workers and memory supervisor.
    pub fn start(dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let gauge = Arc::new(MemoryGauge::new(
            config.memory_soft_limit,
            config.memory_hysteresis,
        ));
        let pool = Arc::new(Self {
            dispatcher,
            queue: Arc::new(PriorityQueue::new(config.queue_capacity)),
            gauge: Arc::clone(&gauge),
            rate: config
                .requests_per_second
                .map(|rps| crate::dispatch::limiter::RateGates::new(Some(rps), None)),
            in_flight_permits: Arc::new(Semaphore::new(config.max_in_flight)),
            counters: Arc::new(Counters::default()),
            completions: Arc::new(Mutex::new(VecDeque::new())),
            accepting: AtomicBool::new(true),
            shutdown_token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            config,
        });

        let mut handles = Vec::with_capacity(pool.config.workers);
        for worker_id in 0..pool.config.workers {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.worker_loop(worker_id).await }));
        }
        handles.push(
            gauge.spawn_supervisor(pool.config.memory_check_interval, pool.shutdown_token.clone()),
        );
        *pool.workers.lock() = handles;
        Ok(pool)
    }

    /// Submit a job. On acceptance, the returned receiver yields exactly
    /// one outcome. Fails `QueueFull` at capacity and `MemoryPressure`
    /// while admission is paused; a rejected job produces no result.
    pub fn submit(&self, job: RequestJob) -> Result<oneshot::Receiver<JobOutcome>> {
        if !self.accepting.load(Ordering::Acquire) || self.queue.is_closed() {
            return Err(Error::config("worker pool is shut down"));
        }
        if !self.gauge.admitting() {
            return Err(Error::MemoryPressure);
        }

        let (sink, receiver) = oneshot::channel();
        let reservation = self.gauge.reserve(job.queued_size());
        let priority = job.priority;
        let queued = QueuedJob {
            job,
            sink,
            _reservation: reservation,
        };
        self.queue
            .push(priority, queued)
            .map_err(|_| Error::QueueFull)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(receiver)
    }

    /// Stop accepting, drain queued and in-flight jobs, halt workers.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.queue.close();
        // The token stops the supervisor; workers drain off the closed queue.
        self.shutdown_token.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.dispatcher.flush_cookies().await;
    }

    /// Current statistics snapshot. Counters are read independently, so
    /// totals across fields need not be mutually consistent.
    pub fn stats(&self) -> StatsSnapshot {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let latency_total = self.counters.latency_total_ms.load(Ordering::Relaxed);
        let window = self.config.stats_window;
        let throughput = {
            let mut completions = self.completions.lock();
            let cutoff = Instant::now().checked_sub(window);
            if let Some(cutoff) = cutoff {
                while completions.front().is_some_and(|&t| t < cutoff) {
                    completions.pop_front();
                }
            }
            completions.len() as f64 / window.as_secs_f64()
        };
        StatsSnapshot {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.counters.failed.load(Ordering::Relaxed),
            canceled: self.counters.canceled.load(Ordering::Relaxed),
            queue_depth: self.queue.len_by_priority(),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            mean_latency_ms: if completed > 0 { latency_total / completed } else { 0 },
            throughput_rps: throughput,
        }
    }

    pub fn memory_used(&self) -> usize {
        self.gauge.used()
    }

    async fn worker_loop(&self, worker_id: usize) {
        while let Some(queued) = self.queue.pop().await {
            let QueuedJob {
                job,
                sink,
                _reservation,
            } = queued;

            // One token per dispatch from the pool-level bucket.
            if let Some(rate) = &self.rate {
                if let Err(err) = rate.acquire("", None, &job.cancel).await {
                    let outcome = JobOutcome::Failure {
                        error: err,
                        status: None,
                        url: job.url.clone(),
                        proxy: None,
                    };
                    self.record_outcome(&outcome, Duration::ZERO);
                    let _ = sink.send(outcome);
                    continue;
                }
            }

            let permit = self
                .in_flight_permits
                .acquire()
                .await
                .expect("in-flight semaphore closed");
            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

            let started = Instant::now();
            let outcome = self.dispatcher.dispatch(&job).await;
            let elapsed = started.elapsed();

            self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);

            tracing::debug!(worker = worker_id, job = %job.id, kind = outcome.kind(), "job finished");
            self.record_outcome(&outcome, elapsed);
            // A dropped receiver is the producer's choice; the result was
            // still published exactly once.
            let _ = sink.send(outcome);
        }
    }

    fn record_outcome(&self, outcome: &JobOutcome, elapsed: Duration) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if outcome.is_canceled() {
            self.counters.canceled.fetch_add(1, Ordering::Relaxed);
        } else if !outcome.is_success() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut completions = self.completions.lock();
        completions.push_back(Instant::now());
        if completions.len() > 10_000 {
            completions.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeRules;
    use crate::dispatch::{DispatchConfig, Priority};
    use crate::engine::{EngineConfig, HttpEngine};
    use crate::pool::{PoolConfig, ProxyPool};
    use crate::session::{CookiePersistence, SessionMap};

    fn test_dispatcher() -> Arc<Dispatcher> {
        Arc::new(
            Dispatcher::new(
                Arc::new(HttpEngine::new(EngineConfig {
                    io_timeout: Duration::from_millis(200),
                    request_timeout: Duration::from_millis(400),
                    ..EngineConfig::default()
                })),
                Arc::new(ProxyPool::new(vec![], PoolConfig::default())),
                Arc::new(SessionMap::new(
                    CookiePersistence::Session,
                    Duration::from_secs(60),
                )),
                ChallengeRules::default(),
                DispatchConfig {
                    retry_limit: 0,
                    delay_min: Duration::ZERO,
                    delay_max: Duration::ZERO,
                    randomize_delay: false,
                    ..DispatchConfig::default()
                },
            )
            .unwrap(),
        )
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            workers: 2,
            queue_capacity: 8,
            max_in_flight: 2,
            requests_per_second: None,
            memory_soft_limit: 0,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn every_accepted_job_yields_exactly_one_result() {
        let pool = WorkerPool::start(test_dispatcher(), config()).unwrap();
        let mut receivers = Vec::new();
        for i in 0..4 {
            let job = RequestJob::get(format!("j{i}"), "http://127.0.0.1:1/");
            receivers.push(pool.submit(job).unwrap());
        }
        for receiver in receivers {
            let outcome = receiver.await.expect("sink dropped without a result");
            assert!(!outcome.is_success());
        }
        let stats = pool.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn canceled_job_publishes_canceled_result() {
        let pool = WorkerPool::start(test_dispatcher(), config()).unwrap();
        let job = RequestJob::get("j1", "http://127.0.0.1:1/");
        job.cancel.cancel();
        let receiver = pool.submit(job).unwrap();
        let outcome = receiver.await.unwrap();
        assert!(outcome.is_canceled());
        assert_eq!(pool.stats().canceled, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queue_full_rejects_without_result() {
        let mut cfg = config();
        cfg.workers = 1;
        cfg.queue_capacity = 1;
        let pool = WorkerPool::start(test_dispatcher(), cfg).unwrap();
        // Saturate: one job likely dequeued, then fill the single slot.
        let _r1 = pool.submit(RequestJob::get("j1", "http://127.0.0.1:1/")).unwrap();
        let mut rejected = false;
        for i in 2..10 {
            match pool.submit(RequestJob::get(format!("j{i}"), "http://127.0.0.1:1/")) {
                Ok(_) => {}
                Err(Error::QueueFull) => {
                    rejected = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(rejected, "queue never reported full");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::start(test_dispatcher(), config()).unwrap();
        pool.shutdown().await;
        assert!(pool.submit(RequestJob::get("j1", "http://127.0.0.1:1/")).is_err());
    }

    #[tokio::test]
    async fn memory_pressure_rejects_submissions() {
        let mut cfg = config();
        cfg.memory_soft_limit = 1024;
        cfg.memory_hysteresis = 128;
        let pool = WorkerPool::start(test_dispatcher(), cfg).unwrap();

        // Force the gauge over the limit and sample it, as the
        // supervisor would on its next tick.
        let hold = pool.gauge.reserve(4096);
        pool.gauge.sample();
        let err = pool
            .submit(RequestJob::get("j1", "http://127.0.0.1:1/"))
            .unwrap_err();
        assert!(matches!(err, Error::MemoryPressure));

        drop(hold);
        pool.gauge.sample();
        assert!(pool.submit(RequestJob::get("j2", "http://127.0.0.1:1/")).is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn high_priority_jobs_run_first() {
        // Single worker, so queue order is observable through completion
        // order of the receivers.
        let mut cfg = config();
        cfg.workers = 1;
        let pool = WorkerPool::start(test_dispatcher(), cfg).unwrap();

        // Stall the worker with one job so the rest queue up behind it.
        let _stall = pool.submit(RequestJob::get("stall", "http://127.0.0.1:1/")).unwrap();
        let low = pool
            .submit(RequestJob::get("low", "http://127.0.0.1:1/").with_priority(Priority::Low))
            .unwrap();
        let high = pool
            .submit(RequestJob::get("high", "http://127.0.0.1:1/").with_priority(Priority::High))
            .unwrap();

        let _ = high.await.unwrap();
        // By the time high completes, low may still be queued; what
        // matters is that high never waited behind it.
        let depth = pool.stats().queue_depth;
        assert_eq!(depth[0], 0, "high-priority queue should be drained first");
        let _ = low.await.unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_ceiling() {
        let mut cfg = config();
        cfg.workers = 4;
        cfg.max_in_flight = 2;
        let pool = WorkerPool::start(test_dispatcher(), cfg).unwrap();
        let receivers: Vec<_> = (0..8)
            .map(|i| pool.submit(RequestJob::get(format!("j{i}"), "http://127.0.0.1:1/")).unwrap())
            .collect();
        for _ in 0..20 {
            assert!(pool.stats().in_flight <= 2);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for receiver in receivers {
            let _ = receiver.await;
        }
        pool.shutdown().await;
    }
}
