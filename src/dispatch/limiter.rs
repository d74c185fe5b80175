//! Token-bucket rate gates for the dispatcher.
//!
//! Two gates guard every dispatch: a global bucket and, when configured,
//! a per-host bucket. Waiting callers sleep; acquisition is bounded by
//! the job's deadline and cancel token.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn bucket(rps: u32) -> Arc<Bucket> {
    let quota = Quota::per_second(NonZeroU32::new(rps).unwrap_or(nonzero!(1u32)));
    Arc::new(RateLimiter::direct(quota))
}

/// Global and per-host token buckets.
pub struct RateGates {
    global: Option<Arc<Bucket>>,
    per_host_rps: Option<u32>,
    per_host: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl RateGates {
    pub fn new(global_rps: Option<u32>, per_host_rps: Option<u32>) -> Self {
        Self {
            global: global_rps.filter(|&r| r > 0).map(bucket),
            per_host_rps: per_host_rps.filter(|&r| r > 0),
            per_host: RwLock::new(HashMap::new()),
        }
    }

    /// Take one token from each configured gate, in global-then-host
    /// order. Fails `TimedOut` when the budget elapses first.
    pub async fn acquire(
        &self,
        host: &str,
        budget: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(global) = &self.global {
            wait_for_token(global, "global rate limit", budget, cancel).await?;
        }
        if let Some(rps) = self.per_host_rps {
            let limiter = {
                let mut map = self.per_host.write();
                Arc::clone(map.entry(host.to_string()).or_insert_with(|| bucket(rps)))
            };
            wait_for_token(&limiter, "per-host rate limit", budget, cancel).await?;
        }
        Ok(())
    }
}

async fn wait_for_token(
    limiter: &Bucket,
    what: &str,
    budget: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()> {
    let wait = limiter.until_ready();
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        result = async {
            match budget {
                Some(budget) => tokio::time::timeout(budget, wait)
                    .await
                    .map_err(|_| Error::elapsed(what, budget)),
                None => {
                    wait.await;
                    Ok(())
                }
            }
        } => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_gates_pass_immediately() {
        let gates = RateGates::new(None, None);
        gates
            .acquire("a.test", Some(Duration::from_millis(10)), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_bucket_times_out_within_budget() {
        let gates = RateGates::new(Some(1), None);
        let cancel = CancellationToken::new();
        // First token is free; the second must wait ~1s, far past budget.
        gates.acquire("a.test", None, &cancel).await.unwrap();
        let err = gates
            .acquire("a.test", Some(Duration::from_millis(30)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
    }

    #[tokio::test]
    async fn per_host_buckets_are_independent() {
        let gates = RateGates::new(None, Some(1));
        let cancel = CancellationToken::new();
        gates.acquire("a.test", None, &cancel).await.unwrap();
        // Different host draws from a fresh bucket.
        gates
            .acquire("b.test", Some(Duration::from_millis(30)), &cancel)
            .await
            .unwrap();
        // Same host is exhausted.
        let err = gates
            .acquire("a.test", Some(Duration::from_millis(30)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiters() {
        let gates = RateGates::new(Some(1), None);
        let cancel = CancellationToken::new();
        gates.acquire("a.test", None, &cancel).await.unwrap();
        cancel.cancel();
        let err = gates.acquire("a.test", None, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}
