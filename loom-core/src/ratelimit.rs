//! Token-bucket admission control, per (endpoint class, caller identity).
//!
//! Caller identity is the authenticated node id when available, else the
//! source IP. Buckets live in a DashMap and are pruned when idle.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::FabricError;

const BUCKET_IDLE_PRUNE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Rpc,
    Health,
    /// Cluster-internal paths (gossip, provisioning): unlimited.
    Internal,
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Bucket {
    limiter: DirectLimiter,
    last_access: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassLimits {
    pub per_min: u32,
    pub burst: u32,
}

pub struct RateGuard {
    enabled: bool,
    rpc: ClassLimits,
    health: ClassLimits,
    buckets: DashMap<(EndpointClass, String), Bucket>,
    clock: DefaultClock,
}

impl RateGuard {
    pub fn new(enabled: bool, rpc: ClassLimits, health: ClassLimits) -> Self {
        Self {
            enabled,
            rpc,
            health,
            buckets: DashMap::new(),
            clock: DefaultClock::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rate_limit_enabled,
            ClassLimits {
                per_min: config.rate_limit_rpc_per_min,
                burst: config.rate_limit_rpc_burst,
            },
            ClassLimits {
                per_min: config.rate_limit_health_per_min,
                burst: config.rate_limit_health_burst,
            },
        )
    }

    fn quota(limits: ClassLimits) -> Quota {
        let per_min = NonZeroU32::new(limits.per_min).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(limits.burst).unwrap_or(NonZeroU32::MIN);
        Quota::per_minute(per_min).allow_burst(burst)
    }

    /// Admit or reject one request. Rejections carry the seconds until a
    /// token becomes available, surfaced as a Retry-After hint.
    pub fn check(&self, class: EndpointClass, caller: &str) -> Result<(), FabricError> {
        if !self.enabled || class == EndpointClass::Internal {
            return Ok(());
        }

        let limits = match class {
            EndpointClass::Rpc => self.rpc,
            EndpointClass::Health => self.health,
            EndpointClass::Internal => unreachable!(),
        };

        let key = (class, caller.to_string());
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            limiter: RateLimiter::direct(Self::quota(limits)),
            last_access: Instant::now(),
        });
        bucket.last_access = Instant::now();

        match bucket.limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                let retry_after_secs = wait.as_secs().max(1);
                warn!(
                    "Rate limit exceeded for {caller} ({class:?}), retry after {retry_after_secs}s"
                );
                Err(FabricError::RateLimited { retry_after_secs })
            }
        }
    }

    /// Drop buckets idle for longer than an hour.
    pub fn prune(&self) {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_access.elapsed() < BUCKET_IDLE_PRUNE);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!("Pruned {removed} idle rate-limit buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(per_min: u32, burst: u32) -> RateGuard {
        RateGuard::new(
            true,
            ClassLimits { per_min, burst },
            ClassLimits {
                per_min: 300,
                burst: 50,
            },
        )
    }

    #[test]
    fn burst_is_admitted_then_rejected_with_retry_hint() {
        let guard = guard(5, 2);
        assert!(guard.check(EndpointClass::Rpc, "10.0.0.9").is_ok());
        assert!(guard.check(EndpointClass::Rpc, "10.0.0.9").is_ok());

        let err = guard.check(EndpointClass::Rpc, "10.0.0.9").unwrap_err();
        match err {
            FabricError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn callers_get_independent_buckets() {
        let guard = guard(5, 1);
        assert!(guard.check(EndpointClass::Rpc, "w1").is_ok());
        assert!(guard.check(EndpointClass::Rpc, "w2").is_ok());
        assert!(guard.check(EndpointClass::Rpc, "w1").is_err());
    }

    #[test]
    fn classes_get_independent_buckets() {
        let guard = guard(5, 1);
        assert!(guard.check(EndpointClass::Rpc, "w1").is_ok());
        assert!(guard.check(EndpointClass::Rpc, "w1").is_err());
        // Health has its own, larger bucket.
        assert!(guard.check(EndpointClass::Health, "w1").is_ok());
    }

    #[test]
    fn internal_class_is_unlimited() {
        let guard = guard(1, 1);
        for _ in 0..100 {
            assert!(guard.check(EndpointClass::Internal, "w1").is_ok());
        }
    }

    #[test]
    fn disabled_guard_admits_everything() {
        let guard = RateGuard::new(
            false,
            ClassLimits { per_min: 1, burst: 1 },
            ClassLimits { per_min: 1, burst: 1 },
        );
        for _ in 0..10 {
            assert!(guard.check(EndpointClass::Rpc, "w1").is_ok());
        }
    }

    #[test]
    fn exactly_101_requests_against_100_per_min_rejects_at_least_one() {
        let guard = guard(100, 20);
        let mut rejected = 0;
        for _ in 0..101 {
            if guard.check(EndpointClass::Rpc, "client").is_err() {
                rejected += 1;
            }
        }
        assert!(rejected >= 1);
    }
}
