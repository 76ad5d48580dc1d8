use std::sync::Arc;
use std::time::Duration;

use crate::clock::SystemClock;
use crate::clock::WallClock;
use crate::event::Event;
use crate::event::EventSink;
use crate::event::LogSink;
use crate::store::AtomicStore;
use crate::store::ScriptArg;
use crate::store::StoreScript;

/// Outcome of a token bucket check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateCheck {
    /// Tokens covered the cost; `remaining` is the balance after consumption.
    Admitted { remaining: f64 },
    /// The bucket could not cover the requested cost.
    Denied {
        remaining: f64,
        /// When the deficit will have refilled at the configured rate.
        retry_after: Duration,
    },
    /// The store was unreachable; the request proceeds anyway.
    FailedOpen,
}

impl RateCheck {
    /// `true` unless the bucket explicitly denied the request.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, RateCheck::Denied { .. })
    }
}

/// Per-identity token bucket with state held entirely in the shared store.
///
/// Refill is computed lazily from elapsed wall-clock time inside the store
/// script, so the limiter needs no scheduled jobs and holds O(1) state per
/// active identity. Idle buckets expire out of the store on their own after
/// twice the time a full drain takes to refill.
#[derive(Debug)]
pub struct TokenBucket {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn WallClock>,
    sink: Arc<dyn EventSink>,
    rate: f64,
    capacity: f64,
    requested: f64,
    namespace: String,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate` tokens per second up to `capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `rate` or `capacity` is not strictly positive.
    pub fn new(store: Arc<dyn AtomicStore>, rate: f64, capacity: f64) -> Self {
        assert!(rate > 0.0, "rate must be positive");
        assert!(capacity > 0.0, "capacity must be positive");
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(LogSink),
            rate,
            capacity,
            requested: 1.0,
            namespace: "rate_limit".to_string(),
        }
    }

    /// Cost deducted per admitted request (default 1).
    pub fn with_cost(mut self, requested: f64) -> Self {
        assert!(requested > 0.0, "requested cost must be positive");
        self.requested = requested;
        self
    }

    /// Key namespace, so unrelated limiters sharing a store stay disjoint.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Check whether `identity` may proceed now.
    ///
    /// One atomic store round trip. A store failure is reported and the
    /// request admitted; the limiter's own dependency must never reject
    /// traffic.
    pub async fn check(&self, identity: &str) -> RateCheck {
        let now = self.clock.now();
        let prefix = format!("{}.{}", self.namespace, identity);
        let keys = [format!("{prefix}.tokens"), format!("{prefix}.timestamp")];
        let args = [
            ScriptArg::Float(self.rate),
            ScriptArg::Float(self.capacity),
            ScriptArg::Int(now as i64),
            ScriptArg::Float(self.requested),
        ];

        let reply = match self.store.execute(StoreScript::RateLimit, &keys, &args).await {
            Ok(reply) => reply,
            Err(error) => {
                self.sink.record(&Event::FailOpen {
                    component: "token_bucket",
                    identity: identity.to_string(),
                    error: error.to_string(),
                });
                return RateCheck::FailedOpen;
            }
        };

        if reply.allowed {
            RateCheck::Admitted {
                remaining: reply.secondary,
            }
        } else {
            self.sink.record(&Event::RateLimited {
                identity: identity.to_string(),
                remaining: reply.secondary,
            });
            let deficit = (self.requested - reply.secondary).max(0.0);
            RateCheck::Denied {
                remaining: reply.secondary,
                retry_after: Duration::from_secs_f64(deficit / self.rate),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::test_support::RecordingSink;
    use crate::store::MemoryStore;
    use crate::store::test_support::FailingStore;

    fn bucket(rate: f64, capacity: f64, clock: Arc<ManualClock>) -> TokenBucket {
        TokenBucket::new(Arc::new(MemoryStore::new()), rate, capacity).with_clock(clock)
    }

    #[tokio::test]
    async fn burst_is_bounded_by_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = bucket(100.0, 500.0, clock);

        // A fresh identity gets exactly `capacity` instantaneous requests.
        for n in 1..=500 {
            let check = bucket.check("caller").await;
            assert!(check.is_admitted(), "request {n} should pass");
            if n == 500 {
                assert_eq!(
                    check,
                    RateCheck::Admitted { remaining: 0.0 },
                    "the 500th request drains the bucket exactly"
                );
            }
        }

        let check = bucket.check("caller").await;
        assert!(!check.is_admitted(), "the 501st request must be denied");
    }

    #[tokio::test]
    async fn refill_is_proportional_to_elapsed_time() {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = bucket(1.0, 5.0, Arc::clone(&clock));

        for _ in 0..5 {
            assert!(bucket.check("caller").await.is_admitted());
        }
        assert!(!bucket.check("caller").await.is_admitted());

        // One second at one token per second buys exactly one more request.
        clock.advance(1);
        assert_eq!(
            bucket.check("caller").await,
            RateCheck::Admitted { remaining: 0.0 }
        );
        assert!(!bucket.check("caller").await.is_admitted());
    }

    #[tokio::test]
    async fn refill_is_capped_at_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = bucket(1.0, 5.0, Arc::clone(&clock));

        assert!(bucket.check("caller").await.is_admitted());

        clock.advance(1_000);
        assert_eq!(
            bucket.check("caller").await,
            RateCheck::Admitted { remaining: 4.0 }
        );
    }

    #[tokio::test]
    async fn denied_checks_do_not_consume() {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = bucket(1.0, 2.0, Arc::clone(&clock));

        assert!(bucket.check("caller").await.is_admitted());
        assert!(bucket.check("caller").await.is_admitted());

        // Hammering an empty bucket must not push the balance negative or
        // delay the refill.
        for _ in 0..10 {
            let check = bucket.check("caller").await;
            let RateCheck::Denied { remaining, .. } = check else {
                panic!("expected denial, got {check:?}");
            };
            assert_eq!(remaining, 0.0);
        }

        clock.advance(1);
        assert!(bucket.check("caller").await.is_admitted());
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = bucket(1.0, 1.0, clock);

        assert!(bucket.check("a").await.is_admitted());
        assert!(!bucket.check("a").await.is_admitted());
        assert!(bucket.check("b").await.is_admitted());
    }

    #[tokio::test]
    async fn denial_carries_a_retry_hint() {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = bucket(2.0, 1.0, clock);

        assert!(bucket.check("caller").await.is_admitted());
        let check = bucket.check("caller").await;
        let RateCheck::Denied { retry_after, .. } = check else {
            panic!("expected denial, got {check:?}");
        };
        // One token short at two tokens per second.
        assert_eq!(retry_after, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let sink = Arc::new(RecordingSink::default());
        let bucket =
            TokenBucket::new(Arc::new(FailingStore), 1.0, 1.0).with_sink(sink.clone());

        for n in 1..=3 {
            assert!(bucket.check("caller").await.is_admitted());
            assert_eq!(
                sink.fail_open_count(),
                n,
                "exactly one fail-open record per call"
            );
        }
    }
}
