use std::sync::Arc;

use crate::clock::WallClock;
use crate::concurrency::Acquire;
use crate::concurrency::ConcurrencyLimiter;
use crate::concurrency::InFlight;
use crate::event::Event;
use crate::event::EventSink;
use crate::event::LogSink;
use crate::event::NullSink;
use crate::store::AtomicStore;

/// Identity every fleet slot is accounted against. Reserved; per-identity
/// limiters sharing the same store and namespace must not use it.
pub const FLEET_IDENTITY: &str = "fleet";

/// Outcome of a fleet admission check.
#[derive(Debug)]
pub enum FleetCheck {
    /// High-priority traffic is never counted against fleet capacity.
    Bypassed,
    /// A fleet slot was taken; release it on every exit path.
    Admitted(InFlight),
    /// The fleet is at capacity.
    Overloaded { in_flight: u64 },
    /// The store was unreachable; the request proceeds without a slot.
    FailedOpen,
}

impl FleetCheck {
    /// `true` unless the fleet explicitly rejected the request.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, FleetCheck::Overloaded { .. })
    }
}

/// Fleet-wide load shedder.
///
/// A single concurrency set keyed by [`FLEET_IDENTITY`] bounds in-flight
/// requests across every worker. Denial here means the whole fleet is
/// saturated, which is a different signal from one identity exceeding its
/// own bound, and callers should map it to a different response.
#[derive(Debug)]
pub struct FleetShedder {
    limiter: ConcurrencyLimiter,
    sink: Arc<dyn EventSink>,
}

impl FleetShedder {
    /// Create a shedder admitting at most `capacity` concurrent low-priority
    /// requests fleet-wide.
    pub fn new(store: Arc<dyn AtomicStore>, capacity: u64) -> Self {
        Self {
            // The shedder owns event emission, so fleet records carry the
            // fleet kind rather than a per-identity kind.
            limiter: ConcurrencyLimiter::new(store, capacity).with_sink(Arc::new(NullSink)),
            sink: Arc::new(LogSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.limiter = self.limiter.with_clock(clock);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Check fleet capacity for one request.
    ///
    /// High-priority requests bypass the check entirely. An admitted
    /// low-priority request holds a slot until its guard is released; every
    /// exit path must release it, or fleet capacity silently shrinks until
    /// TTL pruning catches up.
    pub async fn check(&self, is_high_priority: bool) -> FleetCheck {
        if is_high_priority {
            return FleetCheck::Bypassed;
        }

        match self.limiter.acquire(FLEET_IDENTITY).await {
            Acquire::Admitted(slot) => FleetCheck::Admitted(slot),
            Acquire::Denied { in_flight } => {
                self.sink.record(&Event::FleetOverloaded { in_flight });
                FleetCheck::Overloaded { in_flight }
            }
            Acquire::FailedOpen => {
                self.sink.record(&Event::FailOpen {
                    component: "fleet_shedder",
                    identity: FLEET_IDENTITY.to_string(),
                    error: "store unavailable".to_string(),
                });
                FleetCheck::FailedOpen
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

    fn shedder(capacity: u64) -> FleetShedder {
        FleetShedder::new(Arc::new(MemoryStore::new()), capacity)
            .with_clock(Arc::new(ManualClock::new(100)))
    }

    #[tokio::test]
    async fn sheds_low_priority_at_capacity() {
        let sink = Arc::new(RecordingSink::default());
        let shedder = shedder(2).with_sink(sink.clone());

        let _a = shedder.check(false).await;
        let _b = shedder.check(false).await;

        let third = shedder.check(false).await;
        assert!(matches!(third, FleetCheck::Overloaded { in_flight: 2 }));
        assert_eq!(
            sink.events.lock().unwrap().as_slice(),
            &[Event::FleetOverloaded { in_flight: 2 }]
        );
    }

    #[tokio::test]
    async fn high_priority_bypasses_and_holds_no_slot() {
        let shedder = shedder(1);

        for _ in 0..100 {
            assert!(matches!(shedder.check(true).await, FleetCheck::Bypassed));
        }

        // Bypassed traffic left the only slot free.
        assert!(matches!(
            shedder.check(false).await,
            FleetCheck::Admitted(_)
        ));
    }

    #[tokio::test]
    async fn high_priority_is_admitted_even_when_saturated() {
        let shedder = shedder(1);

        let _held = shedder.check(false).await;
        assert!(!shedder.check(false).await.is_admitted());
        assert!(shedder.check(true).await.is_admitted());
    }

    #[tokio::test]
    async fn released_slot_is_reusable() {
        let shedder = shedder(1);

        let slot = match shedder.check(false).await {
            FleetCheck::Admitted(slot) => slot,
            other => panic!("expected admission, got {other:?}"),
        };
        slot.release().await;

        assert!(matches!(
            shedder.check(false).await,
            FleetCheck::Admitted(_)
        ));
    }

    #[tokio::test]
    async fn store_failure_fails_open_with_fleet_scope() {
        let sink = Arc::new(RecordingSink::default());
        let shedder =
            FleetShedder::new(Arc::new(FailingStore), 1).with_sink(sink.clone());

        assert!(matches!(shedder.check(false).await, FleetCheck::FailedOpen));
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1, "exactly one record per failed call");
        assert!(matches!(
            &events[0],
            Event::FailOpen { component: "fleet_shedder", .. }
        ));
    }
}
