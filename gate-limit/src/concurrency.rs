use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::clock::SystemClock;
use crate::clock::WallClock;
use crate::event::Event;
use crate::event::EventSink;
use crate::event::LogSink;
use crate::store::AtomicStore;
use crate::store::ScriptArg;
use crate::store::ScriptReply;
use crate::store::StoreError;
use crate::store::StoreScript;

/// Outcome of a concurrency acquisition.
#[derive(Debug)]
pub enum Acquire {
    /// A slot was taken; release the guard when the request finishes.
    Admitted(InFlight),
    /// The identity already has `in_flight` requests running.
    Denied { in_flight: u64 },
    /// The store was unreachable; the request proceeds without a slot.
    FailedOpen,
}

impl Acquire {
    /// `true` unless the limiter explicitly denied the request.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Acquire::Denied { .. })
    }
}

/// Marker for one in-flight request.
///
/// Call [`InFlight::release`] when the request completes, on every exit
/// path. If the guard is dropped unreleased (panic, cancelled future) the
/// removal is spawned on the current Tokio runtime instead; a worker that
/// dies outright leaves the member to TTL pruning.
#[derive(Debug)]
pub struct InFlight {
    store: Arc<dyn AtomicStore>,
    key: String,
    id: Option<String>,
}

impl InFlight {
    /// The member id recorded in the store.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Remove this request's member from the identity's set.
    ///
    /// Removing a member that pruning already reclaimed is a no-op, not an
    /// error.
    pub async fn release(mut self) {
        if let Some(id) = self.id.take() {
            let _ = Self::remove(&self.store, &self.key, id).await;
        }
    }

    async fn remove(
        store: &Arc<dyn AtomicStore>,
        key: &str,
        id: String,
    ) -> Result<ScriptReply, StoreError> {
        store
            .execute(
                StoreScript::ConcurrencyRelease,
                &[key.to_string()],
                &[ScriptArg::Str(id)],
            )
            .await
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            let _ = InFlight::remove(&store, &key, id).await;
        });
    }
}

/// Per-identity bound on simultaneously in-flight requests.
///
/// Membership lives in the store as a time-stamped set. Prune, count and
/// insert run as one atomic script, so two concurrent callers can never both
/// observe the same free slot.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn WallClock>,
    sink: Arc<dyn EventSink>,
    capacity: u64,
    namespace: String,
    rng: Mutex<SmallRng>,
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting at most `capacity` concurrent requests per
    /// identity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(store: Arc<dyn AtomicStore>, capacity: u64) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(LogSink),
            capacity,
            namespace: "concurrency".to_string(),
            rng: Mutex::new(SmallRng::from_os_rng()),
        }
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

    /// Seed the member-id generator for deterministic tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(SmallRng::seed_from_u64(seed));
        self
    }

    /// Try to take a slot for `identity`.
    ///
    /// One atomic store round trip. A store failure is reported and the
    /// request admitted without a slot.
    pub async fn acquire(&self, identity: &str) -> Acquire {
        let now = self.clock.now();
        let key = format!("{}.{}", self.namespace, identity);
        let id = self.fresh_id();
        let keys = [key.clone()];
        let args = [
            ScriptArg::Int(self.capacity as i64),
            ScriptArg::Int(now as i64),
            ScriptArg::Str(id.clone()),
        ];

        let reply = match self
            .store
            .execute(StoreScript::ConcurrencyAcquire, &keys, &args)
            .await
        {
            Ok(reply) => reply,
            Err(error) => {
                self.sink.record(&Event::FailOpen {
                    component: "concurrency_limiter",
                    identity: identity.to_string(),
                    error: error.to_string(),
                });
                return Acquire::FailedOpen;
            }
        };

        if reply.allowed {
            Acquire::Admitted(InFlight {
                store: Arc::clone(&self.store),
                key,
                id: Some(id),
            })
        } else {
            let in_flight = reply.secondary as u64;
            self.sink.record(&Event::ConcurrencyExceeded {
                identity: identity.to_string(),
                in_flight,
            });
            Acquire::Denied { in_flight }
        }
    }

    /// 128 random bits, so same-millisecond collisions stay negligible
    /// across a whole fleet.
    fn fresh_id(&self) -> String {
        let bits: u128 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random();
        format!("{bits:032x}")
    }
}
