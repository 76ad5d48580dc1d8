//! # gate-limit
//!
//! `gate-limit` provides admission control primitives for fleets of stateless
//! request-handling workers: per-identity rate limiting, per-identity bounded
//! concurrency, fleet-wide load shedding, and a utilization-driven shedder of
//! last resort.
//!
//! ## Core Philosophy
//!
//! State that must be agreed on across workers lives in an external key-value
//! store and is only ever touched through single atomic scripts: one store
//! round trip per check, never a read followed by a separate write. State that
//! is deliberately local (the utilization controller) never touches the store
//! at all.
//!
//! ## Key Concepts
//!
//! * **Fail open**: a broken store admits traffic and reports the failure; it
//!   never becomes a source of denials.
//! * **Lazy evaluation**: refill and pruning happen at the moment of the
//!   request, eliminating the need for background worker threads or timers.
//! * **Injectable clocks and randomness**: every time- or chance-dependent
//!   decision can be pinned down in tests.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use gate_limit::MemoryStore;
//! use gate_limit::TokenBucket;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! let bucket = TokenBucket::new(store, 100.0, 500.0);
//!
//! if bucket.check("caller-42").await.is_admitted() {
//!     // Request allowed
//! }
//! # }
//! ```

mod clock;
mod concurrency;
mod event;
mod fleet;
mod store;
mod token_bucket;
mod utilization;

pub use clock::ManualClock;
pub use clock::SystemClock;
pub use clock::WallClock;
pub use concurrency::Acquire;
pub use concurrency::ConcurrencyLimiter;
pub use concurrency::InFlight;
pub use event::Event;
pub use event::EventSink;
pub use event::LogSink;
pub use event::NullSink;
pub use fleet::FLEET_IDENTITY;
pub use fleet::FleetCheck;
pub use fleet::FleetShedder;
pub use store::AtomicStore;
pub use store::CONCURRENCY_TTL_SECS;
pub use store::MemoryStore;
pub use store::ScriptArg;
pub use store::ScriptReply;
pub use store::StoreError;
pub use store::StoreScript;
pub use token_bucket::RateCheck;
pub use token_bucket::TokenBucket;
pub use utilization::CachedUtilization;
pub use utilization::UtilizationShedder;
pub use utilization::UtilizationSource;
