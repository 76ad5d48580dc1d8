//! # Tower Gate
//!
//! `tower-gate` runs the [`gate_limit`] admission pipeline as a
//! [Tower](https://github.com/tower-rs/tower) middleware.
//!
//! ## The Admission Pipeline
//!
//! Each request passes up to three checks before reaching the inner service:
//!
//! 1. **Token bucket**: per-identity abuse prevention. Denial maps to
//!    [`GateError::RateLimited`].
//! 2. **Fleet shedder**: global backpressure over a shared store. Denial
//!    maps to [`GateError::FleetOverloaded`]; high-priority requests bypass
//!    this stage and never occupy a slot.
//! 3. **Worker shedder**: a local, utilization-driven last resort applied
//!    to low-priority traffic. Denial maps to [`GateError::WorkerOverloaded`].
//!
//! Every stage is optional. A fleet slot taken in stage 2 is released on all
//! exit paths, including denial by stage 3, inner-service errors, and the
//! response future being dropped.
//!
//! Store failures never surface here: the limiters fail open and report,
//! so a broken store degrades to "no limiting" rather than an outage.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GateError`], allowing automatic
//!   conversion to HTTP status codes (429, 503).

mod error;
mod layer;
mod service;


pub use error::GateError;
pub use layer::AdmissionLayer;
pub use layer::Classify;
pub use service::AdmissionService;
