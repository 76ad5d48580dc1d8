use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::event::Event;
use crate::event::EventSink;
use crate::event::LogSink;

/// Instantaneous reading of how busy the local worker is, in `[0, 1]`.
///
/// Produced by an external collector; the shedder only ever sees the value
/// the caller hands it.
pub trait UtilizationSource: Debug + Send + Sync {
    fn current_utilization(&self) -> f64;
}

/// Caches an inner source's reading for a fixed interval (default 8
/// seconds), so per-request checks do not hammer the collector.
#[derive(Debug)]
pub struct CachedUtilization<S> {
    source: S,
    interval: Duration,
    clock: Clock,
    anchor: Instant,
    cached: Mutex<Option<(Duration, f64)>>,
}

impl<S: UtilizationSource> CachedUtilization<S> {
    pub fn new(source: S) -> Self {
        Self::with_clock(source, Duration::from_secs(8), Clock::new())
    }

    pub fn with_clock(source: S, interval: Duration, clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            source,
            interval,
            clock,
            anchor,
            cached: Mutex::new(None),
        }
    }
}

impl<S: UtilizationSource> UtilizationSource for CachedUtilization<S> {
    fn current_utilization(&self) -> f64 {
        let now = self.clock.now().duration_since(self.anchor);
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        match *cached {
            Some((sampled_at, value)) if now < sampled_at + self.interval => value,
            _ => {
                let value = self.source.current_utilization();
                *cached = Some((now, value));
                value
            }
        }
    }
}

#[derive(Debug)]
struct ControlState {
    shedding_amount: f64,
    /// Seconds since the shedder's anchor at the last integration step.
    last_changed: f64,
}

/// Process-local feedback controller that sheds traffic when the worker
/// runs hot.
///
/// One continuous variable, the shedding amount, is integrated from the
/// utilization signal: it grows while utilization sits at or above the bad
/// threshold, decays while below the good threshold, and freezes in the dead
/// zone between them. The same slow integrator drives both directions, so a
/// brief spike never causes visible shedding and recovery never stampedes.
/// The amount rests at a negative floor that must be paid back before any
/// dropping resumes, so a single bad sample cannot instantly restart drops.
///
/// Holds no shared state and never blocks; callers decide which requests to
/// subject to it (typically low-priority traffic only).
#[derive(Debug)]
pub struct UtilizationShedder {
    good: f64,
    bad: f64,
    /// Seconds of sustained full-bad utilization to reach full shedding.
    full_shed: f64,
    /// Cap on catch-up integration from a single delayed check, in seconds.
    grace: f64,
    floor: f64,
    state: Mutex<ControlState>,
    rng: Mutex<SmallRng>,
    sink: Arc<dyn EventSink>,
    clock: Clock,
    anchor: Instant,
}

impl UtilizationShedder {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Use a mocked clock for deterministic control over integration time.
    pub fn with_clock(clock: Clock) -> Self {
        let anchor = clock.now();
        let full_shed = 120.0;
        let grace = 28.0;
        Self {
            good: 0.7,
            bad: 0.8,
            full_shed,
            grace,
            floor: -(grace / full_shed),
            state: Mutex::new(ControlState {
                shedding_amount: 0.0,
                last_changed: 0.0,
            }),
            rng: Mutex::new(SmallRng::from_os_rng()),
            sink: Arc::new(LogSink),
            clock,
            anchor,
        }
    }

    /// Seconds to travel from zero to full shedding (default 120) and the
    /// per-check integration cap (default 28). The cap doubles as the
    /// hysteresis buffer: the resting floor is `-(grace / full_shed)`.
    pub fn with_ramp(mut self, full_shed: Duration, grace: Duration) -> Self {
        assert!(!full_shed.is_zero(), "full_shed must be positive");
        assert!(!grace.is_zero(), "grace must be positive");
        self.full_shed = full_shed.as_secs_f64();
        self.grace = grace.as_secs_f64();
        self.floor = -(self.grace / self.full_shed);
        self
    }

    /// Utilization below `good` recovers, at or above `bad` sheds, between
    /// them nothing changes (defaults 0.7 and 0.8).
    pub fn with_thresholds(mut self, good: f64, bad: f64) -> Self {
        assert!(
            0.0 < good && good < bad && bad < 1.0,
            "thresholds must satisfy 0 < good < bad < 1"
        );
        self.good = good;
        self.bad = bad;
        self
    }

    /// Seed the drop decision for deterministic tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(SmallRng::seed_from_u64(seed));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Current integrator value, for dashboards and tests.
    pub fn shedding_amount(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shedding_amount
    }

    /// Decide whether a request may proceed given the current utilization
    /// sample. Pure computation over process-local state; never blocks on
    /// anything external.
    pub fn check(&self, utilization: f64) -> bool {
        let drop_chance = self.integrate(utilization);
        if drop_chance <= 0.0 {
            return true;
        }

        let draw: f64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random();
        if draw < drop_chance {
            self.sink.record(&Event::WorkerShed { drop_chance });
            false
        } else {
            true
        }
    }

    /// Advance the integrator and return the resulting drop probability.
    ///
    /// The whole read-modify-write runs under the state lock; unserialized
    /// updates would double-count elapsed time.
    fn integrate(&self, utilization: f64) -> f64 {
        let raw = if utilization < self.good {
            utilization / self.good - 1.0
        } else if utilization < self.bad {
            0.0
        } else {
            (utilization - self.bad) / (1.0 - self.bad)
        };
        let derivative = raw.clamp(-1.0, 1.0) / self.full_shed;

        let now = self.clock.now().duration_since(self.anchor).as_secs_f64();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = (now - state.last_changed).clamp(0.0, self.grace);
        let next = (state.shedding_amount + elapsed * derivative).clamp(self.floor, 1.0);
        if next != state.shedding_amount {
            self.sink.record(&Event::SheddingChanged { amount: next });
        }
        state.shedding_amount = next;
        state.last_changed = now;
        next.max(0.0)
    }
}

impl Default for UtilizationShedder {
    fn default() -> Self {
        Self::new()
    }
}
