use std::fmt::Debug;

/// Discrete observability records emitted by the admission components.
///
/// Each fail-open, each rejection, and each shedding-amount change produces
/// one record. Sinks forward them to whatever logging or alerting pipeline
/// the host service runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A store round trip failed and the check admitted the request anyway.
    FailOpen {
        component: &'static str,
        identity: String,
        error: String,
    },
    /// A token bucket denied a request.
    RateLimited { identity: String, remaining: f64 },
    /// A per-identity concurrency set was full.
    ConcurrencyExceeded { identity: String, in_flight: u64 },
    /// The fleet-wide concurrency set was full.
    FleetOverloaded { in_flight: u64 },
    /// The utilization controller dropped a request.
    WorkerShed { drop_chance: f64 },
    /// The shedding integrator moved.
    SheddingChanged { amount: f64 },
}

/// Destination for [`Event`] records.
pub trait EventSink: Debug + Send + Sync {
    fn record(&self, event: &Event);
}

/// Forwards events to `tracing`.
///
/// Fail-open is the only condition worth a warning. Denials are routine
/// control flow and stay at debug; integrator drift stays at trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &Event) {
        match event {
            Event::FailOpen {
                component,
                identity,
                error,
            } => {
                tracing::warn!(
                    component = *component,
                    identity = %identity,
                    error = %error,
                    "store unavailable, failing open"
                );
            }
            Event::RateLimited {
                identity,
                remaining,
            } => {
                tracing::debug!(identity = %identity, remaining = *remaining, "rate limited");
            }
            Event::ConcurrencyExceeded {
                identity,
                in_flight,
            } => {
                tracing::debug!(
                    identity = %identity,
                    in_flight = *in_flight,
                    "concurrency limit reached"
                );
            }
            Event::FleetOverloaded { in_flight } => {
                tracing::debug!(in_flight = *in_flight, "fleet overloaded");
            }
            Event::WorkerShed { drop_chance } => {
                tracing::debug!(
                    drop_chance = *drop_chance,
                    "request shed by utilization controller"
                );
            }
            Event::SheddingChanged { amount } => {
                tracing::trace!(amount = *amount, "shedding amount updated");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &Event) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::Event;
    use super::EventSink;

    /// Captures every record so tests can assert on emission counts.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        pub(crate) fn fail_open_count(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| matches!(event, Event::FailOpen { .. }))
                .count()
        }
    }

    impl EventSink for RecordingSink {
        fn record(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
