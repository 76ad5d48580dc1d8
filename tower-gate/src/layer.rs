use std::sync::Arc;

use gate_limit::FleetShedder;
use gate_limit::TokenBucket;
use gate_limit::UtilizationShedder;
use gate_limit::UtilizationSource;
use tower::Layer;

use crate::service::AdmissionService;

/// Classifies requests for admission: which identity they count against and
/// whether they may bypass shedding.
pub trait Classify<Req>: Send + Sync {
    /// Identity the request's rate and concurrency budgets are keyed by.
    fn identity(&self, req: &Req) -> String;

    /// High-priority requests skip the fleet shedder and the worker shedder.
    fn is_high_priority(&self, _req: &Req) -> bool {
        false
    }
}

impl<Req, F> Classify<Req> for F
where
    F: Fn(&Req) -> String + Send + Sync,
{
    fn identity(&self, req: &Req) -> String {
        self(req)
    }
}

/// Applies admission control to requests.
///
/// Checks run in order: token bucket (abuse prevention), fleet shedder
/// (global backpressure), worker shedder (local last resort). Each stage is
/// optional; a layer with no stages admits everything.
pub struct AdmissionLayer<C> {
    classifier: Arc<C>,
    bucket: Option<Arc<TokenBucket>>,
    fleet: Option<Arc<FleetShedder>>,
    worker: Option<(Arc<UtilizationShedder>, Arc<dyn UtilizationSource>)>,
}

impl<C> Clone for AdmissionLayer<C> {
    fn clone(&self) -> Self {
        Self {
            classifier: Arc::clone(&self.classifier),
            bucket: self.bucket.clone(),
            fleet: self.fleet.clone(),
            worker: self.worker.clone(),
        }
    }
}

impl<C> AdmissionLayer<C> {
    /// Create a layer with no stages configured.
    pub fn new(classifier: C) -> Self {
        Self {
            classifier: Arc::new(classifier),
            bucket: None,
            fleet: None,
            worker: None,
        }
    }

    /// Rate-limit each identity with the given token bucket.
    pub fn with_rate_limit(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Bound fleet-wide in-flight requests with the given shedder.
    pub fn with_fleet_shedder(mut self, fleet: Arc<FleetShedder>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Shed low-priority traffic when `source` reports the worker running
    /// hot.
    pub fn with_worker_shedder(
        mut self,
        shedder: Arc<UtilizationShedder>,
        source: Arc<dyn UtilizationSource>,
    ) -> Self {
        self.worker = Some((shedder, source));
        self
    }
}

impl<C, S> Layer<S> for AdmissionLayer<C> {
    type Service = AdmissionService<C, S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(
            service,
            Arc::clone(&self.classifier),
            self.bucket.clone(),
            self.fleet.clone(),
            self.worker.clone(),
        )
    }
}
