use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;

use gate_limit::FleetCheck;
use gate_limit::FleetShedder;
use gate_limit::RateCheck;
use gate_limit::TokenBucket;
use gate_limit::UtilizationShedder;
use gate_limit::UtilizationSource;

use crate::error::GateError;
use crate::layer::Classify;

#[derive(Clone, Debug)]
struct AdmissionMetrics {
    denied: Counter<u64>,
}

/// Tower service running the admission pipeline ahead of its inner service.
#[derive(Debug)]
pub struct AdmissionService<C, S> {
    inner: S,
    classifier: Arc<C>,
    bucket: Option<Arc<TokenBucket>>,
    fleet: Option<Arc<FleetShedder>>,
    worker: Option<(Arc<UtilizationShedder>, Arc<dyn UtilizationSource>)>,
    instruments: AdmissionMetrics,
}

impl<C, S> AdmissionService<C, S> {
    pub(crate) fn new(
        inner: S,
        classifier: Arc<C>,
        bucket: Option<Arc<TokenBucket>>,
        fleet: Option<Arc<FleetShedder>>,
        worker: Option<(Arc<UtilizationShedder>, Arc<dyn UtilizationSource>)>,
    ) -> Self {
        let meter = global::meter("admission_service");
        let instruments = AdmissionMetrics {
            denied: meter.u64_counter("admission_denied").build(),
        };

        Self {
            inner,
            classifier,
            bucket,
            fleet,
            worker,
            instruments,
        }
    }
}

impl<C, S> Clone for AdmissionService<C, S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            classifier: Arc::clone(&self.classifier),
            bucket: self.bucket.clone(),
            fleet: self.fleet.clone(),
            worker: self.worker.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<C, S, Req> Service<Req> for AdmissionService<C, S>
where
    C: Classify<Req> + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // The checks await store round trips, so the whole pipeline runs in
        // the response future rather than in poll_ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let identity = self.classifier.identity(&req);
        let high_priority = self.classifier.is_high_priority(&req);
        let bucket = self.bucket.clone();
        let fleet = self.fleet.clone();
        let worker = self.worker.clone();
        let instruments = self.instruments.clone();

        Box::pin(async move {
            // 1. Per-identity abuse prevention.
            if let Some(bucket) = &bucket {
                if let RateCheck::Denied { retry_after, .. } = bucket.check(&identity).await {
                    instruments
                        .denied
                        .add(1, &[KeyValue::new("reason", "rate_limited")]);
                    return Err(BoxError::from(GateError::RateLimited { retry_after }));
                }
            }

            // 2. Fleet-wide backpressure. The guard releases the slot on
            //    every exit path below, including a drop of this future.
            let mut slot = None;
            if let Some(fleet) = &fleet {
                match fleet.check(high_priority).await {
                    FleetCheck::Admitted(taken) => slot = Some(taken),
                    FleetCheck::Overloaded { .. } => {
                        instruments
                            .denied
                            .add(1, &[KeyValue::new("reason", "fleet_overloaded")]);
                        return Err(BoxError::from(GateError::FleetOverloaded));
                    }
                    FleetCheck::Bypassed | FleetCheck::FailedOpen => {}
                }
            }

            // 3. Local last resort, low-priority traffic only.
            if !high_priority
                && let Some((shedder, source)) = &worker
                && !shedder.check(source.current_utilization())
            {
                if let Some(slot) = slot.take() {
                    slot.release().await;
                }
                instruments
                    .denied
                    .add(1, &[KeyValue::new("reason", "worker_overloaded")]);
                return Err(BoxError::from(GateError::WorkerOverloaded));
            }

            let result = inner.call(req).await;
            if let Some(slot) = slot.take() {
                slot.release().await;
            }
            result
        })
    }
}
