/// Errors produced by the admission middleware.
///
/// Each variant is a deliberate control signal, not a defect: operators need
/// to tell abuse prevention apart from fleet backpressure and from local
/// shedding in their dashboards, so every denial kind keeps its own variant
/// and status code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The caller's identity exhausted its token bucket.
    ///
    /// The duration indicates when the deficit will have refilled.
    /// When the `axum` feature is enabled, this converts to
    /// `429 Too Many Requests` with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: std::time::Duration,
    },

    /// The fleet-wide concurrency bound is saturated.
    ///
    /// When the `axum` feature is enabled, this converts to
    /// `503 Service Unavailable`.
    #[error("Fleet is at capacity; request rejected")]
    FleetOverloaded,

    /// The local worker is shedding low-priority traffic.
    ///
    /// When the `axum` feature is enabled, this converts to
    /// `503 Service Unavailable`.
    #[error("Worker overloaded; request shed")]
    WorkerOverloaded,
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, headers) = match self {
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let val = axum::http::HeaderValue::from(secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    self.to_string(),
                    Some((axum::http::header::RETRY_AFTER, val)),
                )
            }
            Self::FleetOverloaded | Self::WorkerOverloaded => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string(), None)
            }
        };

        let mut response = (status, msg).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
