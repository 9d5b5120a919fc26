//! Per-exchange span, counter and duration histogram.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use switchyard_core::Exchange;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::RouteError;

/// Outcome label values.
pub mod outcome {
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const REJECTED: &str = "rejected";
}

/// Classifies a route result for metrics: an exchange carrying an exception
/// counts as failed even though the service call itself succeeded.
#[must_use]
pub fn classify(result: &Result<Exchange, RouteError>) -> &'static str {
    match result {
        Ok(exchange) if exchange.is_failed() => outcome::FAILED,
        Ok(_) => outcome::COMPLETED,
        Err(_) => outcome::REJECTED,
    }
}

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    route_id: Arc<str>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(route_id: impl Into<Arc<str>>) -> Self {
        Self {
            route_id: route_id.into(),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            route_id: Arc::clone(&self.route_id),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records exchange duration and outcome in a `tracing` span and in the
/// `switchyard_exchanges_total` / `switchyard_exchange_duration_seconds`
/// metrics.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    route_id: Arc<str>,
}

impl<S> Service<Exchange> for MetricsService<S>
where
    S: Service<Exchange, Response = Exchange, Error = RouteError> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = RouteError;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, RouteError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let route_id = Arc::clone(&self.route_id);
        let span = info_span!(
            "exchange",
            route = %route_id,
            exchange_id = exchange.id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(exchange);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = classify(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "switchyard_exchanges_total",
                    "route" => route_id.to_string(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "switchyard_exchange_duration_seconds",
                    "route" => route_id.to_string()
                )
                .record(elapsed.as_secs_f64());

                tracing::info!(duration_ms, outcome, "exchange complete");
                result
            }
            .instrument(span),
        )
    }
}
