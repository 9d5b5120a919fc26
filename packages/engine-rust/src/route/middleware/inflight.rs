//! In-flight limit for route entry.
//!
//! Rejects exchanges with `RouteError::Overloaded` when the route already has
//! its maximum number of exchanges in progress. Exchanges are never queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::Exchange;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::error::RouteError;

// ---------------------------------------------------------------------------
// InFlightLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer limiting concurrent exchanges via a semaphore.
#[derive(Debug, Clone)]
pub struct InFlightLimitLayer {
    route_id: Arc<str>,
    semaphore: Arc<Semaphore>,
}

impl InFlightLimitLayer {
    #[must_use]
    pub fn new(route_id: impl Into<Arc<str>>, max_inflight: usize) -> Self {
        Self {
            route_id: route_id.into(),
            semaphore: Arc::new(Semaphore::new(max_inflight)),
        }
    }
}

impl<S> Layer<S> for InFlightLimitLayer {
    type Service = InFlightLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InFlightLimitService {
            inner,
            route_id: Arc::clone(&self.route_id),
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// InFlightLimitService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InFlightLimitService<S> {
    inner: S,
    route_id: Arc<str>,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Exchange> for InFlightLimitService<S>
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
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            let route_id = self.route_id.to_string();
            return Box::pin(async move { Err(RouteError::Overloaded { route_id }) });
        };

        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}
