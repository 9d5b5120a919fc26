//! Composes the route entry stack.

use std::sync::Arc;

use switchyard_core::Exchange;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::inflight::InFlightLimitLayer;
use super::metrics::MetricsLayer;
use crate::error::RouteError;
use crate::route::RouteService;

/// Boxed, cloneable route entry service.
pub type RouteEntry = BoxCloneService<Exchange, Exchange, RouteError>;

/// Wraps a [`RouteService`] with the route middleware.
///
/// Layer order (outermost to innermost):
/// 1. `InFlightLimitLayer`: reject when the route is saturated, before any
///    work or metrics
/// 2. `MetricsLayer`: span, counter and duration around the actual routing
#[must_use]
pub fn build_route_service(service: RouteService, max_inflight: usize) -> RouteEntry {
    let route_id: Arc<str> = Arc::from(service.route_id());
    let stack = ServiceBuilder::new()
        .layer(InFlightLimitLayer::new(Arc::clone(&route_id), max_inflight))
        .layer(MetricsLayer::new(route_id))
        .service(service);
    BoxCloneService::new(stack)
}

#[cfg(test)]
mod tests {
    use switchyard_core::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::processor::transform::from_fn;
    use crate::route::lifecycle::{RouteLifecycle, RouteStatus};

    #[tokio::test]
    async fn routes_through_all_layers() {
        let lifecycle = Arc::new(RouteLifecycle::new("orders"));
        lifecycle.transition(RouteStatus::Starting).unwrap();
        lifecycle.transition(RouteStatus::Started).unwrap();
        let step = from_fn("upper", |ex: &mut Exchange| {
            let text = ex.body().to_text().to_uppercase();
            ex.set_body(text);
            Ok(())
        });
        let service = RouteService::new("orders", lifecycle, Arc::new(step));

        let entry = build_route_service(service, 8);
        let exchange = entry.oneshot(Exchange::with_body("abc")).await.unwrap();
        assert_eq!(exchange.body(), &Value::from("ABC"));
        assert_eq!(exchange.from_route_id(), Some("orders"));
    }
}
