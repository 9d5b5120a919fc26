//! Tower middleware around route entry.
//!
//! - [`inflight`]: semaphore-based limit on concurrent exchanges
//! - [`metrics`]: per-exchange span, counters and duration histogram
//! - [`pipeline`]: composes the layers around a [`RouteService`](crate::route::RouteService)

pub mod inflight;
pub mod metrics;
pub mod pipeline;

pub use inflight::InFlightLimitLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_route_service, RouteEntry};
