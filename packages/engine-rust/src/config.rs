//! Engine-level configuration.

use std::time::Duration;

use crate::error_handler::RedeliveryPolicy;

/// Settings shared by every route in a [`RoutingContext`](crate::RoutingContext).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name used in logs.
    pub name: String,
    /// Maximum number of fan-out branches running on the worker pool at once.
    pub worker_pool_size: usize,
    /// Default limit on concurrent exchanges per route before callers are
    /// turned away with `RouteError::Overloaded`.
    pub max_inflight_exchanges: usize,
    /// How long stopping a route waits for in-flight exchanges.
    pub shutdown_timeout: Duration,
    /// Redelivery policy used by error handlers that do not set their own.
    pub redelivery: RedeliveryPolicy,
    /// How often correlation aggregators look for timed-out groups.
    pub aggregation_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".to_string(),
            worker_pool_size: 64,
            max_inflight_exchanges: 1000,
            shutdown_timeout: Duration::from_secs(30),
            redelivery: RedeliveryPolicy::default(),
            aggregation_check_interval: Duration::from_secs(1),
        }
    }
}
