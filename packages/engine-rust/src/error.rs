//! Engine error types.
//!
//! [`ConfigError`] is returned while routes are being assembled and prevents
//! them from starting. [`RouteError`] is what callers of a running route see.
//! Failures inside a route are never errors here: they travel on the exchange.

use switchyard_core::ExchangeError;

use crate::route::RouteStatus;

/// Invalid route wiring, detected at build time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a try block may declare only one finally clause")]
    DuplicateFinally,
    #[error("a try block needs at least one catch or a finally clause")]
    EmptyTry,
    #[error("a choice needs at least one when clause")]
    EmptyChoice,
    #[error("route {route_id} has no steps")]
    EmptyRoute { route_id: String },
    #[error("route {route_id} is already registered")]
    DuplicateRoute { route_id: String },
    #[error("no endpoint registered for uri {uri}")]
    UnknownEndpoint { uri: String },
    #[error("endpoint {uri} is already registered")]
    DuplicateEndpoint { uri: String },
    #[error("invalid redelivery delay pattern {pattern:?}: {reason}")]
    InvalidDelayPattern { pattern: String, reason: String },
    #[error("an aggregator needs at least one completion condition")]
    MissingCompletion,
    #[error("an aggregator takes a completion timeout or a completion interval, not both")]
    ConflictingCompletion,
    #[error("{what} must be greater than zero")]
    ZeroLimit { what: &'static str },
    #[error("no tokio runtime is available to run the worker pool")]
    NoRuntime,
}

/// Errors returned to callers of a route.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route {route_id} is {status} and not accepting exchanges")]
    NotAccepting { route_id: String, status: RouteStatus },
    #[error("route {route_id} is overloaded, try again later")]
    Overloaded { route_id: String },
    #[error("route {route_id} cannot move from {from} to {to}")]
    InvalidTransition {
        route_id: String,
        from: RouteStatus,
        to: RouteStatus,
    },
    #[error("no route with id {route_id}")]
    UnknownRoute { route_id: String },
    #[error("consumer of route {route_id} failed")]
    Consumer {
        route_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("endpoint {uri} failed to {action}")]
    Endpoint {
        uri: String,
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("exchange failed: {0}")]
    Failed(#[from] ExchangeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
