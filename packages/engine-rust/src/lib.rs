//! Switchyard engine: pipelines, routing constructs, error handling with
//! redelivery, and lifecycle-managed routes inside a [`RoutingContext`].

pub mod completion;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod error_handler;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod route;
pub mod worker;

pub use completion::{invoke, AsyncDispatcher, Callback, CallbackProcessor, Completion};
pub use config::EngineConfig;
pub use context::RoutingContext;
pub use endpoint::{LogEndpoint, MockEndpoint};
pub use error::{ConfigError, RouteError};
pub use error_handler::{ErrorHandler, ErrorHandlerBuilder, ExceptionPolicy, RedeliveryPolicy};
pub use pool::WorkerPool;
pub use registry::{Endpoint, EndpointRegistry};
pub use route::{Consumer, Route, RouteBuilder, RouteEndpoint, RouteStatus};
