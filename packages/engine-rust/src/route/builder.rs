//! Route assembly.

use std::sync::Arc;

use switchyard_core::{Processor, SharedProcessor};

use super::{Consumer, Route};
use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::error_handler::ErrorHandlerBuilder;
use crate::processor::Pipeline;
use crate::registry::EndpointRegistry;

enum Step {
    Processor(SharedProcessor),
    Endpoint(String),
}

/// Declares a route: an optional consumer, ordered steps and an optional
/// error handler around them. Endpoint uris are resolved in
/// [`build`](Self::build).
pub struct RouteBuilder {
    id: String,
    consumer: Option<Arc<dyn Consumer>>,
    steps: Vec<Step>,
    error_handler: Option<ErrorHandlerBuilder>,
    max_inflight: Option<usize>,
}

impl RouteBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            consumer: None,
            steps: Vec::new(),
            error_handler: None,
            max_inflight: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn from(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    #[must_use]
    pub fn process(mut self, processor: impl Processor + 'static) -> Self {
        self.steps.push(Step::Processor(Arc::new(processor)));
        self
    }

    #[must_use]
    pub fn process_shared(mut self, processor: SharedProcessor) -> Self {
        self.steps.push(Step::Processor(processor));
        self
    }

    /// Sends to the endpoint registered under `uri`.
    #[must_use]
    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.steps.push(Step::Endpoint(uri.into()));
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandlerBuilder) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Overrides [`EngineConfig::max_inflight_exchanges`] for this route.
    #[must_use]
    pub fn max_inflight(mut self, limit: usize) -> Self {
        self.max_inflight = Some(limit);
        self
    }

    /// # Errors
    ///
    /// - [`ConfigError::EmptyRoute`] if no steps were declared
    /// - [`ConfigError::UnknownEndpoint`] if a `to` uri is not registered
    /// - [`ConfigError::ZeroLimit`] if the in-flight limit is zero
    pub fn build(self, registry: &EndpointRegistry, config: &EngineConfig) -> Result<Route, ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::EmptyRoute { route_id: self.id });
        }
        let max_inflight = self.max_inflight.unwrap_or(config.max_inflight_exchanges);
        if max_inflight == 0 {
            return Err(ConfigError::ZeroLimit {
                what: "route in-flight limit",
            });
        }

        let steps = self
            .steps
            .into_iter()
            .map(|step| match step {
                Step::Processor(processor) => Ok(processor),
                Step::Endpoint(uri) => registry
                    .processor(&uri)
                    .ok_or(ConfigError::UnknownEndpoint { uri }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pipeline = Pipeline::new(steps);
        let root: SharedProcessor = match self.error_handler {
            Some(handler) => Arc::new(handler.wrap(pipeline)),
            None => Arc::new(pipeline),
        };

        Ok(Route::new(
            &self.id,
            root,
            self.consumer,
            max_inflight,
            config.shutdown_timeout,
        ))
    }
}
