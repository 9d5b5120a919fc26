//! The routing context: owner of configuration, endpoints, the worker pool
//! and every route.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use switchyard_core::{Exchange, Value};
use tracing::{info, warn};

use crate::completion::AsyncDispatcher;
use crate::config::EngineConfig;
use crate::error::{ConfigError, RouteError};
use crate::pool::WorkerPool;
use crate::processor::{AggregationSweeper, Aggregator};
use crate::registry::{Endpoint, EndpointRegistry, SharedEndpoint};
use crate::route::{Route, RouteBuilder, RouteStatus};
use crate::worker::BackgroundWorker;

/// Startup order: endpoints, aggregation sweepers, then routes in the order
/// they were added. Shutdown runs the same sequence in reverse.
pub struct RoutingContext {
    config: EngineConfig,
    registry: Arc<EndpointRegistry>,
    pool: WorkerPool,
    dispatcher: AsyncDispatcher,
    routes: DashMap<String, Arc<Route>>,
    route_order: RwLock<Vec<String>>,
    aggregators: Mutex<Vec<Arc<Aggregator>>>,
    sweepers: Mutex<Vec<BackgroundWorker<AggregationSweeper>>>,
}

impl RoutingContext {
    /// Creates a context whose worker pool runs on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoRuntime`] outside a tokio runtime, or
    /// [`ConfigError::ZeroLimit`] for a zero worker pool size.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let pool = WorkerPool::current(config.worker_pool_size)?;
        let dispatcher = AsyncDispatcher::new(pool.clone());
        Ok(Self {
            config,
            registry: Arc::new(EndpointRegistry::new()),
            pool,
            dispatcher,
            routes: DashMap::new(),
            route_order: RwLock::new(Vec::new()),
            aggregators: Mutex::new(Vec::new()),
            sweepers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Pool for parallel fan-out in routes built against this context.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub fn dispatcher(&self) -> &AsyncDispatcher {
        &self.dispatcher
    }

    // -- Registration ------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateEndpoint`] if the uri is taken.
    pub fn register_endpoint<T: Endpoint>(&self, endpoint: T) -> Result<Arc<T>, ConfigError> {
        self.registry.register(endpoint)
    }

    pub fn endpoint(&self, uri: &str) -> Option<SharedEndpoint> {
        self.registry.get_by_uri(uri)
    }

    /// Builds `builder` against the registered endpoints and adds the route.
    /// It stays stopped until [`start`](Self::start) or
    /// [`start_route`](Self::start_route).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateRoute`] if the id is taken, or any
    /// error from [`RouteBuilder::build`].
    pub fn add_route(&self, builder: RouteBuilder) -> Result<Arc<Route>, ConfigError> {
        if self.routes.contains_key(builder.id()) {
            return Err(ConfigError::DuplicateRoute {
                route_id: builder.id().to_string(),
            });
        }
        let route = Arc::new(builder.build(&self.registry, &self.config)?);
        let route_id = route.id().to_string();
        match self.routes.entry(route_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ConfigError::DuplicateRoute { route_id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&route));
            }
        }
        self.route_order.write().push(route_id);
        Ok(route)
    }

    /// Registers an aggregator whose timeouts are swept while the context is
    /// started. The returned handle is the processor to place in a route.
    pub fn add_aggregator(&self, aggregator: Aggregator) -> Arc<Aggregator> {
        let aggregator = Arc::new(aggregator);
        self.aggregators.lock().push(Arc::clone(&aggregator));
        aggregator
    }

    // -- Queries -----------------------------------------------------------

    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.get(route_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn route_status(&self, route_id: &str) -> Option<RouteStatus> {
        self.routes.get(route_id).map(|entry| entry.status())
    }

    /// Route ids in the order the routes were added.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        self.route_order.read().clone()
    }

    fn require(&self, route_id: &str) -> Result<Arc<Route>, RouteError> {
        self.route(route_id).ok_or_else(|| RouteError::UnknownRoute {
            route_id: route_id.to_string(),
        })
    }

    fn routes_in_order(&self) -> Vec<Arc<Route>> {
        self.route_ids()
            .iter()
            .filter_map(|route_id| self.route(route_id))
            .collect()
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Starts endpoints, aggregation sweepers and every stopped route.
    ///
    /// # Errors
    ///
    /// Returns the first endpoint or route start failure. Routes after the
    /// failing one are left stopped.
    pub async fn start(&self) -> Result<(), RouteError> {
        info!(context = %self.config.name, "starting routing context");
        self.registry.start_all().await?;

        {
            let mut sweepers = self.sweepers.lock();
            if sweepers.is_empty() {
                let interval = self.config.aggregation_check_interval;
                sweepers.extend(
                    self.aggregators
                        .lock()
                        .iter()
                        .map(|aggregator| aggregator.start_sweeper(interval)),
                );
            }
        }

        for route in self.routes_in_order() {
            if route.status() == RouteStatus::Stopped {
                route.start().await?;
            }
        }
        info!(
            context = %self.config.name,
            routes = self.routes.len(),
            "routing context started"
        );
        Ok(())
    }

    /// Stops running routes in reverse order, then sweepers, then endpoints.
    ///
    /// A route that fails to stop is logged and skipped so the rest still
    /// shut down.
    ///
    /// # Errors
    ///
    /// Returns the first endpoint stop failure.
    pub async fn stop(&self) -> Result<(), RouteError> {
        info!(context = %self.config.name, "stopping routing context");
        for route in self.routes_in_order().into_iter().rev() {
            if matches!(route.status(), RouteStatus::Started | RouteStatus::Suspended) {
                if let Err(err) = route.stop().await {
                    warn!(route_id = route.id(), error = %err, "route failed to stop");
                }
            }
        }

        let sweepers = std::mem::take(&mut *self.sweepers.lock());
        for mut sweeper in sweepers {
            sweeper.stop().await;
        }

        self.registry.stop_all().await?;
        info!(context = %self.config.name, "routing context stopped");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`] or the route's start error.
    pub async fn start_route(&self, route_id: &str) -> Result<(), RouteError> {
        self.require(route_id)?.start().await
    }

    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`] or the route's stop error.
    pub async fn stop_route(&self, route_id: &str) -> Result<(), RouteError> {
        self.require(route_id)?.stop().await
    }

    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`] or the route's suspend error.
    pub async fn suspend_route(&self, route_id: &str) -> Result<(), RouteError> {
        self.require(route_id)?.suspend().await
    }

    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`] or the route's resume error.
    pub async fn resume_route(&self, route_id: &str) -> Result<(), RouteError> {
        self.require(route_id)?.resume().await
    }

    // -- Entry points ------------------------------------------------------

    /// Sends `exchange` through the route; failures inside the route are on
    /// the returned exchange.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`] or an admission error.
    pub async fn send(&self, route_id: &str, exchange: Exchange) -> Result<Exchange, RouteError> {
        self.require(route_id)?.endpoint().send(exchange).await
    }

    /// Request-reply through the route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`], an admission error, or
    /// [`RouteError::Failed`] if the exchange failed.
    pub async fn request(&self, route_id: &str, body: impl Into<Value>) -> Result<Value, RouteError> {
        self.require(route_id)?.endpoint().request(body).await
    }

    /// Callback-style entry; returns whether routing completed synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownRoute`] without calling `callback`.
    pub fn process_async<F>(&self, route_id: &str, exchange: Exchange, callback: F) -> Result<bool, RouteError>
    where
        F: FnOnce(Exchange, bool) + Send + 'static,
    {
        let route = self.require(route_id)?;
        Ok(route.endpoint().process_async(&self.dispatcher, exchange, callback))
    }
}
