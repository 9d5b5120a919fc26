//! Routes: a lifecycle-managed binding from a consumer to a root processor.
//!
//! - [`lifecycle`]: status state machine and in-flight tracking
//! - [`middleware`]: tower layers around route entry
//! - [`builder`]: route assembly and validation

pub mod builder;
pub mod lifecycle;
pub mod middleware;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::{Exchange, ExchangePattern, Processor, SharedProcessor, Value};
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

pub use builder::RouteBuilder;
pub use lifecycle::{InFlightGuard, RouteLifecycle, RouteStatus};

use self::middleware::{build_route_service, RouteEntry};
use crate::completion::{invoke, AsyncDispatcher};
use crate::error::RouteError;

// ---------------------------------------------------------------------------
// RouteService
// ---------------------------------------------------------------------------

/// Innermost route service: admits exchanges while the route is started and
/// runs them through the root processor.
///
/// Failures travel back on the returned exchange; only admission problems
/// are `Err`.
#[derive(Clone)]
pub struct RouteService {
    route_id: Arc<str>,
    lifecycle: Arc<RouteLifecycle>,
    processor: SharedProcessor,
}

impl RouteService {
    pub fn new(route_id: impl Into<Arc<str>>, lifecycle: Arc<RouteLifecycle>, processor: SharedProcessor) -> Self {
        Self {
            route_id: route_id.into(),
            lifecycle,
            processor,
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

impl Service<Exchange> for RouteService {
    type Response = Exchange;
    type Error = RouteError;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, RouteError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut exchange: Exchange) -> Self::Future {
        // Counted before the status check so a concurrent stop waits for us.
        let guard = self.lifecycle.in_flight_guard();
        let status = self.lifecycle.status();
        if status != RouteStatus::Started {
            let route_id = self.route_id.to_string();
            return Box::pin(async move { Err(RouteError::NotAccepting { route_id, status }) });
        }

        let route_id = Arc::clone(&self.route_id);
        let processor = Arc::clone(&self.processor);
        Box::pin(async move {
            let _guard = guard;
            if exchange.from_route_id().is_none() {
                exchange.set_from_route_id(&*route_id);
            }
            invoke(&*processor, &mut exchange).await;
            if let Some(err) = exchange.exception() {
                error!(
                    route_id = %route_id,
                    exchange_id = exchange.id(),
                    error = %err,
                    "exchange failed and no error handler took it"
                );
            }
            Ok(exchange)
        })
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Source of exchanges for a route. Started after the route is accepting
/// and stopped before it drains.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Begins feeding exchanges to `endpoint`.
    async fn start(&self, endpoint: RouteEndpoint) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn suspend(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RouteEndpoint
// ---------------------------------------------------------------------------

/// Cloneable handle for handing exchanges to a route.
///
/// Also a [`Processor`], so one route can call another directly; admission
/// errors then become the caller's exchange failure.
#[derive(Clone)]
pub struct RouteEndpoint {
    route_id: Arc<str>,
    entry: Arc<Mutex<RouteEntry>>,
}

impl RouteEndpoint {
    fn new(route_id: Arc<str>, entry: RouteEntry) -> Self {
        Self {
            route_id,
            entry: Arc::new(Mutex::new(entry)),
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Runs `exchange` through the route and returns it once routing is
    /// complete. A failure inside the route is on the returned exchange.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotAccepting`] or [`RouteError::Overloaded`] if
    /// the route did not admit the exchange.
    pub async fn send(&self, exchange: Exchange) -> Result<Exchange, RouteError> {
        let service = self.entry.lock().clone();
        service.oneshot(exchange).await
    }

    /// Request-reply: sends an in-out exchange carrying `body` and returns the
    /// reply body.
    ///
    /// # Errors
    ///
    /// Admission errors as for [`send`](Self::send), or
    /// [`RouteError::Failed`] if the exchange failed.
    pub async fn request(&self, body: impl Into<Value>) -> Result<Value, RouteError> {
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        exchange.create_in(body);
        let reply = self.send(exchange).await?.into_result()?;
        Ok(reply.out_message().body().clone())
    }

    /// Callback-style entry; see [`AsyncDispatcher::process_async`].
    pub fn process_async<F>(&self, dispatcher: &AsyncDispatcher, exchange: Exchange, callback: F) -> bool
    where
        F: FnOnce(Exchange, bool) + Send + 'static,
    {
        dispatcher.process_async(Arc::new(self.clone()), exchange, callback)
    }
}

#[async_trait]
impl Processor for RouteEndpoint {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let result = self.send(exchange.clone()).await?;
        *exchange = result;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.route_id
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// A started route admits exchanges through its [`RouteEndpoint`]; stopping
/// waits for in-flight exchanges up to the shutdown timeout.
pub struct Route {
    id: Arc<str>,
    lifecycle: Arc<RouteLifecycle>,
    endpoint: RouteEndpoint,
    consumer: Option<Arc<dyn Consumer>>,
    shutdown_timeout: Duration,
}

impl Route {
    pub(crate) fn new(
        id: &str,
        processor: SharedProcessor,
        consumer: Option<Arc<dyn Consumer>>,
        max_inflight: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        let id: Arc<str> = Arc::from(id);
        let lifecycle = Arc::new(RouteLifecycle::new(&*id));
        let service = RouteService::new(Arc::clone(&id), Arc::clone(&lifecycle), processor);
        let endpoint = RouteEndpoint::new(Arc::clone(&id), build_route_service(service, max_inflight));
        Self {
            id,
            lifecycle,
            endpoint,
            consumer,
            shutdown_timeout,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> RouteStatus {
        self.lifecycle.status()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    #[must_use]
    pub fn endpoint(&self) -> RouteEndpoint {
        self.endpoint.clone()
    }

    /// # Errors
    ///
    /// Returns [`RouteError::InvalidTransition`] unless the route is stopped,
    /// or [`RouteError::Consumer`] if the consumer fails to start (the route
    /// is stopped again).
    pub async fn start(&self) -> Result<(), RouteError> {
        self.lifecycle.transition(RouteStatus::Starting)?;
        self.lifecycle.transition(RouteStatus::Started)?;
        if let Some(consumer) = &self.consumer {
            if let Err(source) = consumer.start(self.endpoint()).await {
                self.lifecycle.transition(RouteStatus::Stopping)?;
                self.lifecycle.transition(RouteStatus::Stopped)?;
                return Err(RouteError::Consumer {
                    route_id: self.id.to_string(),
                    source,
                });
            }
        }
        info!(route_id = %self.id, "route started");
        Ok(())
    }

    /// Stops the consumer, then waits for in-flight exchanges.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidTransition`] unless the route is started
    /// or suspended.
    pub async fn stop(&self) -> Result<(), RouteError> {
        self.lifecycle.transition(RouteStatus::Stopping)?;
        if let Some(consumer) = &self.consumer {
            if let Err(err) = consumer.stop().await {
                warn!(route_id = %self.id, error = %err, "consumer failed to stop cleanly");
            }
        }
        if !self.lifecycle.wait_for_drain(self.shutdown_timeout).await {
            warn!(
                route_id = %self.id,
                in_flight = self.lifecycle.in_flight_count(),
                timeout_ms = self.shutdown_timeout.as_millis(),
                "route stopped with exchanges still in flight"
            );
        }
        self.lifecycle.transition(RouteStatus::Stopped)?;
        info!(route_id = %self.id, "route stopped");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RouteError::InvalidTransition`] unless the route is started,
    /// or [`RouteError::Consumer`] if the consumer cannot suspend (the route
    /// stays started).
    pub async fn suspend(&self) -> Result<(), RouteError> {
        self.lifecycle.transition(RouteStatus::Suspended)?;
        if let Some(consumer) = &self.consumer {
            if let Err(source) = consumer.suspend().await {
                self.lifecycle.transition(RouteStatus::Started)?;
                return Err(RouteError::Consumer {
                    route_id: self.id.to_string(),
                    source,
                });
            }
        }
        debug!(route_id = %self.id, "route suspended");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RouteError::InvalidTransition`] unless the route is
    /// suspended, or [`RouteError::Consumer`] if the consumer cannot resume.
    pub async fn resume(&self) -> Result<(), RouteError> {
        self.lifecycle.transition(RouteStatus::Started)?;
        if let Some(consumer) = &self.consumer {
            consumer.resume().await.map_err(|source| RouteError::Consumer {
                route_id: self.id.to_string(),
                source,
            })?;
        }
        debug!(route_id = %self.id, "route resumed");
        Ok(())
    }
}
