use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use switchyard_core::{Processor, SharedProcessor};
use tracing::debug;

use crate::error::{ConfigError, RouteError};

// ---------------------------------------------------------------------------
// Endpoint trait
// ---------------------------------------------------------------------------

/// A named producer that routes can send to.
///
/// Endpoints are registered with an [`EndpointRegistry`], started in
/// registration order and stopped in reverse order. The `Any` bound enables
/// type-based lookup via [`EndpointRegistry::get`].
#[async_trait]
pub trait Endpoint: Processor + Any {
    /// Unique address of the endpoint, e.g. `"mock:orders"`.
    fn uri(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedEndpoint = Arc<dyn Endpoint>;

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Registered {
    endpoint: SharedEndpoint,
    processor: SharedProcessor,
}

/// Registry of endpoints, passed explicitly to route construction.
///
/// Two lookups:
/// - **By uri** (`get_by_uri`, `processor`)
/// - **By type** (`get::<T>`): the first endpoint registered with that type
pub struct EndpointRegistry {
    by_uri: DashMap<String, Registered>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    order: RwLock<Vec<String>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_uri: DashMap::new(),
            by_type: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers an endpoint and returns a typed handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateEndpoint`] if the uri is taken.
    pub fn register<T: Endpoint>(&self, endpoint: T) -> Result<Arc<T>, ConfigError> {
        let uri = endpoint.uri().to_string();
        let arc = Arc::new(endpoint);
        match self.by_uri.entry(uri.clone()) {
            Entry::Occupied(_) => return Err(ConfigError::DuplicateEndpoint { uri }),
            Entry::Vacant(slot) => {
                slot.insert(Registered {
                    endpoint: arc.clone(),
                    processor: arc.clone(),
                });
            }
        }
        self.by_type.entry(TypeId::of::<T>()).or_insert_with(|| arc.clone() as Arc<dyn Any + Send + Sync>);
        self.order.write().push(uri);
        Ok(arc)
    }

    pub fn get<T: Endpoint>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn get_by_uri(&self, uri: &str) -> Option<SharedEndpoint> {
        self.by_uri.get(uri).map(|entry| Arc::clone(&entry.endpoint))
    }

    /// The endpoint registered under `uri`, as a route step.
    pub fn processor(&self, uri: &str) -> Option<SharedProcessor> {
        self.by_uri.get(uri).map(|entry| Arc::clone(&entry.processor))
    }

    /// Uris in registration order.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// # Errors
    ///
    /// Returns [`RouteError::Endpoint`] for the first endpoint that fails to
    /// start; later endpoints are not started.
    pub async fn start_all(&self) -> Result<(), RouteError> {
        for uri in self.uris() {
            if let Some(endpoint) = self.get_by_uri(&uri) {
                endpoint.start().await.map_err(|source| RouteError::Endpoint {
                    uri: uri.clone(),
                    action: "start",
                    source,
                })?;
                debug!(uri = %uri, "endpoint started");
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RouteError::Endpoint`] for the first endpoint that fails to
    /// stop.
    pub async fn stop_all(&self) -> Result<(), RouteError> {
        for uri in self.uris().iter().rev() {
            if let Some(endpoint) = self.get_by_uri(uri) {
                endpoint.stop().await.map_err(|source| RouteError::Endpoint {
                    uri: uri.clone(),
                    action: "stop",
                    source,
                })?;
                debug!(uri = %uri, "endpoint stopped");
            }
        }
        Ok(())
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
