//! Built-in endpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::{Exchange, Processor, Value};
use tokio::sync::Notify;
use tracing::info;

use crate::registry::Endpoint;

// ---------------------------------------------------------------------------
// MockEndpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockBehavior {
    failure: Option<String>,
    delay: Option<Duration>,
}

/// Records every exchange it receives. Can be told to fail or to delay.
///
/// Recording happens before an injected failure, so failed deliveries are
/// visible too.
#[derive(Debug)]
pub struct MockEndpoint {
    uri: String,
    received: Mutex<Vec<Exchange>>,
    behavior: Mutex<MockBehavior>,
    arrivals: Notify,
}

impl MockEndpoint {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            received: Mutex::new(Vec::new()),
            behavior: Mutex::new(MockBehavior::default()),
            arrivals: Notify::new(),
        }
    }

    /// Fails every subsequent exchange with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.behavior.lock().failure = Some(message.into());
    }

    pub fn clear_failure(&self) {
        self.behavior.lock().failure = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.behavior.lock().delay = Some(delay);
    }

    #[must_use]
    pub fn received(&self) -> Vec<Exchange> {
        self.received.lock().clone()
    }

    #[must_use]
    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    #[must_use]
    pub fn received_bodies(&self) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .map(|exchange| exchange.body().clone())
            .collect()
    }

    /// Forgets received exchanges and injected behavior.
    pub fn reset(&self) {
        self.received.lock().clear();
        *self.behavior.lock() = MockBehavior::default();
    }

    /// Waits until at least `count` exchanges have arrived. Returns `false`
    /// on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let arrived = async {
            loop {
                let notified = self.arrivals.notified();
                if self.received_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, arrived).await.is_ok()
    }
}

#[async_trait]
impl Processor for MockEndpoint {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let (failure, delay) = {
            let behavior = self.behavior.lock();
            (behavior.failure.clone(), behavior.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.received.lock().push(exchange.clone());
        self.arrivals.notify_waiters();
        if let Some(message) = failure {
            anyhow::bail!("{}: {message}", self.uri);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.uri
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }
}

// ---------------------------------------------------------------------------
// LogEndpoint
// ---------------------------------------------------------------------------

/// Logs each exchange at info level, body rendered as JSON.
#[derive(Debug, Clone)]
pub struct LogEndpoint {
    uri: String,
    show_headers: bool,
}

impl LogEndpoint {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            show_headers: false,
        }
    }

    #[must_use]
    pub fn show_headers(mut self) -> Self {
        self.show_headers = true;
        self
    }

    fn render(&self, exchange: &Exchange) -> serde_json::Value {
        let mut rendered = serde_json::Map::new();
        rendered.insert("body".to_string(), exchange.body().clone().into());
        if self.show_headers {
            let headers: BTreeMap<String, Value> = exchange
                .in_message()
                .headers()
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();
            rendered.insert("headers".to_string(), Value::from(headers).into());
        }
        serde_json::Value::Object(rendered)
    }
}

#[async_trait]
impl Processor for LogEndpoint {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let rendered = self.render(exchange);
        info!(
            endpoint = %self.uri,
            exchange_id = exchange.id(),
            route_id = exchange.from_route_id().unwrap_or("-"),
            failed = exchange.is_failed(),
            exchange = %rendered,
            "exchange"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.uri
    }
}

impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::completion::invoke;

    #[tokio::test]
    async fn mock_records_and_fails_on_demand() {
        let mock = MockEndpoint::new("mock:out");
        let mut exchange = Exchange::with_body("a");
        invoke(&mock, &mut exchange).await;
        assert!(!exchange.is_failed());

        mock.fail_with("unavailable");
        let mut exchange = Exchange::with_body("b");
        invoke(&mock, &mut exchange).await;
        assert_eq!(exchange.exception().unwrap().to_string(), "mock:out: unavailable");

        assert_eq!(mock.received_bodies(), vec![Value::from("a"), Value::from("b")]);
        mock.reset();
        assert_eq!(mock.received_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_wait_for_arrivals() {
        let mock = Arc::new(MockEndpoint::new("mock:slow"));
        mock.set_delay(Duration::from_millis(50));

        let sender = Arc::clone(&mock);
        tokio::spawn(async move {
            for body in 0..3 {
                let mut exchange = Exchange::with_body(body);
                invoke(&*sender, &mut exchange).await;
            }
        });

        assert!(!mock.wait_for(3, Duration::from_millis(60)).await);
        assert!(mock.wait_for(3, Duration::from_secs(1)).await);
        assert_eq!(mock.received_count(), 3);
    }

    #[test]
    fn log_endpoint_renders_json() {
        let mut exchange = Exchange::with_body(Value::from(vec![Value::from(1), Value::from("two")]));
        exchange.set_header("source", "crm");

        let plain = LogEndpoint::new("log:plain").render(&exchange);
        assert_eq!(plain, serde_json::json!({ "body": [1, "two"] }));

        let detailed = LogEndpoint::new("log:detailed").show_headers().render(&exchange);
        assert_eq!(
            detailed,
            serde_json::json!({ "body": [1, "two"], "headers": { "source": "crm" } })
        );
    }

    #[tokio::test]
    async fn log_endpoint_passes_exchange_through() {
        let log = LogEndpoint::new("log:out");
        let mut exchange = Exchange::with_body("x");
        invoke(&log, &mut exchange).await;
        assert!(!exchange.is_failed());
        assert_eq!(log.uri(), "log:out");
    }
}
