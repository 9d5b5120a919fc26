//! Route-level error handling: redelivery, exception policies and the
//! dead-letter channel.
//!
//! An [`ErrorHandler`] wraps a route's root processor. When the child fails,
//! the handler picks the first matching [`ExceptionPolicy`], redelivers the
//! same exchange according to the effective [`RedeliveryPolicy`], and once
//! redelivery is exhausted hands the exchange to a failure processor: the
//! policy's own processor, or the dead-letter endpoint.

mod redelivery;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::error::matches_any;
use switchyard_core::{
    keys, ErrorFilter, Exchange, ExchangeError, Message, Predicate, Processor, SharedPredicate,
    SharedProcessor,
};
use tracing::{debug, error, warn};

pub use redelivery::{DelayPattern, RedeliveryPolicy};

use crate::completion::invoke;

// ---------------------------------------------------------------------------
// ExceptionPolicy
// ---------------------------------------------------------------------------

/// Per-failure-type overrides, selected by error filters in declaration
/// order.
#[derive(Clone)]
pub struct ExceptionPolicy {
    filters: Vec<ErrorFilter>,
    on_when: Option<SharedPredicate>,
    redelivery: Option<RedeliveryPolicy>,
    handled: Option<bool>,
    processor: Option<SharedProcessor>,
}

impl ExceptionPolicy {
    #[must_use]
    pub fn new(filters: Vec<ErrorFilter>) -> Self {
        Self {
            filters,
            on_when: None,
            redelivery: None,
            handled: None,
            processor: None,
        }
    }

    #[must_use]
    pub fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(vec![ErrorFilter::of::<E>()])
    }

    #[must_use]
    pub fn on_when(mut self, predicate: impl Predicate + 'static) -> Self {
        self.on_when = Some(Arc::new(predicate));
        self
    }

    /// Replaces the handler's redelivery policy for matching failures.
    #[must_use]
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Whether the failure is cleared once delivery is exhausted. Without
    /// this, a policy with its own processor leaves the failure set, and one
    /// without inherits the handler's behavior.
    #[must_use]
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = Some(handled);
        self
    }

    /// Processor that receives exhausted exchanges instead of the dead-letter
    /// endpoint.
    #[must_use]
    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    fn matches(&self, err: &ExchangeError, exchange: &Exchange) -> bool {
        if !matches_any(&self.filters, err) {
            return false;
        }
        match &self.on_when {
            None => true,
            Some(predicate) => predicate.matches(exchange).unwrap_or_else(|eval_err| {
                warn!(error = %eval_err, "exception policy predicate failed, skipping policy");
                false
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Flavor {
    /// Exhausted exchanges go to an endpoint and count as handled.
    DeadLetter { uri: String, endpoint: SharedProcessor },
    /// Exhausted failures are logged and returned to the caller.
    Default,
}

/// Error-handling wrapper around a child processor.
pub struct ErrorHandler {
    child: SharedProcessor,
    config: ErrorHandlerBuilder,
}

impl ErrorHandler {
    /// Dead-letter channel delivering exhausted exchanges to `endpoint`.
    pub fn dead_letter(uri: impl Into<String>, endpoint: impl Processor + 'static) -> ErrorHandlerBuilder {
        ErrorHandlerBuilder::new(Flavor::DeadLetter {
            uri: uri.into(),
            endpoint: Arc::new(endpoint),
        })
    }

    /// Handler that redelivers and then propagates the failure.
    #[must_use]
    pub fn default_handler() -> ErrorHandlerBuilder {
        ErrorHandlerBuilder::new(Flavor::Default)
    }

    fn policy_for(&self, err: &ExchangeError, exchange: &Exchange) -> Option<&ExceptionPolicy> {
        self.config
            .policies
            .iter()
            .find(|policy| policy.matches(err, exchange))
    }

    fn should_redeliver(&self, redelivery: &RedeliveryPolicy, attempt: u32, exchange: &Exchange) -> bool {
        match &self.config.retry_while {
            Some(predicate) => predicate.matches(exchange).unwrap_or_else(|eval_err| {
                warn!(error = %eval_err, "retry-while predicate failed, not redelivering");
                false
            }),
            None => redelivery.should_redeliver(attempt),
        }
    }

    fn is_handled(&self, policy: Option<&ExceptionPolicy>) -> bool {
        match policy {
            Some(ExceptionPolicy {
                handled: Some(handled),
                ..
            }) => *handled,
            Some(ExceptionPolicy {
                processor: Some(_), ..
            }) => false,
            _ => matches!(self.config.flavor, Flavor::DeadLetter { .. }),
        }
    }

    async fn exhausted(
        &self,
        exchange: &mut Exchange,
        err: ExchangeError,
        policy: Option<&ExceptionPolicy>,
        original: Option<&Message>,
    ) {
        let handled = self.is_handled(policy);
        exchange.set_property(keys::REDELIVERY_EXHAUSTED, true);
        exchange.set_property(keys::ERROR_HANDLER_HANDLED, handled);
        exchange.set_exception_caught(err.clone());

        let target = match policy.and_then(|p| p.processor.as_ref()) {
            Some(processor) => Some((processor.name(), processor)),
            None => match &self.config.flavor {
                Flavor::DeadLetter { uri, endpoint } => Some((uri.as_str(), endpoint)),
                Flavor::Default => None,
            },
        };

        let Some((target_name, target)) = target else {
            if handled {
                debug!(exchange_id = exchange.id(), error = %err, "failure marked handled by exception policy");
                exchange.clear_exception();
            } else {
                error!(
                    exchange_id = exchange.id(),
                    route_id = exchange.from_route_id().unwrap_or("-"),
                    error = %err,
                    "exchange failed and no failure processor is configured"
                );
                exchange.set_exception(err);
            }
            return;
        };

        exchange.clear_exception();
        if let Some(original) = original {
            exchange.set_in(original.clone());
            exchange.take_out();
        }
        exchange.set_property(keys::FAILURE_ENDPOINT, target_name);
        if let Some(route_id) = exchange.from_route_id().map(str::to_string) {
            exchange.set_property(keys::FAILURE_ROUTE_ID, route_id);
        }
        warn!(
            exchange_id = exchange.id(),
            endpoint = target_name,
            error = %err,
            "delivery exhausted, handing exchange to failure processor"
        );

        invoke(&**target, exchange).await;
        if let Some(new_err) = exchange.take_exception() {
            if self.config.dead_letter_handle_new_exception {
                error!(
                    exchange_id = exchange.id(),
                    endpoint = target_name,
                    error = %new_err,
                    "failure processor failed, failure dropped"
                );
            } else {
                exchange.set_exception(new_err);
                return;
            }
        }

        exchange.set_property(keys::FAILURE_HANDLED, true);
        if !handled {
            exchange.set_exception(err);
        }
    }
}

#[async_trait]
impl Processor for ErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let original = self
            .config
            .use_original_message
            .then(|| exchange.in_message().clone());
        let mut attempt: u32 = 0;
        let mut delay = Duration::ZERO;

        loop {
            invoke(&*self.child, exchange).await;
            let Some(err) = exchange.exception().cloned() else {
                return Ok(());
            };

            let policy = self.policy_for(&err, exchange);
            let redelivery = policy
                .and_then(|p| p.redelivery.as_ref())
                .unwrap_or(&self.config.redelivery);
            if !self.should_redeliver(redelivery, attempt + 1, exchange) {
                self.exhausted(exchange, err, policy, original.as_ref()).await;
                return Ok(());
            }

            attempt += 1;
            delay = redelivery.calculate_delay(delay, attempt);
            exchange.set_property(keys::REDELIVERED, true);
            exchange.set_property(keys::REDELIVERY_COUNTER, attempt);
            exchange.set_property(keys::REDELIVERY_MAX_COUNTER, redelivery.maximum_redeliveries());
            exchange.set_property(
                keys::REDELIVERY_DELAY,
                i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
            );
            warn!(
                exchange_id = exchange.id(),
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "redelivering failed exchange"
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            exchange.clear_exception();

            if let Some(on_redelivery) = &self.config.on_redelivery {
                invoke(&**on_redelivery, exchange).await;
                if let Some(failure) = exchange.exception().cloned() {
                    warn!(exchange_id = exchange.id(), error = %failure, "on-redelivery processor failed");
                    let policy = self.policy_for(&failure, exchange);
                    self.exhausted(exchange, failure, policy, original.as_ref()).await;
                    return Ok(());
                }
            }
        }
    }

    fn name(&self) -> &str {
        match &self.config.flavor {
            Flavor::DeadLetter { .. } => "dead-letter-channel",
            Flavor::Default => "error-handler",
        }
    }
}

/// Configuration for an [`ErrorHandler`]; [`wrap`](Self::wrap) applies it to
/// a child processor. Cloneable so one configuration can guard many routes.
#[derive(Clone)]
pub struct ErrorHandlerBuilder {
    flavor: Flavor,
    redelivery: RedeliveryPolicy,
    policies: Vec<ExceptionPolicy>,
    on_redelivery: Option<SharedProcessor>,
    retry_while: Option<SharedPredicate>,
    use_original_message: bool,
    dead_letter_handle_new_exception: bool,
}

impl ErrorHandlerBuilder {
    fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            redelivery: RedeliveryPolicy::default(),
            policies: Vec::new(),
            on_redelivery: None,
            retry_while: None,
            use_original_message: false,
            dead_letter_handle_new_exception: true,
        }
    }

    #[must_use]
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    #[must_use]
    pub fn on_exception(mut self, policy: ExceptionPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Runs before every redelivery attempt, after the delay.
    #[must_use]
    pub fn on_redelivery(mut self, processor: impl Processor + 'static) -> Self {
        self.on_redelivery = Some(Arc::new(processor));
        self
    }

    /// Redelivers while `predicate` holds, ignoring the maximum count.
    #[must_use]
    pub fn retry_while(mut self, predicate: impl Predicate + 'static) -> Self {
        self.retry_while = Some(Arc::new(predicate));
        self
    }

    /// Delivers the in message as it entered the handler, discarding changes
    /// made by failed attempts.
    #[must_use]
    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }

    /// When `true` (the default), a failure raised by the failure processor
    /// itself is logged and dropped instead of reaching the caller.
    #[must_use]
    pub fn dead_letter_handle_new_exception(mut self, handle: bool) -> Self {
        self.dead_letter_handle_new_exception = handle;
        self
    }

    #[must_use]
    pub fn wrap(self, child: impl Processor + 'static) -> ErrorHandler {
        ErrorHandler {
            child: Arc::new(child),
            config: self,
        }
    }
}
