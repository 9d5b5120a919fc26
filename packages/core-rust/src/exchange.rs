//! The exchange: the unit of work that flows through a route.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::message::Message;
use crate::types::Value;

/// Well-known exchange property names set by the routing engine.
pub mod keys {
    /// `true` once the exchange has been redelivered at least once.
    pub const REDELIVERED: &str = "SwitchyardRedelivered";
    /// Number of redelivery attempts made so far.
    pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
    /// Maximum redeliveries allowed by the active policy.
    pub const REDELIVERY_MAX_COUNTER: &str = "SwitchyardRedeliveryMaxCounter";
    /// Set when the error handler gave up redelivering.
    pub const REDELIVERY_EXHAUSTED: &str = "SwitchyardRedeliveryExhausted";
    /// Delay in milliseconds applied before the latest redelivery.
    pub const REDELIVERY_DELAY: &str = "SwitchyardRedeliveryDelay";
    /// Message of the failure an error-handling construct handled.
    pub const EXCEPTION_CAUGHT: &str = "SwitchyardExceptionCaught";
    /// Name of the endpoint a failed exchange was delivered to.
    pub const FAILURE_ENDPOINT: &str = "SwitchyardFailureEndpoint";
    /// Id of the route the exchange failed in.
    pub const FAILURE_ROUTE_ID: &str = "SwitchyardFailureRouteId";
    /// `true` once a failure processor or dead-letter endpoint took the exchange.
    pub const FAILURE_HANDLED: &str = "SwitchyardFailureHandled";
    /// Whether the error handler marked the failure as handled.
    pub const ERROR_HANDLER_HANDLED: &str = "SwitchyardErrorHandlerHandled";
    /// Outcome of the most recent filter evaluation.
    pub const FILTER_MATCHED: &str = "SwitchyardFilterMatched";
    pub const SPLIT_INDEX: &str = "SwitchyardSplitIndex";
    pub const SPLIT_SIZE: &str = "SwitchyardSplitSize";
    pub const SPLIT_COMPLETE: &str = "SwitchyardSplitComplete";
    pub const MULTICAST_INDEX: &str = "SwitchyardMulticastIndex";
    pub const MULTICAST_COMPLETE: &str = "SwitchyardMulticastComplete";
    pub const AGGREGATED_SIZE: &str = "SwitchyardAggregatedSize";
    pub const AGGREGATED_COMPLETED_BY: &str = "SwitchyardAggregatedCompletedBy";
    pub const AGGREGATED_CORRELATION_KEY: &str = "SwitchyardAggregatedCorrelationKey";
    /// Id of the exchange this one was copied from.
    pub const CORRELATION_ID: &str = "SwitchyardCorrelationId";
    /// When `true`, pipelines stop routing the exchange without an error.
    pub const ROUTE_STOP: &str = "SwitchyardRouteStop";
}

/// Whether the caller expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire-and-forget.
    #[default]
    InOnly,
    /// Request-reply.
    InOut,
}

/// Mutable unit of work: in message, optional out message, properties and a
/// single exception slot.
///
/// An exchange is owned by exactly one execution context at a time. Routing
/// constructs borrow it mutably while they run; fan-out constructs hand
/// branches a [`copy`](Exchange::copy) and merge results back with
/// [`copy_results_from`](Exchange::copy_results_from).
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    properties: HashMap<String, Value>,
    exception: Option<ExchangeError>,
    caught: Option<ExchangeError>,
    from_route_id: Option<String>,
}

impl Exchange {
    #[must_use]
    pub fn new(pattern: ExchangePattern) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern,
            in_message: Message::default(),
            out_message: None,
            properties: HashMap::new(),
            exception: None,
            caught: None,
            from_route_id: None,
        }
    }

    /// Creates an in-only exchange whose in message carries `body`.
    #[must_use]
    pub fn with_body(body: impl Into<Value>) -> Self {
        let mut exchange = Self::new(ExchangePattern::InOnly);
        exchange.create_in(body);
        exchange
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    #[must_use]
    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    // -- messages ------------------------------------------------------------

    /// Replaces the in message with a fresh message carrying `body`.
    pub fn create_in(&mut self, body: impl Into<Value>) -> &mut Message {
        self.in_message = Message::new(body);
        &mut self.in_message
    }

    #[must_use]
    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in(&mut self, message: Message) {
        self.in_message = message;
    }

    /// The out message, or the in message when no out message has been set.
    #[must_use]
    pub fn out_message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    /// Mutable out message. The first call creates it as a copy of the in
    /// message (sharing its body until written).
    pub fn out_message_mut(&mut self) -> &mut Message {
        let in_message = &self.in_message;
        self.out_message.get_or_insert_with(|| in_message.clone())
    }

    pub fn set_out(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    #[must_use]
    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    /// Moves an out message, if any, into the in slot. Pipelines call this
    /// between steps so that each step sees its predecessor's reply.
    pub fn promote_out(&mut self) -> bool {
        match self.out_message.take() {
            Some(out) => {
                self.in_message = out;
                true
            }
            None => false,
        }
    }

    /// Shorthand for the in message body.
    #[must_use]
    pub fn body(&self) -> &Value {
        self.in_message.body()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.in_message.set_body(body);
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.in_message.header(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.in_message.set_header(name, value);
    }

    // -- properties ----------------------------------------------------------

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Reads a boolean property; absent or non-boolean values read as `false`.
    #[must_use]
    pub fn property_flag(&self, name: &str) -> bool {
        self.property(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(name.into(), value.into())
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    #[must_use]
    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    // -- exception slot ------------------------------------------------------

    #[must_use]
    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_ref()
    }

    /// Records a failure. A failure already present is overwritten: the last
    /// write wins, so error handlers must clear the slot before resuming.
    pub fn set_exception(&mut self, err: impl Into<ExchangeError>) {
        let err = err.into();
        if let Some(previous) = &self.exception {
            debug!(
                exchange_id = %self.id,
                previous = %previous,
                replacement = %err,
                "overwriting exchange exception"
            );
        }
        self.exception = Some(err);
    }

    pub fn take_exception(&mut self) -> Option<ExchangeError> {
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The failure most recently handled by a catch clause or error handler.
    #[must_use]
    pub fn exception_caught(&self) -> Option<&ExchangeError> {
        self.caught.as_ref()
    }

    /// Records a handled failure, mirrored as a message in
    /// [`keys::EXCEPTION_CAUGHT`].
    pub fn set_exception_caught(&mut self, err: ExchangeError) {
        self.properties
            .insert(keys::EXCEPTION_CAUGHT.to_string(), Value::String(err.to_string()));
        self.caught = Some(err);
    }

    /// Whether routing should continue with the next step: no failure is
    /// recorded and nobody asked to stop the route.
    #[must_use]
    pub fn should_continue(&self) -> bool {
        !self.is_failed() && !self.property_flag(keys::ROUTE_STOP)
    }

    /// Converts the exchange into its outcome for request-reply callers.
    ///
    /// # Errors
    ///
    /// Returns the recorded failure if the exchange carries one.
    pub fn into_result(self) -> Result<Exchange, ExchangeError> {
        match self.exception {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    // -- copying -------------------------------------------------------------

    /// Creates a copy with a new identity for a fan-out branch.
    ///
    /// Properties and headers are snapshotted so branches cannot clobber each
    /// other; message bodies stay shared until a branch writes to one. The copy
    /// records this exchange's id under [`keys::CORRELATION_ID`].
    #[must_use]
    pub fn copy(&self) -> Exchange {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.properties
            .insert(keys::CORRELATION_ID.to_string(), Value::String(self.id.clone()));
        copy
    }

    /// Merges a result exchange into this one, keeping this exchange's id and
    /// correlation id. Messages and the exception slot are replaced; properties
    /// are merged with `result` taking precedence.
    pub fn copy_results_from(&mut self, result: Exchange) {
        if result.id == self.id {
            return;
        }
        let correlation_id = self.properties.remove(keys::CORRELATION_ID);
        self.in_message = result.in_message;
        self.out_message = result.out_message;
        self.properties.extend(result.properties);
        match correlation_id {
            Some(id) => {
                self.properties.insert(keys::CORRELATION_ID.to_string(), id);
            }
            None => {
                self.properties.remove(keys::CORRELATION_ID);
            }
        }
        self.exception = result.exception;
        if result.caught.is_some() {
            self.caught = result.caught;
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(ExchangePattern::InOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_exchanges_have_unique_ids() {
        let a = Exchange::default();
        let b = Exchange::default();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn out_falls_back_to_in() {
        let mut exchange = Exchange::with_body("hello");
        assert!(!exchange.has_out());
        assert_eq!(exchange.out_message().body(), &Value::from("hello"));

        exchange.out_message_mut().set_body("reply");
        assert!(exchange.has_out());
        assert_eq!(exchange.out_message().body(), &Value::from("reply"));
        assert_eq!(exchange.in_message().body(), &Value::from("hello"));
    }

    #[test]
    fn in_and_out_headers_are_independent() {
        let mut exchange = Exchange::with_body(1);
        exchange.set_header("h", "in");
        exchange.out_message_mut().set_header("h", "out");
        assert_eq!(exchange.header("h"), Some(&Value::from("in")));
        assert_eq!(exchange.out_message().header("h"), Some(&Value::from("out")));
    }

    #[test]
    fn promote_out_moves_reply_into_in() {
        let mut exchange = Exchange::with_body("request");
        exchange.set_out(Message::new("reply"));
        assert!(exchange.promote_out());
        assert_eq!(exchange.body(), &Value::from("reply"));
        assert!(!exchange.has_out());
        assert!(!exchange.promote_out());
    }

    // Last write wins: a second failure replaces the first. Catch-clause
    // selection sees only the replacement.
    #[test]
    fn second_exception_overwrites_first() {
        let mut exchange = Exchange::default();
        exchange.set_exception(anyhow::anyhow!("first"));
        exchange.set_exception(anyhow::anyhow!("second"));
        assert_eq!(exchange.exception().unwrap().to_string(), "second");
    }

    #[test]
    fn clear_exception_resumes_happy_path() {
        let mut exchange = Exchange::default();
        exchange.set_exception(anyhow::anyhow!("boom"));
        assert!(!exchange.should_continue());
        exchange.clear_exception();
        assert!(exchange.should_continue());
    }

    #[test]
    fn route_stop_halts_without_failure() {
        let mut exchange = Exchange::default();
        exchange.set_property(keys::ROUTE_STOP, true);
        assert!(!exchange.is_failed());
        assert!(!exchange.should_continue());
    }

    #[test]
    fn copy_snapshots_properties_and_headers() {
        let mut original = Exchange::with_body("shared");
        original.set_header("h", 1);
        original.set_property("p", 1);

        let mut copy = original.copy();
        assert_ne!(copy.id(), original.id());
        assert_eq!(
            copy.property(keys::CORRELATION_ID),
            Some(&Value::String(original.id().to_string()))
        );
        assert!(copy.in_message().shares_body_with(original.in_message()));

        copy.set_header("h", 2);
        copy.set_property("p", 2);
        assert_eq!(original.header("h"), Some(&Value::Int(1)));
        assert_eq!(original.property("p"), Some(&Value::Int(1)));
    }

    #[test]
    fn copy_results_keeps_identity() {
        let mut original = Exchange::with_body("in");
        original.set_property("kept", true);
        let id = original.id().to_string();

        let mut result = original.copy();
        result.set_body("merged");
        result.set_property("added", 7);
        result.set_exception(anyhow::anyhow!("branch failed"));

        original.copy_results_from(result);
        assert_eq!(original.id(), id);
        assert_eq!(original.body(), &Value::from("merged"));
        assert!(original.property_flag("kept"));
        assert_eq!(original.property("added"), Some(&Value::Int(7)));
        assert!(original.property(keys::CORRELATION_ID).is_none());
        assert!(original.is_failed());
    }

    #[test]
    fn into_result_surfaces_failure() {
        let mut exchange = Exchange::with_body(1);
        assert!(exchange.clone().into_result().is_ok());
        exchange.set_exception(anyhow::anyhow!("nope"));
        let err = exchange.into_result().unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn exception_caught_is_mirrored_in_properties() {
        let mut exchange = Exchange::default();
        exchange.set_exception_caught(ExchangeError::msg("handled"));
        assert_eq!(
            exchange.property(keys::EXCEPTION_CAUGHT),
            Some(&Value::from("handled"))
        );
        assert_eq!(exchange.exception_caught().unwrap().to_string(), "handled");
    }
}
