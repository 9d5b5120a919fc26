use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::exchange::Exchange;
use crate::types::Value;

/// Unit of routing logic: consumes an exchange, may mutate it, and completes.
///
/// Completion is the resolution of the returned future, so it happens exactly
/// once per call. A processor signals failure either by returning `Err` (the
/// engine moves the error into the exchange's exception slot) or by setting the
/// exception itself. Producers that talk to external systems implement this
/// same trait, so "send to a remote system" and "transform the body" compose
/// identically.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process the exchange.
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()>;

    /// Short label used in logs and error messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Shared handle to a processor. Composite processors hold their children this
/// way so branches can be dispatched onto other tasks.
pub type SharedProcessor = Arc<dyn Processor>;

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (**self).process(exchange).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Computes a value from an exchange (a header, a body fragment, a key).
pub trait Expression: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the value cannot be computed from this exchange.
    fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value>;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> anyhow::Result<Value> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        self(exchange)
    }
}

/// Boolean test over an exchange.
pub trait Predicate: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the predicate cannot be evaluated against this exchange.
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool>;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        Ok(self(exchange))
    }
}

/// Combines two exchanges into one. Used to recombine fan-out branches and to
/// build correlation groups.
///
/// Implementations are not required to be thread-safe with respect to
/// concurrent `aggregate` calls: the engine serializes them.
pub trait AggregationStrategy: Send + Sync {
    /// Folds `new` into `old`. `old` is `None` for the first exchange; the
    /// conventional answer is to return `new` unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchanges cannot be combined.
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange>;

    /// Called when a fan-out branch is abandoned after timing out.
    fn on_timeout(&self, _index: usize, _total: usize, _timeout: Duration) {}

    /// Called once with the final result before it is merged back.
    fn on_completion(&self, _result: &mut Exchange) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Processor for Upper {
        async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
            let text = exchange.body().to_text().to_uppercase();
            exchange.set_body(text);
            Ok(())
        }

        fn name(&self) -> &str {
            "upper"
        }
    }

    #[test]
    fn closures_are_predicates_and_expressions() {
        let exchange = Exchange::with_body("abc");
        let pred = |ex: &Exchange| ex.body().as_str() == Some("abc");
        assert!(pred.matches(&exchange).unwrap());

        let expr =
            |ex: &Exchange| -> anyhow::Result<Value> { Ok(Value::from(ex.body().length().unwrap_or(0))) };
        assert_eq!(expr.evaluate(&exchange).unwrap(), Value::Int(3));
    }

    #[test]
    fn shared_processor_delegates_name() {
        let shared: SharedProcessor = Arc::new(Upper);
        assert_eq!(shared.name(), "upper");
        let wrapped = Arc::new(shared);
        assert_eq!(wrapped.name(), "upper");
    }

    #[test]
    fn default_name_is_type_name() {
        struct Nameless;
        #[async_trait]
        impl Processor for Nameless {
            async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
                Ok(())
            }
        }
        assert!(Nameless.name().ends_with("Nameless"));
    }
}
