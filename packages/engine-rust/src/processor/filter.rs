//! Message filter.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::{keys, Exchange, Predicate, Processor, SharedPredicate, SharedProcessor};
use tracing::debug;

use crate::completion::invoke;

/// Runs the child only when the predicate holds. A rejected exchange completes
/// immediately, unchanged apart from the filter-matched property.
pub struct Filter {
    predicate: SharedPredicate,
    child: SharedProcessor,
}

impl Filter {
    pub fn new(predicate: impl Predicate + 'static, child: impl Processor + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
            child: Arc::new(child),
        }
    }
}

#[async_trait]
impl Processor for Filter {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let matched = self.predicate.matches(exchange)?;
        exchange.set_property(keys::FILTER_MATCHED, matched);
        if matched {
            invoke(&*self.child, exchange).await;
        } else {
            debug!(exchange_id = exchange.id(), "filter rejected exchange");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "filter"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use switchyard_core::expression::body_contains;
    use switchyard_core::Value;

    use super::*;
    use crate::processor::transform::from_fn;

    fn counting(counter: &Arc<AtomicU32>) -> impl Processor {
        let counter = Arc::clone(counter);
        from_fn("count", move |ex: &mut Exchange| {
            counter.fetch_add(1, Ordering::SeqCst);
            ex.set_body("changed");
            Ok(())
        })
    }

    #[tokio::test]
    async fn false_predicate_skips_child_and_leaves_exchange() {
        let calls = Arc::new(AtomicU32::new(0));
        let filter = Filter::new(|_: &Exchange| false, counting(&calls));

        let mut exchange = Exchange::with_body("original");
        exchange.set_header("h", 1);
        invoke(&filter, &mut exchange).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(exchange.body(), &Value::from("original"));
        assert_eq!(exchange.header("h"), Some(&Value::Int(1)));
        assert_eq!(exchange.in_message().headers().len(), 1);
        assert!(!exchange.is_failed());
        assert_eq!(exchange.property(keys::FILTER_MATCHED), Some(&Value::Bool(false)));
    }

    #[tokio::test]
    async fn true_predicate_runs_child() {
        let calls = Arc::new(AtomicU32::new(0));
        let filter = Filter::new(body_contains("urgent"), counting(&calls));

        let mut exchange = Exchange::with_body("urgent: reboot");
        invoke(&filter, &mut exchange).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.body(), &Value::from("changed"));
        assert!(exchange.property_flag(keys::FILTER_MATCHED));
    }
}
