//! Splitter: one exchange per item of an expression's value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::aggregation::SharedStrategy;
use switchyard_core::{
    keys, AggregationStrategy, Exchange, Expression, Processor, SharedExpression, SharedProcessor, Value,
};
use tracing::debug;

use super::fanout::{Branch, FanOutOptions};
use crate::pool::WorkerPool;

/// Evaluates an expression, runs the child once per item on a copy whose body
/// is that item, and optionally folds the parts back into the original.
///
/// An array value yields one part per element; `Null` yields no parts; any
/// other value is a single part. Without a strategy the original exchange
/// keeps its body.
pub struct Splitter {
    expression: SharedExpression,
    child: SharedProcessor,
    strategy: Option<SharedStrategy>,
    prepare: Option<SharedProcessor>,
    options: FanOutOptions,
}

impl Splitter {
    pub fn new(expression: impl Expression + 'static, child: impl Processor + 'static) -> Self {
        Self {
            expression: Arc::new(expression),
            child: Arc::new(child),
            strategy: None,
            prepare: None,
            options: FanOutOptions::default(),
        }
    }

    #[must_use]
    pub fn strategy(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    #[must_use]
    pub fn parallel(mut self, pool: WorkerPool) -> Self {
        self.options.parallel = Some(pool);
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self) -> Self {
        self.options.stop_on_exception = true;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Runs `prepare` on each part before the child processor.
    #[must_use]
    pub fn on_prepare(mut self, prepare: impl Processor + 'static) -> Self {
        self.prepare = Some(Arc::new(prepare));
        self
    }
}

fn into_parts(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

#[async_trait]
impl Processor for Splitter {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let parts = into_parts(self.expression.evaluate(exchange)?);
        let total = parts.len();
        if total == 0 {
            debug!(exchange_id = exchange.id(), "split produced no parts");
            return Ok(());
        }

        let branches = parts
            .into_iter()
            .enumerate()
            .map(|(index, part)| {
                let mut copy = exchange.copy();
                copy.take_out();
                copy.set_body(part);
                copy.set_property(keys::SPLIT_INDEX, index);
                copy.set_property(keys::SPLIT_SIZE, total);
                copy.set_property(keys::SPLIT_COMPLETE, index + 1 == total);
                Branch {
                    index,
                    exchange: copy,
                    processor: Arc::clone(&self.child),
                    prepare: self.prepare.clone(),
                }
            })
            .collect();
        self.options
            .run("splitter", branches, self.strategy.as_deref(), exchange)
            .await;
        Ok(())
    }

    fn name(&self) -> &str {
        "splitter"
    }
}
