//! Multicast: the same exchange through several independent branches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::aggregation::{SharedStrategy, UseLatest};
use switchyard_core::{keys, AggregationStrategy, Exchange, Processor, SharedProcessor};

use super::fanout::{Branch, FanOutOptions};
use crate::pool::WorkerPool;

/// Sends a copy of the exchange to every branch and folds the branch results
/// back into it. Without a strategy the latest result wins.
pub struct Multicast {
    branches: Vec<SharedProcessor>,
    strategy: Option<SharedStrategy>,
    prepare: Option<SharedProcessor>,
    options: FanOutOptions,
}

impl Multicast {
    #[must_use]
    pub fn new(branches: Vec<SharedProcessor>) -> Self {
        Self {
            branches,
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

    /// Runs branches concurrently on `pool`. Results are folded in completion
    /// order.
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

    /// Runs `prepare` on each branch copy before the branch itself, e.g. to
    /// give every branch its own deep copy of a shared body.
    #[must_use]
    pub fn on_prepare(mut self, prepare: impl Processor + 'static) -> Self {
        self.prepare = Some(Arc::new(prepare));
        self
    }
}

#[async_trait]
impl Processor for Multicast {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let total = self.branches.len();
        let branches = self
            .branches
            .iter()
            .enumerate()
            .map(|(index, processor)| {
                let mut copy = exchange.copy();
                copy.set_property(keys::MULTICAST_INDEX, index);
                copy.set_property(keys::MULTICAST_COMPLETE, index + 1 == total);
                Branch {
                    index,
                    exchange: copy,
                    processor: Arc::clone(processor),
                    prepare: self.prepare.clone(),
                }
            })
            .collect();
        let strategy: &dyn AggregationStrategy = self.strategy.as_deref().unwrap_or(&UseLatest);
        self.options
            .run("multicast", branches, Some(strategy), exchange)
            .await;
        Ok(())
    }

    fn name(&self) -> &str {
        "multicast"
    }
}
