//! Correlation aggregator: collects related exchanges into groups and emits
//! each group once it is complete.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::aggregation::{fold, SharedStrategy};
use switchyard_core::{
    keys, AggregationStrategy, Exchange, Expression, Predicate, ProcessingError, Processor,
    SharedExpression, SharedPredicate, SharedProcessor, Value,
};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::completion::invoke;
use crate::error::ConfigError;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Why a group was emitted. Recorded on the aggregated exchange under
/// [`keys::AGGREGATED_COMPLETED_BY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedBy {
    Size,
    Predicate,
    Timeout,
    Interval,
    Force,
}

impl CompletedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Predicate => "predicate",
            Self::Timeout => "timeout",
            Self::Interval => "interval",
            Self::Force => "force",
        }
    }
}

impl fmt::Display for CompletedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Group {
    exchange: Exchange,
    size: usize,
    last_update: Instant,
}

/// Keys of completed groups. With a non-zero capacity the oldest closed key
/// is reopened once the capacity is exceeded.
struct ClosedKeys {
    capacity: usize,
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl ClosedKeys {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn close(&mut self, key: &str) {
        if !self.keys.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        if self.capacity > 0 && self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }
}

struct Groups {
    open: HashMap<String, Group>,
    closed: Option<ClosedKeys>,
}

impl Groups {
    fn is_closed(&self, key: &str) -> bool {
        self.closed.as_ref().is_some_and(|closed| closed.keys.contains(key))
    }

    fn close(&mut self, key: &str) {
        if let Some(closed) = &mut self.closed {
            closed.close(key);
        }
    }

    fn take(&mut self, key: &str) -> Option<Group> {
        let group = self.open.remove(key)?;
        self.close(key);
        Some(group)
    }

    fn take_all(&mut self) -> Vec<(String, Group)> {
        let drained: Vec<(String, Group)> = self.open.drain().collect();
        for (key, _) in &drained {
            self.close(key);
        }
        drained
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Groups incoming exchanges by a correlation key and folds each group with
/// an aggregation strategy.
///
/// Incoming exchanges pass through unchanged. A completed group is sent to
/// the output processor as a new exchange. When completion is triggered by an
/// incoming exchange, a failure in the output processor is recorded on that
/// exchange; groups completed by the timeout sweep or by
/// [`force_complete`](Aggregator::force_complete) have no caller, so their
/// failures are logged.
///
/// All strategy calls happen under the group lock, so strategies never run
/// concurrently for the same aggregator.
pub struct Aggregator {
    correlation: SharedExpression,
    strategy: SharedStrategy,
    output: SharedProcessor,
    completion_size: Option<usize>,
    completion_predicate: Option<SharedPredicate>,
    completion_timeout: Option<Duration>,
    completion_interval: Option<Duration>,
    force_completion_on_stop: bool,
    discard_on_completion_timeout: bool,
    ignore_invalid_correlation_keys: bool,
    interval_started: Mutex<Instant>,
    groups: Mutex<Groups>,
}

impl Aggregator {
    pub fn builder(
        correlation: impl Expression + 'static,
        strategy: impl AggregationStrategy + 'static,
        output: impl Processor + 'static,
    ) -> AggregatorBuilder {
        AggregatorBuilder {
            correlation: Arc::new(correlation),
            strategy: Arc::new(strategy),
            output: Arc::new(output),
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            completion_interval: None,
            force_completion_on_stop: false,
            discard_on_completion_timeout: false,
            ignore_invalid_correlation_keys: false,
            close_correlation_key_on_completion: None,
        }
    }

    /// Number of groups still waiting for completion.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.groups.lock().open.len()
    }

    /// Completes every group whose last update is older than the completion
    /// timeout. Returns how many were completed, discarded ones included.
    pub async fn sweep_timeouts(&self) -> usize {
        let Some(timeout) = self.completion_timeout else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<(String, Group)> = {
            let mut groups = self.groups.lock();
            let stale: Vec<String> = groups
                .open
                .iter()
                .filter(|(_, group)| now.duration_since(group.last_update) >= timeout)
                .map(|(key, _)| key.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|key| groups.take(&key).map(|group| (key, group)))
                .collect()
        };
        let count = expired.len();
        for (key, group) in expired {
            if self.discard_on_completion_timeout {
                debug!(correlation_key = %key, size = group.size, "timed-out aggregation group discarded");
                continue;
            }
            self.emit_detached(key, group, CompletedBy::Timeout).await;
        }
        count
    }

    /// Completes every pending group once a full completion interval has
    /// passed since the previous interval completion. Returns how many were
    /// emitted.
    pub async fn sweep_interval(&self) -> usize {
        let Some(interval) = self.completion_interval else {
            return 0;
        };
        let now = Instant::now();
        let due = {
            let mut started = self.interval_started.lock();
            if now.duration_since(*started) < interval {
                return 0;
            }
            *started = now;
            self.groups.lock().take_all()
        };
        let count = due.len();
        for (key, group) in due {
            self.emit_detached(key, group, CompletedBy::Interval).await;
        }
        count
    }

    /// Emits every pending group regardless of its completion conditions.
    pub async fn force_complete(&self) -> usize {
        let drained = self.groups.lock().take_all();
        let count = drained.len();
        for (key, group) in drained {
            self.emit_detached(key, group, CompletedBy::Force).await;
        }
        count
    }

    /// Starts a background worker that sweeps timed-out groups and interval
    /// completions every `interval` and accepts [`AggregatorCommand`]s.
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> BackgroundWorker<AggregationSweeper> {
        BackgroundWorker::start(AggregationSweeper(Arc::clone(self)), interval)
    }

    /// The group key for `exchange`. A null or empty key is an error unless
    /// invalid keys are ignored, in which case `None` is returned.
    fn correlation_key(&self, exchange: &Exchange) -> anyhow::Result<Option<String>> {
        let key = match self.correlation.evaluate(exchange)? {
            Value::Null => None,
            value => Some(value.to_text()).filter(|text| !text.is_empty()),
        };
        match key {
            Some(key) => Ok(Some(key)),
            None if self.ignore_invalid_correlation_keys => {
                debug!(exchange_id = exchange.id(), "invalid correlation key, exchange ignored");
                Ok(None)
            }
            None => Err(ProcessingError::InvalidCorrelationKey {
                reason: "correlation expression evaluated to null or empty".to_string(),
            }
            .into()),
        }
    }

    fn completion_for(&self, aggregated: &Exchange, size: usize) -> anyhow::Result<Option<CompletedBy>> {
        if self.completion_size.is_some_and(|limit| size >= limit) {
            return Ok(Some(CompletedBy::Size));
        }
        if let Some(predicate) = &self.completion_predicate {
            if predicate.matches(aggregated)? {
                return Ok(Some(CompletedBy::Predicate));
            }
        }
        Ok(None)
    }

    async fn emit(&self, key: String, group: Group, by: CompletedBy) -> Exchange {
        let mut aggregated = group.exchange;
        self.strategy.on_completion(&mut aggregated);
        aggregated.set_property(keys::AGGREGATED_SIZE, group.size);
        aggregated.set_property(keys::AGGREGATED_COMPLETED_BY, by.as_str());
        debug!(correlation_key = %key, size = group.size, completed_by = %by, "aggregation group complete");
        aggregated.set_property(keys::AGGREGATED_CORRELATION_KEY, key);
        invoke(&*self.output, &mut aggregated).await;
        aggregated
    }

    async fn emit_detached(&self, key: String, group: Group, by: CompletedBy) {
        let aggregated = self.emit(key, group, by).await;
        if let Some(err) = aggregated.exception() {
            error!(
                exchange_id = aggregated.id(),
                completed_by = %by,
                error = %err,
                "aggregated exchange failed with no caller to report to"
            );
        }
    }
}

#[async_trait]
impl Processor for Aggregator {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let Some(key) = self.correlation_key(exchange)? else {
            return Ok(());
        };

        let completed = {
            let mut groups = self.groups.lock();
            if groups.is_closed(&key) {
                return Err(ProcessingError::ClosedCorrelationKey { key }.into());
            }
            let (acc, size) = match groups.open.get(&key) {
                Some(group) => (Some(group.exchange.clone()), group.size + 1),
                None => (None, 1),
            };
            let aggregated = fold(&*self.strategy, acc, exchange.copy())?;
            match self.completion_for(&aggregated, size)? {
                Some(by) => {
                    groups.open.remove(&key);
                    groups.close(&key);
                    Some((aggregated, size, by))
                }
                None => {
                    groups.open.insert(
                        key.clone(),
                        Group {
                            exchange: aggregated,
                            size,
                            last_update: Instant::now(),
                        },
                    );
                    None
                }
            }
        };

        if let Some((aggregated, size, by)) = completed {
            let group = Group {
                exchange: aggregated,
                size,
                last_update: Instant::now(),
            };
            let emitted = self.emit(key, group, by).await;
            if let Some(err) = emitted.exception() {
                exchange.set_exception(err.clone());
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "aggregate"
    }
}

/// Builder for [`Aggregator`].
pub struct AggregatorBuilder {
    correlation: SharedExpression,
    strategy: SharedStrategy,
    output: SharedProcessor,
    completion_size: Option<usize>,
    completion_predicate: Option<SharedPredicate>,
    completion_timeout: Option<Duration>,
    completion_interval: Option<Duration>,
    force_completion_on_stop: bool,
    discard_on_completion_timeout: bool,
    ignore_invalid_correlation_keys: bool,
    close_correlation_key_on_completion: Option<usize>,
}

impl AggregatorBuilder {
    #[must_use]
    pub fn completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size);
        self
    }

    /// Completes a group once `predicate` holds for its aggregated exchange.
    #[must_use]
    pub fn completion_predicate(mut self, predicate: impl Predicate + 'static) -> Self {
        self.completion_predicate = Some(Arc::new(predicate));
        self
    }

    /// Completes a group that has received nothing for `timeout`. Needs a
    /// running sweeper (see [`Aggregator::start_sweeper`]).
    #[must_use]
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    /// Completes all pending groups every `interval`, whatever their size or
    /// age. Driven by the sweeper, so it fires on the first sweeper tick after
    /// the interval has elapsed.
    #[must_use]
    pub fn completion_interval(mut self, interval: Duration) -> Self {
        self.completion_interval = Some(interval);
        self
    }

    /// Drops groups completed by the timeout instead of emitting them.
    #[must_use]
    pub fn discard_on_completion_timeout(mut self, discard: bool) -> Self {
        self.discard_on_completion_timeout = discard;
        self
    }

    /// Lets exchanges with a null or empty correlation key pass through
    /// without joining a group.
    #[must_use]
    pub fn ignore_invalid_correlation_keys(mut self, ignore: bool) -> Self {
        self.ignore_invalid_correlation_keys = ignore;
        self
    }

    /// Rejects exchanges whose key belongs to an already completed group.
    /// Remembers at most `capacity` keys; zero keeps every key.
    #[must_use]
    pub fn close_correlation_key_on_completion(mut self, capacity: usize) -> Self {
        self.close_correlation_key_on_completion = Some(capacity);
        self
    }

    /// Emits pending groups when the sweeper stops.
    #[must_use]
    pub fn force_completion_on_stop(mut self, force: bool) -> Self {
        self.force_completion_on_stop = force;
        self
    }

    /// # Errors
    ///
    /// - [`ConfigError::MissingCompletion`] if no completion condition is set
    /// - [`ConfigError::ConflictingCompletion`] if both a timeout and an
    ///   interval are set
    /// - [`ConfigError::ZeroLimit`] for a zero size, timeout or interval
    pub fn build(self) -> Result<Aggregator, ConfigError> {
        if self.completion_size.is_none()
            && self.completion_predicate.is_none()
            && self.completion_timeout.is_none()
            && self.completion_interval.is_none()
        {
            return Err(ConfigError::MissingCompletion);
        }
        if self.completion_timeout.is_some() && self.completion_interval.is_some() {
            return Err(ConfigError::ConflictingCompletion);
        }
        if self.completion_size == Some(0) {
            return Err(ConfigError::ZeroLimit {
                what: "completion size",
            });
        }
        if self.completion_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroLimit {
                what: "completion timeout",
            });
        }
        if self.completion_interval == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroLimit {
                what: "completion interval",
            });
        }
        Ok(Aggregator {
            correlation: self.correlation,
            strategy: self.strategy,
            output: self.output,
            completion_size: self.completion_size,
            completion_predicate: self.completion_predicate,
            completion_timeout: self.completion_timeout,
            completion_interval: self.completion_interval,
            force_completion_on_stop: self.force_completion_on_stop,
            discard_on_completion_timeout: self.discard_on_completion_timeout,
            ignore_invalid_correlation_keys: self.ignore_invalid_correlation_keys,
            interval_started: Mutex::new(Instant::now()),
            groups: Mutex::new(Groups {
                open: HashMap::new(),
                closed: self.close_correlation_key_on_completion.map(ClosedKeys::new),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// Commands accepted by a running sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorCommand {
    ForceComplete,
}

/// Background runnable that drives an aggregator's timeouts.
pub struct AggregationSweeper(Arc<Aggregator>);

#[async_trait]
impl BackgroundRunnable for AggregationSweeper {
    type Task = AggregatorCommand;

    async fn run(&mut self, task: AggregatorCommand) {
        match task {
            AggregatorCommand::ForceComplete => {
                self.0.force_complete().await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.0.sweep_timeouts().await;
        self.0.sweep_interval().await;
    }

    async fn shutdown(&mut self) {
        if self.0.force_completion_on_stop {
            self.0.force_complete().await;
        } else if self.0.pending_groups() > 0 {
            debug!(pending = self.0.pending_groups(), "aggregation sweeper stopped with pending groups");
        }
    }
}
