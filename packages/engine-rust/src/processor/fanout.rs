//! Fan-out engine shared by [`Multicast`](super::Multicast) and
//! [`Splitter`](super::Splitter).
//!
//! Branches run on copies of the original exchange. Completed branches are
//! folded into one result by a single owner (the coordinating task), so the
//! aggregation strategy is never called concurrently:
//!
//! - sequential mode folds in declaration order;
//! - parallel mode runs branches on the [`WorkerPool`] and folds in
//!   completion order, which is not necessarily declaration order.
//!
//! Each branch has a slot that is settled at most once. A branch that misses
//! its timeout is abandoned; if it completes later, its result is discarded.
//! Parallel branch tasks still running when the fan-out finishes (abandoned,
//! or skipped by `stop_on_exception`) are aborted so they release their pool
//! permits.

use std::ops::ControlFlow;
use std::time::Duration;

use switchyard_core::aggregation::fold;
use switchyard_core::{AggregationStrategy, Exchange, ExchangeError, ProcessingError, SharedProcessor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::completion::invoke;
use crate::pool::WorkerPool;

/// One unit of fan-out work.
pub(crate) struct Branch {
    pub index: usize,
    pub exchange: Exchange,
    pub processor: SharedProcessor,
    /// Runs on the branch copy before `processor`; a failure skips it.
    pub prepare: Option<SharedProcessor>,
}

/// Execution options common to multicast and splitter.
#[derive(Debug, Clone, Default)]
pub struct FanOutOptions {
    /// Runs branches on this pool when set; sequentially otherwise.
    pub parallel: Option<WorkerPool>,
    /// Stops at the first failed branch and fails the original exchange with
    /// [`ProcessingError::BranchFailed`].
    pub stop_on_exception: bool,
    /// Per-branch timeout. Parallel branches are measured from fan-out start.
    pub timeout: Option<Duration>,
}

impl FanOutOptions {
    /// Runs `branches` and merges the outcome into `original`.
    ///
    /// With `strategy` set, successful branch results are folded and the
    /// result is copied into `original`. Without it, `original` keeps its
    /// messages. Either way, a failed branch fails `original` (with the last
    /// failure in fold order when `stop_on_exception` is off).
    pub(crate) async fn run(
        &self,
        construct: &'static str,
        branches: Vec<Branch>,
        strategy: Option<&dyn AggregationStrategy>,
        original: &mut Exchange,
    ) {
        let mut state = FoldState::new(construct, branches.len(), strategy, self.stop_on_exception);
        match &self.parallel {
            Some(pool) => self.run_parallel(pool, branches, &mut state).await,
            None => self.run_sequential(branches, &mut state).await,
        }
        state.finish(original);
    }

    async fn run_sequential(&self, branches: Vec<Branch>, state: &mut FoldState<'_>) {
        for branch in branches {
            let index = branch.index;
            let completed = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, run_branch(branch)).await.ok(),
                None => Some(run_branch(branch).await),
            };
            let flow = match completed {
                Some(exchange) => state.offer(index, exchange),
                None => {
                    state.abandon(index, self.timeout.unwrap_or_default());
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
    }

    async fn run_parallel(&self, pool: &WorkerPool, branches: Vec<Branch>, state: &mut FoldState<'_>) {
        let construct = state.construct;
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Exchange)>();
        let mut tasks = BranchTasks::default();
        for branch in branches {
            let tx = tx.clone();
            tasks.0.push(pool.spawn(async move {
                let index = branch.index;
                let exchange = run_branch(branch).await;
                if tx.send((index, exchange)).is_err() {
                    debug!(construct, index, "discarding branch completion after fan-out finished");
                }
            }));
        }
        drop(tx);

        let deadline = self.timeout.map(|limit| Instant::now() + limit);
        while state.has_pending() {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        state.abandon_pending(self.timeout.unwrap_or_default());
                        break;
                    }
                },
                None => rx.recv().await,
            };
            let Some((index, exchange)) = received else {
                // Every sender is gone but slots are still pending: a branch
                // task died without reporting back.
                state.fail_pending();
                break;
            };
            if state.offer(index, exchange).is_break() {
                break;
            }
        }
    }
}

async fn run_branch(branch: Branch) -> Exchange {
    let Branch {
        mut exchange,
        processor,
        prepare,
        ..
    } = branch;
    if let Some(prepare) = prepare {
        invoke(&*prepare, &mut exchange).await;
        if exchange.is_failed() {
            return exchange;
        }
    }
    invoke(&*processor, &mut exchange).await;
    exchange
}

/// Handles of spawned parallel branches. Dropping it aborts whatever is still
/// running, including when the fan-out future itself is cancelled.
#[derive(Default)]
struct BranchTasks(Vec<JoinHandle<()>>);

impl Drop for BranchTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// FoldState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Completed,
    Abandoned,
}

struct FoldState<'s> {
    construct: &'static str,
    strategy: Option<&'s dyn AggregationStrategy>,
    stop_on_exception: bool,
    slots: Vec<Slot>,
    result: Option<Exchange>,
    last_failure: Option<ExchangeError>,
    halted: Option<ExchangeError>,
}

impl<'s> FoldState<'s> {
    fn new(
        construct: &'static str,
        total: usize,
        strategy: Option<&'s dyn AggregationStrategy>,
        stop_on_exception: bool,
    ) -> Self {
        Self {
            construct,
            strategy,
            stop_on_exception,
            slots: vec![Slot::Pending; total],
            result: None,
            last_failure: None,
            halted: None,
        }
    }

    fn has_pending(&self) -> bool {
        self.slots.contains(&Slot::Pending)
    }

    /// Accepts a completed branch. Completions for settled slots are ignored.
    fn offer(&mut self, index: usize, exchange: Exchange) -> ControlFlow<()> {
        if self.slots.get(index) != Some(&Slot::Pending) {
            debug!(construct = self.construct, index, "ignoring completion for settled branch");
            return ControlFlow::Continue(());
        }
        self.slots[index] = Slot::Completed;

        if let Some(err) = exchange.exception().cloned() {
            if self.stop_on_exception {
                warn!(construct = self.construct, index, error = %err, "branch failed, stopping");
                self.halted = Some(
                    ProcessingError::BranchFailed {
                        construct: self.construct,
                        index,
                        source: err,
                    }
                    .into(),
                );
                return ControlFlow::Break(());
            }
            debug!(construct = self.construct, index, error = %err, "branch failed");
            self.last_failure = Some(err);
            return ControlFlow::Continue(());
        }

        let Some(strategy) = self.strategy else {
            return ControlFlow::Continue(());
        };
        match fold(strategy, self.result.take(), exchange) {
            Ok(folded) => {
                self.result = Some(folded);
                ControlFlow::Continue(())
            }
            Err(err) => {
                warn!(construct = self.construct, index, error = %err, "aggregation failed");
                self.halted = Some(err.into());
                ControlFlow::Break(())
            }
        }
    }

    fn abandon(&mut self, index: usize, timeout: Duration) {
        let total = self.slots.len();
        if let Some(slot) = self.slots.get_mut(index) {
            if *slot == Slot::Pending {
                *slot = Slot::Abandoned;
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                warn!(construct = self.construct, index, timeout_ms, "branch timed out");
                if let Some(strategy) = self.strategy {
                    strategy.on_timeout(index, total, timeout);
                }
            }
        }
    }

    fn abandon_pending(&mut self, timeout: Duration) {
        for index in 0..self.slots.len() {
            self.abandon(index, timeout);
        }
    }

    fn fail_pending(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index] == Slot::Pending {
                self.slots[index] = Slot::Abandoned;
                self.last_failure = Some(
                    ProcessingError::CompletionDropped {
                        processor: format!("{} branch {index}", self.construct),
                    }
                    .into(),
                );
            }
        }
    }

    fn finish(self, original: &mut Exchange) {
        if let Some(err) = self.halted {
            original.set_exception(err);
            return;
        }
        if let (Some(mut result), Some(strategy)) = (self.result, self.strategy) {
            strategy.on_completion(&mut result);
            original.copy_results_from(result);
        }
        if let Some(err) = self.last_failure {
            original.set_exception(err);
        }
    }
}
