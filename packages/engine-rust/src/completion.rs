//! The completion protocol.
//!
//! Every processor call resolves exactly once: completion is the resolution of
//! the processor's future. This module holds the pieces built on top of that:
//!
//! - [`invoke`]: the one place a processor's returned error or panic is turned
//!   into the exchange's exception slot.
//! - [`Completion`] and [`CallbackProcessor`]: callback-style producers that
//!   signal completion from another task. `Completion` is consumed when used,
//!   so it cannot fire twice; dropping it unused is detected.
//! - [`AsyncDispatcher`]: `process_async` with synchronous fast-path detection.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::task::noop_waker_ref;
use futures_util::FutureExt;
use switchyard_core::{Exchange, ProcessingError, Processor, SharedProcessor};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::pool::WorkerPool;

// ---------------------------------------------------------------------------
// invoke
// ---------------------------------------------------------------------------

/// Runs `processor` against `exchange`, recording any failure on the exchange.
///
/// An `Err` return becomes the exchange's exception. A panic is caught and
/// recorded as [`ProcessingError::Panicked`], so a misbehaving step cannot
/// take down the route or skip error handling.
pub async fn invoke(processor: &dyn Processor, exchange: &mut Exchange) {
    let outcome = AssertUnwindSafe(processor.process(exchange))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => exchange.set_exception(err),
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!(
                processor = processor.name(),
                exchange_id = exchange.id(),
                %message,
                "processor panicked"
            );
            exchange.set_exception(ProcessingError::Panicked {
                processor: processor.name().to_string(),
                message,
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Completion / CallbackProcessor
// ---------------------------------------------------------------------------

/// Single-use completion signal handed to a [`CallbackProcessor`].
///
/// `complete` takes `self`, so a processor cannot signal twice. Dropping the
/// signal without completing fails the exchange with
/// [`ProcessingError::CompletionDropped`].
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Exchange>,
}

impl Completion {
    fn channel() -> (Self, oneshot::Receiver<Exchange>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Hands the exchange back to the engine.
    pub fn complete(self, exchange: Exchange) {
        if self.tx.send(exchange).is_err() {
            // The waiting side was cancelled, e.g. by a fan-out timeout.
            debug!("completion signalled after the caller stopped waiting");
        }
    }
}

/// Producer contract for callback-style integrations.
///
/// The processor takes ownership of the exchange and must pass it to
/// `done.complete` exactly once, either before returning (and then return
/// `true`) or later from another task (and return `false`).
pub trait CallbackProcessor: Send + Sync + 'static {
    fn process(&self, exchange: Exchange, done: Completion) -> bool;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapts a [`CallbackProcessor`] to the [`Processor`] trait.
#[derive(Debug)]
pub struct Callback<P>(pub P);

#[async_trait]
impl<P: CallbackProcessor> Processor for Callback<P> {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let (done, mut rx) = Completion::channel();
        let handed_off = std::mem::take(exchange);
        let fallback = handed_off.clone();

        let completed_sync = self.0.process(handed_off, done);
        let returned = if completed_sync {
            match rx.try_recv() {
                Ok(result) => Ok(result),
                Err(oneshot::error::TryRecvError::Empty) => {
                    warn!(
                        processor = self.0.name(),
                        "processor reported synchronous completion without completing"
                    );
                    rx.await
                }
                Err(oneshot::error::TryRecvError::Closed) => rx.await,
            }
        } else {
            rx.await
        };

        match returned {
            Ok(result) => {
                *exchange = result;
                Ok(())
            }
            Err(_) => {
                *exchange = fallback;
                Err(ProcessingError::CompletionDropped {
                    processor: self.0.name().to_string(),
                }
                .into())
            }
        }
    }

    fn name(&self) -> &str {
        self.0.name()
    }
}

// ---------------------------------------------------------------------------
// AsyncDispatcher
// ---------------------------------------------------------------------------

/// Entry point for callers that want callback-style completion.
#[derive(Debug, Clone)]
pub struct AsyncDispatcher {
    pool: WorkerPool,
}

impl AsyncDispatcher {
    #[must_use]
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    /// Processes `exchange` and calls `callback` exactly once with the result.
    ///
    /// The processor is polled once on the calling thread. If it finishes
    /// without suspending, `callback` runs inline with `done_sync = true` and
    /// this returns `true`. Otherwise the remaining work continues on the
    /// worker pool, `callback` later runs there with `done_sync = false`, and
    /// this returns `false` immediately.
    pub fn process_async<F>(&self, processor: SharedProcessor, exchange: Exchange, callback: F) -> bool
    where
        F: FnOnce(Exchange, bool) + Send + 'static,
    {
        let mut task = Box::pin(run(processor, exchange));
        let _runtime = self.pool.handle().enter();
        let mut cx = Context::from_waker(noop_waker_ref());
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(exchange) => {
                callback(exchange, true);
                true
            }
            Poll::Pending => {
                self.pool.spawn(async move {
                    let exchange = task.await;
                    callback(exchange, false);
                });
                false
            }
        }
    }

    /// Processes `exchange` to completion, blocking the calling thread.
    ///
    /// Must be called from outside the runtime, like any blocking bridge.
    #[must_use]
    pub fn process_blocking(&self, processor: &SharedProcessor, exchange: Exchange) -> Exchange {
        self.pool.handle().block_on(run(SharedProcessor::clone(processor), exchange))
    }
}

async fn run(processor: SharedProcessor, mut exchange: Exchange) -> Exchange {
    invoke(&*processor, &mut exchange).await;
    exchange
}

/// Polls `fut` once with a no-op waker. Test helper for "did it finish
/// without suspending" checks.
#[cfg(test)]
pub(crate) fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let mut fut = std::pin::pin!(fut);
    fut.as_mut().poll(&mut Context::from_waker(noop_waker_ref()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use switchyard_core::{ErrorFilter, Value};

    use super::*;

    struct Fails;

    #[async_trait]
    impl Processor for Fails {
        async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
            anyhow::bail!("backend unavailable")
        }
    }

    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
            panic!("step exploded")
        }

        fn name(&self) -> &str {
            "panics"
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl Processor for Sleeps {
        async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            exchange.set_body("slept");
            Ok(())
        }
    }

    struct Upper;

    #[async_trait]
    impl Processor for Upper {
        async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
            let text = exchange.body().to_text().to_uppercase();
            exchange.set_body(text);
            Ok(())
        }
    }

    #[tokio::test]
    async fn invoke_records_returned_error() {
        let mut exchange = Exchange::with_body(1);
        invoke(&Fails, &mut exchange).await;
        assert_eq!(exchange.exception().unwrap().to_string(), "backend unavailable");
    }

    #[tokio::test]
    async fn invoke_converts_panic() {
        let mut exchange = Exchange::with_body(1);
        invoke(&Panics, &mut exchange).await;
        let err = exchange.exception().unwrap();
        assert!(ErrorFilter::of::<ProcessingError>().matches(err));
        assert!(err.to_string().contains("step exploded"));
    }

    /// Completes inline and reports it.
    struct SyncProducer;

    impl CallbackProcessor for SyncProducer {
        fn process(&self, mut exchange: Exchange, done: Completion) -> bool {
            exchange.set_header("handled-by", "sync");
            done.complete(exchange);
            true
        }
    }

    /// Completes later from a spawned task.
    struct DeferredProducer;

    impl CallbackProcessor for DeferredProducer {
        fn process(&self, mut exchange: Exchange, done: Completion) -> bool {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                exchange.set_header("handled-by", "deferred");
                done.complete(exchange);
            });
            false
        }
    }

    /// Loses its completion.
    struct ForgetfulProducer;

    impl CallbackProcessor for ForgetfulProducer {
        fn process(&self, _exchange: Exchange, _done: Completion) -> bool {
            false
        }

        fn name(&self) -> &str {
            "forgetful"
        }
    }

    #[tokio::test]
    async fn callback_adapter_sync_and_deferred() {
        let mut exchange = Exchange::with_body(1);
        invoke(&Callback(SyncProducer), &mut exchange).await;
        assert_eq!(exchange.header("handled-by"), Some(&Value::from("sync")));

        let id = exchange.id().to_string();
        invoke(&Callback(DeferredProducer), &mut exchange).await;
        assert_eq!(exchange.header("handled-by"), Some(&Value::from("deferred")));
        assert_eq!(exchange.id(), id);
    }

    #[tokio::test]
    async fn dropped_completion_fails_exchange() {
        let mut exchange = Exchange::with_body("keep me");
        let id = exchange.id().to_string();
        invoke(&Callback(ForgetfulProducer), &mut exchange).await;
        assert_eq!(exchange.id(), id);
        assert_eq!(exchange.body(), &Value::from("keep me"));
        assert!(ErrorFilter::when(|e: &ProcessingError| {
            matches!(e, ProcessingError::CompletionDropped { .. })
        })
        .matches(exchange.exception().unwrap()));
    }

    #[tokio::test]
    async fn process_async_completes_inline_when_possible() {
        let dispatcher = AsyncDispatcher::new(WorkerPool::current(4).unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let done_sync = dispatcher.process_async(Arc::new(Upper), Exchange::with_body("a"), move |ex, sync| {
            assert!(sync);
            assert_eq!(ex.body(), &Value::from("A"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(done_sync);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn process_async_continues_on_pool_exactly_once() {
        let dispatcher = AsyncDispatcher::new(WorkerPool::current(4).unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, rx) = oneshot::channel();
        let seen = Arc::clone(&calls);

        let done_sync = dispatcher.process_async(
            Arc::new(Sleeps(Duration::from_millis(20))),
            Exchange::with_body("a"),
            move |ex, sync| {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((ex, sync));
            },
        );

        assert!(!done_sync);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let (exchange, sync) = rx.await.unwrap();
        assert!(!sync);
        assert_eq!(exchange.body(), &Value::from("slept"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    type Delivered = oneshot::Receiver<Exchange>;

    /// Dispatches `processor` and counts callback invocations.
    fn dispatch_counted(processor: SharedProcessor, exchange: Exchange) -> (bool, Arc<AtomicU32>, Delivered) {
        let dispatcher = AsyncDispatcher::new(WorkerPool::current(4).unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let (tx, rx) = oneshot::channel();
        let done_sync = dispatcher.process_async(processor, exchange, move |ex, sync| {
            assert!(!sync);
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(ex);
        });
        (done_sync, calls, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn process_async_pipeline_with_delay_completes_once() {
        use crate::processor::transform::{Delay, SetHeader};
        use crate::processor::Pipeline;
        use switchyard_core::expression::constant;

        let pipeline: SharedProcessor = Arc::new(Pipeline::new(vec![
            Arc::new(SetHeader::new("before", constant(true))),
            Arc::new(Delay(Duration::from_millis(10))),
            Arc::new(SetHeader::new("after", constant(true))),
        ]));
        let (done_sync, calls, rx) = dispatch_counted(pipeline, Exchange::with_body("a"));

        assert!(!done_sync);
        let exchange = rx.await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(exchange.header("after"), Some(&Value::from(true)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn process_async_parallel_multicast_with_timeout_completes_once() {
        use crate::processor::transform::{Delay, SetBody};
        use crate::processor::{Multicast, Pipeline};
        use switchyard_core::expression::constant;

        let fast: SharedProcessor = Arc::new(Pipeline::new(vec![
            Arc::new(Delay(Duration::from_millis(5))),
            Arc::new(SetBody::new(constant("fast"))),
        ]));
        let slow: SharedProcessor = Arc::new(Pipeline::new(vec![
            Arc::new(Delay(Duration::from_secs(5))),
            Arc::new(SetBody::new(constant("slow"))),
        ]));
        let multicast: SharedProcessor = Arc::new(
            Multicast::new(vec![fast, slow])
                .parallel(WorkerPool::current(2).unwrap())
                .timeout(Duration::from_millis(50)),
        );
        let (done_sync, calls, rx) = dispatch_counted(multicast, Exchange::with_body("a"));

        assert!(!done_sync);
        let exchange = rx.await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(exchange.body(), &Value::from("fast"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn process_async_try_catch_finally_completes_once() {
        use crate::processor::transform::{raise_error, Delay, SetHeader};
        use crate::processor::{CatchClause, Pipeline, TryCatchFinally};
        use switchyard_core::expression::constant;

        let delayed = |step: SharedProcessor| -> Pipeline {
            Pipeline::new(vec![Arc::new(Delay(Duration::from_millis(10))), step])
        };
        let guarded = TryCatchFinally::builder(delayed(Arc::new(raise_error("boom"))))
            .catch(CatchClause::any(delayed(Arc::new(SetHeader::new("caught", constant(true))))))
            .finally(delayed(Arc::new(SetHeader::new("finally", constant(true)))))
            .build()
            .unwrap();
        let (done_sync, calls, rx) = dispatch_counted(Arc::new(guarded), Exchange::with_body("a"));

        assert!(!done_sync);
        let exchange = rx.await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(exchange.header("caught"), Some(&Value::from(true)));
        assert_eq!(exchange.header("finally"), Some(&Value::from(true)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn process_blocking_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let pool = WorkerPool::new(runtime.handle().clone(), 2).unwrap();
        let dispatcher = AsyncDispatcher::new(pool);
        let processor: SharedProcessor = Arc::new(Upper);
        let exchange = dispatcher.process_blocking(&processor, Exchange::with_body("x"));
        assert_eq!(exchange.body(), &Value::from("X"));
    }

    #[test]
    fn poll_once_reports_pending() {
        assert!(poll_once(async { 1 }).is_ready());
        assert!(poll_once(std::future::pending::<()>()).is_pending());
    }
}
