//! Try/catch/finally scopes.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::error::matches_any;
use switchyard_core::{
    ErrorFilter, Exchange, ExchangeError, Predicate, Processor, SharedPredicate, SharedProcessor,
};
use tracing::{debug, warn};

use crate::completion::invoke;
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// CatchClause
// ---------------------------------------------------------------------------

/// Handles failures matching any of its filters.
///
/// A clause is `handled` by default: the failure is cleared before the catch
/// processor runs and stays cleared. With `handled(false)` the original
/// failure is restored afterwards unless the catch processor raised its own.
pub struct CatchClause {
    filters: Vec<ErrorFilter>,
    on_when: Option<SharedPredicate>,
    processor: SharedProcessor,
    handled: bool,
}

impl CatchClause {
    pub fn new(filters: Vec<ErrorFilter>, processor: impl Processor + 'static) -> Self {
        Self {
            filters,
            on_when: None,
            processor: Arc::new(processor),
            handled: true,
        }
    }

    /// Catches failures with an `E` in their cause chain.
    pub fn of<E>(processor: impl Processor + 'static) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(vec![ErrorFilter::of::<E>()], processor)
    }

    /// Catches every failure.
    pub fn any(processor: impl Processor + 'static) -> Self {
        Self::new(vec![ErrorFilter::any()], processor)
    }

    /// Additionally requires `predicate` to hold for the failed exchange.
    #[must_use]
    pub fn on_when(mut self, predicate: impl Predicate + 'static) -> Self {
        self.on_when = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    fn matches(&self, err: &ExchangeError, exchange: &Exchange) -> bool {
        if !matches_any(&self.filters, err) {
            return false;
        }
        match &self.on_when {
            None => true,
            Some(predicate) => predicate.matches(exchange).unwrap_or_else(|eval_err| {
                warn!(error = %eval_err, "catch clause predicate failed, skipping clause");
                false
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// TryCatchFinally
// ---------------------------------------------------------------------------

/// Runs a body, hands a failure to the first matching catch clause in
/// declaration order, and always runs the finally processor exactly once.
///
/// A failure still pending when the finally processor runs is set aside
/// while it runs and restored afterwards, unless the finally processor
/// failed itself (the newer failure wins).
pub struct TryCatchFinally {
    body: SharedProcessor,
    catches: Vec<CatchClause>,
    finally: Option<SharedProcessor>,
}

impl TryCatchFinally {
    pub fn builder(body: impl Processor + 'static) -> TryBuilder {
        TryBuilder {
            body: Arc::new(body),
            catches: Vec::new(),
            finally: None,
            duplicate_finally: false,
        }
    }

    async fn run_catch(&self, exchange: &mut Exchange) {
        let Some(err) = exchange.exception().cloned() else {
            return;
        };
        let Some((index, clause)) = self
            .catches
            .iter()
            .enumerate()
            .find(|(_, clause)| clause.matches(&err, exchange))
        else {
            debug!(exchange_id = exchange.id(), error = %err, "no catch clause matched");
            return;
        };

        debug!(exchange_id = exchange.id(), clause = index, error = %err, "catch clause matched");
        exchange.clear_exception();
        exchange.set_exception_caught(err.clone());
        invoke(&*clause.processor, exchange).await;
        if !clause.handled && !exchange.is_failed() {
            exchange.set_exception(err);
        }
    }
}

#[async_trait]
impl Processor for TryCatchFinally {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        invoke(&*self.body, exchange).await;
        self.run_catch(exchange).await;

        if let Some(finally) = &self.finally {
            let pending = exchange.take_exception();
            invoke(&**finally, exchange).await;
            if let Some(pending) = pending {
                if !exchange.is_failed() {
                    exchange.set_exception(pending);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "try"
    }
}

/// Builder for [`TryCatchFinally`]. Wiring mistakes surface from
/// [`build`](TryBuilder::build).
pub struct TryBuilder {
    body: SharedProcessor,
    catches: Vec<CatchClause>,
    finally: Option<SharedProcessor>,
    duplicate_finally: bool,
}

impl TryBuilder {
    #[must_use]
    pub fn catch(mut self, clause: CatchClause) -> Self {
        self.catches.push(clause);
        self
    }

    /// Sets the finally processor. Declaring a second one makes
    /// [`build`](Self::build) fail.
    #[must_use]
    pub fn finally(mut self, processor: impl Processor + 'static) -> Self {
        if self.finally.is_some() {
            self.duplicate_finally = true;
        }
        self.finally = Some(Arc::new(processor));
        self
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateFinally`] if more than one finally was
    /// declared, or [`ConfigError::EmptyTry`] if there is neither a catch nor
    /// a finally.
    pub fn build(self) -> Result<TryCatchFinally, ConfigError> {
        if self.duplicate_finally {
            return Err(ConfigError::DuplicateFinally);
        }
        if self.catches.is_empty() && self.finally.is_none() {
            return Err(ConfigError::EmptyTry);
        }
        Ok(TryCatchFinally {
            body: self.body,
            catches: self.catches,
            finally: self.finally,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;
    use switchyard_core::{keys, Value};

    use super::*;
    use crate::processor::transform::{from_fn, raise_error, RaiseError};

    #[derive(Debug, thiserror::Error)]
    #[error("timed out")]
    struct TimeoutError;

    #[derive(Debug, thiserror::Error)]
    #[error("io failure")]
    struct IoError;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn mark(label: &'static str, log: &Log) -> impl Processor {
        let log = Arc::clone(log);
        from_fn(label, move |_: &mut Exchange| {
            log.lock().push(label);
            Ok(())
        })
    }

    fn counter(count: &Arc<AtomicU32>) -> impl Processor {
        let count = Arc::clone(count);
        from_fn("finally", move |_: &mut Exchange| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn timeout_body() -> RaiseError {
        RaiseError::new(|_: &Exchange| TimeoutError.into())
    }

    #[tokio::test]
    async fn most_specific_declared_clause_wins() {
        let log = Log::default();
        let finally_runs = Arc::new(AtomicU32::new(0));
        let scope = TryCatchFinally::builder(timeout_body())
            .catch(CatchClause::of::<IoError>(mark("io", &log)))
            .catch(CatchClause::of::<TimeoutError>(mark("timeout", &log)))
            .catch(CatchClause::any(mark("any", &log)))
            .finally(counter(&finally_runs))
            .build()
            .unwrap();

        let mut exchange = Exchange::with_body(1);
        invoke(&scope, &mut exchange).await;

        assert_eq!(*log.lock(), vec!["timeout"]);
        assert!(!exchange.is_failed());
        assert!(exchange.exception_caught().unwrap().is::<TimeoutError>());
        assert_eq!(exchange.property(keys::EXCEPTION_CAUGHT), Some(&Value::from("timed out")));
        assert_eq!(finally_runs.load(Ordering::SeqCst), 1);
    }

    /// Finally runs exactly once for handled/unhandled x failure/success.
    #[tokio::test]
    async fn finally_runs_once_in_every_combination() {
        for (fails, handled) in [(true, true), (true, false), (false, true), (false, false)] {
            let finally_runs = Arc::new(AtomicU32::new(0));
            let log = Log::default();
            let body: SharedProcessor = if fails {
                Arc::new(timeout_body())
            } else {
                Arc::new(mark("body", &log))
            };
            let scope = TryCatchFinally::builder(body)
                .catch(CatchClause::of::<TimeoutError>(mark("catch", &log)).handled(handled))
                .finally(counter(&finally_runs))
                .build()
                .unwrap();

            let mut exchange = Exchange::with_body(1);
            invoke(&scope, &mut exchange).await;

            assert_eq!(finally_runs.load(Ordering::SeqCst), 1, "fails={fails} handled={handled}");
            assert_eq!(exchange.is_failed(), fails && !handled, "fails={fails} handled={handled}");
        }
    }

    #[tokio::test]
    async fn unmatched_failure_propagates_after_finally() {
        let log = Log::default();
        let finally_runs = Arc::new(AtomicU32::new(0));
        let scope = TryCatchFinally::builder(timeout_body())
            .catch(CatchClause::of::<IoError>(mark("io", &log)))
            .finally(counter(&finally_runs))
            .build()
            .unwrap();

        let mut exchange = Exchange::with_body(1);
        invoke(&scope, &mut exchange).await;

        assert!(log.lock().is_empty());
        assert_eq!(finally_runs.load(Ordering::SeqCst), 1);
        assert!(exchange.exception().unwrap().is::<TimeoutError>());
    }

    #[tokio::test]
    async fn catch_can_rethrow_a_new_failure() {
        let scope = TryCatchFinally::builder(timeout_body())
            .catch(CatchClause::any(raise_error("translated")))
            .build()
            .unwrap();
        let mut exchange = Exchange::with_body(1);
        invoke(&scope, &mut exchange).await;
        assert_eq!(exchange.exception().unwrap().to_string(), "translated");
    }

    #[tokio::test]
    async fn on_when_narrows_clause() {
        let log = Log::default();
        let scope = TryCatchFinally::builder(timeout_body())
            .catch(
                CatchClause::of::<TimeoutError>(mark("premium", &log))
                    .on_when(|ex: &Exchange| ex.header("tier").is_some()),
            )
            .catch(CatchClause::any(mark("fallback", &log)))
            .build()
            .unwrap();
        let mut exchange = Exchange::with_body(1);
        invoke(&scope, &mut exchange).await;
        assert_eq!(*log.lock(), vec!["fallback"]);
    }

    #[tokio::test]
    async fn failing_finally_replaces_pending_failure() {
        let scope = TryCatchFinally::builder(timeout_body())
            .finally(raise_error("cleanup failed"))
            .build()
            .unwrap();
        let mut exchange = Exchange::with_body(1);
        invoke(&scope, &mut exchange).await;
        assert_eq!(exchange.exception().unwrap().to_string(), "cleanup failed");
    }

    #[test]
    fn second_finally_is_a_configuration_error() {
        let result = TryCatchFinally::builder(raise_error("x"))
            .finally(raise_error("a"))
            .finally(raise_error("b"))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateFinally)));
    }

    #[test]
    fn try_without_handlers_is_rejected() {
        let result = TryCatchFinally::builder(raise_error("x")).build();
        assert!(matches!(result, Err(ConfigError::EmptyTry)));
    }
}
