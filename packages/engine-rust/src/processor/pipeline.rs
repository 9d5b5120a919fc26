//! Sequential composition of processors.

use async_trait::async_trait;
use switchyard_core::{Exchange, Processor, SharedProcessor};
use tracing::debug;

use crate::completion::invoke;

/// Runs steps in declared order on the same exchange.
///
/// Before each step after the first, an out message left by the previous step
/// is promoted to the in message. The pipeline stops as soon as the exchange
/// carries an exception or has been marked to stop; remaining steps are not
/// invoked.
#[derive(Clone)]
pub struct Pipeline {
    steps: Vec<SharedProcessor>,
}

impl Pipeline {
    #[must_use]
    pub fn new(steps: Vec<SharedProcessor>) -> Self {
        Self { steps }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromIterator<SharedProcessor> for Pipeline {
    fn from_iter<I: IntoIterator<Item = SharedProcessor>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                exchange.promote_out();
            }
            invoke(&**step, exchange).await;
            if !exchange.should_continue() {
                debug!(
                    exchange_id = exchange.id(),
                    step = step.name(),
                    index,
                    failed = exchange.is_failed(),
                    "pipeline stopped early"
                );
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "pipeline"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use proptest::prelude::*;
    use switchyard_core::{Message, Value};

    use super::*;
    use crate::processor::transform;

    /// Appends its label to a shared log.
    struct Record {
        label: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Record {
        async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
            self.log.lock().push(self.label.clone());
            Ok(())
        }
    }

    fn recorder(label: &str, log: &Arc<Mutex<Vec<String>>>) -> SharedProcessor {
        Arc::new(Record {
            label: label.to_string(),
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("a", &log),
            recorder("b", &log),
            recorder("c", &log),
        ]);
        let mut exchange = Exchange::with_body(1);
        invoke(&pipeline, &mut exchange).await;
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(!exchange.is_failed());
    }

    #[tokio::test]
    async fn short_circuits_on_exception() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("a", &log),
            Arc::new(transform::raise_error("boom")),
            recorder("c", &log),
        ]);
        let mut exchange = Exchange::with_body(1);
        invoke(&pipeline, &mut exchange).await;
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(exchange.exception().unwrap().to_string(), "boom");
    }

    #[tokio::test]
    async fn stop_halts_without_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("a", &log),
            Arc::new(transform::Stop),
            recorder("c", &log),
        ]);
        let mut exchange = Exchange::with_body(1);
        invoke(&pipeline, &mut exchange).await;
        assert_eq!(*log.lock(), vec!["a"]);
        assert!(!exchange.is_failed());
    }

    #[tokio::test]
    async fn out_message_becomes_next_in() {
        let reply = transform::from_fn("reply", |exchange: &mut Exchange| {
            exchange.set_out(Message::new("pong"));
            Ok(())
        });
        let echo = transform::from_fn("echo", |exchange: &mut Exchange| {
            let body = exchange.body().to_text();
            exchange.set_body(format!("{body}!"));
            Ok(())
        });
        let pipeline = Pipeline::new(vec![Arc::new(reply), Arc::new(echo)]);
        let mut exchange = Exchange::with_body("ping");
        invoke(&pipeline, &mut exchange).await;
        assert_eq!(exchange.body(), &Value::from("pong!"));
        assert!(!exchange.has_out());
    }

    #[tokio::test]
    async fn empty_pipeline_is_a_no_op() {
        let pipeline = Pipeline::new(Vec::new());
        let mut exchange = Exchange::with_body("same");
        invoke(&pipeline, &mut exchange).await;
        assert_eq!(exchange.body(), &Value::from("same"));
    }

    proptest! {
        #[test]
        fn every_step_runs_once_in_declared_order(labels in prop::collection::vec("[a-z]{1,4}", 0..16)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let log = Arc::new(Mutex::new(Vec::new()));
            let pipeline: Pipeline = labels.iter().map(|label| recorder(label, &log)).collect();
            let mut exchange = Exchange::with_body(0);
            runtime.block_on(invoke(&pipeline, &mut exchange));
            prop_assert_eq!(&*log.lock(), &labels);
        }
    }
}
