//! Small built-in steps: closures, body and header setters, stop, delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::{keys, Exchange, Expression, Processor, SharedExpression};

type StepFn = dyn Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync;

/// Processor backed by a synchronous closure.
#[derive(Clone)]
pub struct FnProcessor {
    name: String,
    step: Arc<StepFn>,
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (self.step)(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps a closure as a named processor.
pub fn from_fn<F>(name: impl Into<String>, step: F) -> FnProcessor
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnProcessor {
        name: name.into(),
        step: Arc::new(step),
    }
}

/// Replaces the in body with the value of an expression.
pub struct SetBody(SharedExpression);

impl SetBody {
    pub fn new(expression: impl Expression + 'static) -> Self {
        Self(Arc::new(expression))
    }
}

#[async_trait]
impl Processor for SetBody {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let body = self.0.evaluate(exchange)?;
        exchange.set_body(body);
        Ok(())
    }

    fn name(&self) -> &str {
        "set-body"
    }
}

/// Sets an in header to the value of an expression.
pub struct SetHeader {
    name: String,
    value: SharedExpression,
}

impl SetHeader {
    pub fn new(name: impl Into<String>, value: impl Expression + 'static) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(value),
        }
    }
}

#[async_trait]
impl Processor for SetHeader {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.value.evaluate(exchange)?;
        exchange.set_header(self.name.clone(), value);
        Ok(())
    }

    fn name(&self) -> &str {
        "set-header"
    }
}

/// Sets an exchange property to the value of an expression.
pub struct SetProperty {
    name: String,
    value: SharedExpression,
}

impl SetProperty {
    pub fn new(name: impl Into<String>, value: impl Expression + 'static) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(value),
        }
    }
}

#[async_trait]
impl Processor for SetProperty {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.value.evaluate(exchange)?;
        exchange.set_property(self.name.clone(), value);
        Ok(())
    }

    fn name(&self) -> &str {
        "set-property"
    }
}

#[derive(Debug, Clone)]
pub struct RemoveHeader(pub String);

#[async_trait]
impl Processor for RemoveHeader {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.in_message_mut().remove_header(&self.0);
        Ok(())
    }

    fn name(&self) -> &str {
        "remove-header"
    }
}

/// Marks the exchange so that enclosing pipelines stop routing it. Not a
/// failure: error handlers do not see it.
#[derive(Debug, Clone, Copy)]
pub struct Stop;

#[async_trait]
impl Processor for Stop {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.set_property(keys::ROUTE_STOP, true);
        Ok(())
    }

    fn name(&self) -> &str {
        "stop"
    }
}

type ErrorFactory = dyn Fn(&Exchange) -> anyhow::Error + Send + Sync;

/// Fails the exchange with an error built from it.
#[derive(Clone)]
pub struct RaiseError(Arc<ErrorFactory>);

impl RaiseError {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&Exchange) -> anyhow::Error + Send + Sync + 'static,
    {
        Self(Arc::new(factory))
    }
}

#[async_trait]
impl Processor for RaiseError {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        Err((self.0)(exchange))
    }

    fn name(&self) -> &str {
        "raise-error"
    }
}

/// Fails every exchange with a plain message.
pub fn raise_error(message: &'static str) -> RaiseError {
    RaiseError::new(move |_: &Exchange| anyhow::anyhow!(message))
}

/// Suspends the exchange for a fixed time without blocking a thread.
#[derive(Debug, Clone, Copy)]
pub struct Delay(pub Duration);

#[async_trait]
impl Processor for Delay {
    async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "delay"
    }
}
