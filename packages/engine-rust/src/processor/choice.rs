//! Content-based router.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::{Exchange, Predicate, Processor, SharedPredicate, SharedProcessor};
use tracing::debug;

use crate::completion::invoke;
use crate::error::ConfigError;

/// Evaluates `when` predicates in declaration order and runs the first
/// matching branch. Without a match the `otherwise` branch runs if there is
/// one; otherwise the exchange passes through untouched.
///
/// A predicate that fails to evaluate fails the exchange; later predicates are
/// not evaluated.
pub struct Choice {
    whens: Vec<(SharedPredicate, SharedProcessor)>,
    otherwise: Option<SharedProcessor>,
}

impl Choice {
    #[must_use]
    pub fn builder() -> ChoiceBuilder {
        ChoiceBuilder::default()
    }
}

#[async_trait]
impl Processor for Choice {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        for (index, (predicate, branch)) in self.whens.iter().enumerate() {
            if predicate.matches(exchange)? {
                debug!(exchange_id = exchange.id(), index, "choice matched when clause");
                invoke(&**branch, exchange).await;
                return Ok(());
            }
        }
        if let Some(otherwise) = &self.otherwise {
            debug!(exchange_id = exchange.id(), "choice fell through to otherwise");
            invoke(&**otherwise, exchange).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "choice"
    }
}

#[derive(Default)]
pub struct ChoiceBuilder {
    whens: Vec<(SharedPredicate, SharedProcessor)>,
    otherwise: Option<SharedProcessor>,
}

impl ChoiceBuilder {
    #[must_use]
    pub fn when(
        mut self,
        predicate: impl Predicate + 'static,
        branch: impl Processor + 'static,
    ) -> Self {
        self.whens.push((Arc::new(predicate), Arc::new(branch)));
        self
    }

    #[must_use]
    pub fn otherwise(mut self, branch: impl Processor + 'static) -> Self {
        self.otherwise = Some(Arc::new(branch));
        self
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyChoice`] if no `when` clause was added.
    pub fn build(self) -> Result<Choice, ConfigError> {
        if self.whens.is_empty() {
            return Err(ConfigError::EmptyChoice);
        }
        Ok(Choice {
            whens: self.whens,
            otherwise: self.otherwise,
        })
    }
}
