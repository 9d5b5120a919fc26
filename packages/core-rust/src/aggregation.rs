//! Aggregation strategies and the seed-aware fold.
//!
//! [`fold`] is the only place the engine calls a strategy: the first exchange
//! of a group seeds the accumulator directly, so strategies only ever see a
//! `None` old exchange when called by hand.

use std::sync::Arc;

use crate::exchange::Exchange;
use crate::traits::AggregationStrategy;
use crate::types::Value;

/// Shared, type-erased strategy.
pub type SharedStrategy = Arc<dyn AggregationStrategy>;

/// Folds `next` into the accumulator.
///
/// A `None` accumulator means `next` is the first element: it becomes the seed
/// unchanged and the strategy is not called.
///
/// # Errors
///
/// Returns the strategy's error if combining fails.
pub fn fold(
    strategy: &dyn AggregationStrategy,
    acc: Option<Exchange>,
    next: Exchange,
) -> anyhow::Result<Exchange> {
    match acc {
        None => Ok(next),
        Some(old) => strategy.aggregate(Some(old), next),
    }
}

/// Keeps the most recent exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, _old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        Ok(new)
    }
}

/// Appends the text of the new body to the old one with a separator.
///
/// Order-sensitive: folding A then B gives `"A<sep>B"`, B then A gives
/// `"B<sep>A"`.
#[derive(Debug, Clone, Default)]
pub struct StringConcat {
    separator: String,
}

impl StringConcat {
    #[must_use]
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl AggregationStrategy for StringConcat {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        let Some(mut old) = old else {
            return Ok(new);
        };
        let mut text = old.body().to_text();
        text.push_str(&self.separator);
        text.push_str(&new.body().to_text());
        old.set_body(text);
        Ok(old)
    }
}

/// Adds integer bodies. Order-insensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumInts;

impl AggregationStrategy for SumInts {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        let Some(mut old) = old else {
            return Ok(new);
        };
        let lhs = int_body(&old)?;
        let rhs = int_body(&new)?;
        old.set_body(lhs.saturating_add(rhs));
        Ok(old)
    }
}

fn int_body(exchange: &Exchange) -> anyhow::Result<i64> {
    exchange.body().as_i64().ok_or_else(|| {
        crate::error::ProcessingError::UnexpectedValue {
            expected: "integer body",
            found: exchange.body().to_text(),
        }
        .into()
    })
}

/// Collects bodies into an array in fold order.
///
/// The seed's body is wrapped on the first combine, so a single-element group
/// keeps its plain body.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBodies;

impl AggregationStrategy for GroupedBodies {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        let Some(mut old) = old else {
            return Ok(new);
        };
        let grouped = match old.body() {
            Value::Array(items) if old.property(GROUPED_MARKER).is_some() => {
                let mut items = items.clone();
                items.push(new.body().clone());
                items
            }
            first => vec![first.clone(), new.body().clone()],
        };
        old.set_property(GROUPED_MARKER, true);
        old.set_body(grouped);
        Ok(old)
    }

    fn on_completion(&self, result: &mut Exchange) {
        result.remove_property(GROUPED_MARKER);
    }
}

const GROUPED_MARKER: &str = "SwitchyardGroupedBodies";

type CombineFn = dyn Fn(Option<Exchange>, Exchange) -> anyhow::Result<Exchange> + Send + Sync;

/// Strategy backed by a closure.
#[derive(Clone)]
pub struct FnStrategy(Arc<CombineFn>);

impl AggregationStrategy for FnStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        (self.0)(old, new)
    }
}

impl std::fmt::Debug for FnStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnStrategy")
    }
}

/// Wraps a closure as an aggregation strategy.
pub fn from_fn<F>(combine: F) -> FnStrategy
where
    F: Fn(Option<Exchange>, Exchange) -> anyhow::Result<Exchange> + Send + Sync + 'static,
{
    FnStrategy(Arc::new(combine))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fold_all(strategy: &dyn AggregationStrategy, bodies: &[Value]) -> Exchange {
        let mut acc = None;
        for body in bodies {
            acc = Some(fold(strategy, acc, Exchange::with_body(body.clone())).unwrap());
        }
        let mut result = acc.unwrap();
        strategy.on_completion(&mut result);
        result
    }

    #[test]
    fn seed_is_returned_unmodified() {
        let strategy = from_fn(|_old, _new| panic!("strategy must not see the seed"));
        let a = Exchange::with_body("A");
        let id = a.id().to_string();
        let seeded = fold(&strategy, None, a).unwrap();
        assert_eq!(seeded.id(), id);
        assert_eq!(seeded.body(), &Value::from("A"));
    }

    #[test]
    fn string_concat_is_order_sensitive() {
        let concat = StringConcat::new("");
        let abc = fold_all(&concat, &["A".into(), "B".into(), "C".into()]);
        let bac = fold_all(&concat, &["B".into(), "A".into(), "C".into()]);
        assert_eq!(abc.body(), &Value::from("ABC"));
        assert_eq!(bac.body(), &Value::from("BAC"));
    }

    #[test]
    fn string_concat_with_separator() {
        let concat = StringConcat::new(",");
        let a = Exchange::with_body("A");
        let b = Exchange::with_body("B");
        let merged = concat.aggregate(Some(a), b).unwrap();
        assert_eq!(merged.body(), &Value::from("A,B"));
    }

    #[test]
    fn sum_rejects_non_integers() {
        let a = Exchange::with_body(1);
        let b = Exchange::with_body("two");
        assert!(SumInts.aggregate(Some(a), b).is_err());
    }

    #[test]
    fn grouped_bodies_collects_in_order() {
        let result = fold_all(&GroupedBodies, &[Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(
            result.body(),
            &Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert!(result.property(GROUPED_MARKER).is_none());
    }

    #[test]
    fn use_latest_keeps_last() {
        let result = fold_all(&UseLatest, &[Value::from("x"), Value::from("y")]);
        assert_eq!(result.body(), &Value::from("y"));
    }

    proptest! {
        #[test]
        fn sum_is_independent_of_order(mut values in prop::collection::vec(-1000i64..1000, 1..12)) {
            let forward: Vec<Value> = values.iter().copied().map(Value::from).collect();
            values.reverse();
            let backward: Vec<Value> = values.iter().copied().map(Value::from).collect();
            let lhs = fold_all(&SumInts, &forward);
            let rhs = fold_all(&SumInts, &backward);
            prop_assert_eq!(lhs.body(), rhs.body());
        }
    }
}
