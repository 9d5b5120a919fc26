//! Built-in expressions and predicates.
//!
//! Expression languages are pluggable through the [`Expression`] and
//! [`Predicate`] traits; this module covers the lookups routes need most often
//! (headers, properties, the body) plus regex matching and boolean combinators.

use std::sync::Arc;

use regex::Regex;

use crate::error::ProcessingError;
use crate::exchange::Exchange;
use crate::traits::{Expression, Predicate};
use crate::types::Value;

/// Shared, type-erased expression.
pub type SharedExpression = Arc<dyn Expression>;

/// Shared, type-erased predicate.
pub type SharedPredicate = Arc<dyn Predicate>;

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Evaluates to the named in-message header, or `Null` when absent.
#[derive(Debug, Clone)]
pub struct HeaderExpression {
    name: String,
}

impl Expression for HeaderExpression {
    fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        Ok(exchange.header(&self.name).cloned().unwrap_or_default())
    }
}

#[must_use]
pub fn header(name: impl Into<String>) -> HeaderExpression {
    HeaderExpression { name: name.into() }
}

/// Evaluates to the named exchange property, or `Null` when absent.
#[derive(Debug, Clone)]
pub struct PropertyExpression {
    name: String,
}

impl Expression for PropertyExpression {
    fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        Ok(exchange.property(&self.name).cloned().unwrap_or_default())
    }
}

#[must_use]
pub fn property(name: impl Into<String>) -> PropertyExpression {
    PropertyExpression { name: name.into() }
}

/// Evaluates to the in-message body.
#[derive(Debug, Clone, Copy)]
pub struct BodyExpression;

impl Expression for BodyExpression {
    fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        Ok(exchange.body().clone())
    }
}

#[must_use]
pub fn body() -> BodyExpression {
    BodyExpression
}

/// Always evaluates to the same value.
#[derive(Debug, Clone)]
pub struct ConstantExpression(Value);

impl Expression for ConstantExpression {
    fn evaluate(&self, _exchange: &Exchange) -> anyhow::Result<Value> {
        Ok(self.0.clone())
    }
}

#[must_use]
pub fn constant(value: impl Into<Value>) -> ConstantExpression {
    ConstantExpression(value.into())
}

/// Splits the text body on a separator into an array of strings.
///
/// Used as a splitter expression. Empty tokens are dropped. A body that is
/// already an array is returned as-is.
#[derive(Debug, Clone)]
pub struct TokenizeExpression {
    separator: String,
}

impl Expression for TokenizeExpression {
    fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        match exchange.body() {
            Value::Array(items) => Ok(Value::Array(items.clone())),
            Value::String(text) => Ok(Value::Array(
                text.split(self.separator.as_str())
                    .filter(|token| !token.is_empty())
                    .map(Value::from)
                    .collect(),
            )),
            Value::Null => Ok(Value::Array(Vec::new())),
            other => Err(ProcessingError::UnexpectedValue {
                expected: "string or array body",
                found: other.to_text(),
            }
            .into()),
        }
    }
}

#[must_use]
pub fn tokenize(separator: impl Into<String>) -> TokenizeExpression {
    TokenizeExpression {
        separator: separator.into(),
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Matches when the named header equals `expected`.
#[derive(Debug, Clone)]
pub struct HeaderEquals {
    name: String,
    expected: Value,
}

impl Predicate for HeaderEquals {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        Ok(exchange.header(&self.name) == Some(&self.expected))
    }
}

#[must_use]
pub fn header_equals(name: impl Into<String>, expected: impl Into<Value>) -> HeaderEquals {
    HeaderEquals {
        name: name.into(),
        expected: expected.into(),
    }
}

/// Matches when the text rendering of an expression matches a regex.
pub struct RegexPredicate {
    source: SharedExpression,
    pattern: Regex,
}

impl Predicate for RegexPredicate {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        let value = self.source.evaluate(exchange)?;
        if value.is_null() {
            return Ok(false);
        }
        Ok(self.pattern.is_match(&value.to_text()))
    }
}

impl std::fmt::Debug for RegexPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexPredicate")
            .field("pattern", &self.pattern.as_str())
            .finish_non_exhaustive()
    }
}

/// Matches when the named header's text matches `pattern`. An absent header
/// never matches.
///
/// # Errors
///
/// Returns an error if `pattern` is not a valid regular expression.
pub fn header_matches(name: impl Into<String>, pattern: &str) -> Result<RegexPredicate, regex::Error> {
    Ok(RegexPredicate {
        source: Arc::new(header(name)),
        pattern: Regex::new(pattern)?,
    })
}

/// Matches when the body's text matches `pattern`.
///
/// # Errors
///
/// Returns an error if `pattern` is not a valid regular expression.
pub fn body_matches(pattern: &str) -> Result<RegexPredicate, regex::Error> {
    Ok(RegexPredicate {
        source: Arc::new(BodyExpression),
        pattern: Regex::new(pattern)?,
    })
}

/// Matches when the body's text contains `needle`.
#[derive(Debug, Clone)]
pub struct BodyContains(String);

impl Predicate for BodyContains {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        Ok(exchange.body().to_text().contains(self.0.as_str()))
    }
}

#[must_use]
pub fn body_contains(needle: impl Into<String>) -> BodyContains {
    BodyContains(needle.into())
}

/// Matches when the exchange carries a failure.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionPresent;

impl Predicate for ExceptionPresent {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        Ok(exchange.is_failed())
    }
}

#[must_use]
pub fn exception_present() -> ExceptionPresent {
    ExceptionPresent
}

/// Negates a predicate. Evaluation errors pass through.
pub struct Not(SharedPredicate);

impl Predicate for Not {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        Ok(!self.0.matches(exchange)?)
    }
}

#[must_use]
pub fn not(predicate: impl Predicate + 'static) -> Not {
    Not(Arc::new(predicate))
}

/// Short-circuiting conjunction, evaluated left to right.
pub struct All(Vec<SharedPredicate>);

impl Predicate for All {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        for predicate in &self.0 {
            if !predicate.matches(exchange)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[must_use]
pub fn and(predicates: Vec<SharedPredicate>) -> All {
    All(predicates)
}

/// Short-circuiting disjunction, evaluated left to right.
pub struct AnyOf(Vec<SharedPredicate>);

impl Predicate for AnyOf {
    fn matches(&self, exchange: &Exchange) -> anyhow::Result<bool> {
        for predicate in &self.0 {
            if predicate.matches(exchange)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[must_use]
pub fn or(predicates: Vec<SharedPredicate>) -> AnyOf {
    AnyOf(predicates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Exchange {
        let mut exchange = Exchange::with_body("priority order #42");
        exchange.set_header("region", "eu");
        exchange.set_property("tenant", "acme");
        exchange
    }

    #[test]
    fn lookups() {
        let exchange = order();
        assert_eq!(header("region").evaluate(&exchange).unwrap(), Value::from("eu"));
        assert!(header("missing").evaluate(&exchange).unwrap().is_null());
        assert_eq!(property("tenant").evaluate(&exchange).unwrap(), Value::from("acme"));
        assert_eq!(body().evaluate(&exchange).unwrap(), Value::from("priority order #42"));
        assert_eq!(constant(5).evaluate(&exchange).unwrap(), Value::Int(5));
    }

    #[test]
    fn tokenize_splits_and_drops_empty_tokens() {
        let exchange = Exchange::with_body("a,b,,c");
        let parts = tokenize(",").evaluate(&exchange).unwrap();
        assert_eq!(
            parts,
            Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c")])
        );
    }

    #[test]
    fn tokenize_rejects_numbers() {
        let exchange = Exchange::with_body(3);
        let err = tokenize(",").evaluate(&exchange).unwrap_err();
        assert!(err.downcast_ref::<ProcessingError>().is_some());
    }

    #[test]
    fn regex_predicates() {
        let exchange = order();
        assert!(body_matches(r"#\d+$").unwrap().matches(&exchange).unwrap());
        assert!(header_matches("region", "^e").unwrap().matches(&exchange).unwrap());
        assert!(!header_matches("missing", ".*").unwrap().matches(&exchange).unwrap());
        assert!(body_matches("(").is_err());
    }

    #[test]
    fn combinators() {
        let exchange = order();
        let both = and(vec![
            Arc::new(header_equals("region", "eu")) as SharedPredicate,
            Arc::new(body_contains("priority")),
        ]);
        assert!(both.matches(&exchange).unwrap());

        let either = or(vec![
            Arc::new(header_equals("region", "us")) as SharedPredicate,
            Arc::new(exception_present()),
        ]);
        assert!(!either.matches(&exchange).unwrap());
        assert!(not(either).matches(&exchange).unwrap());
    }
}
