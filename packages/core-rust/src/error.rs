//! Failure types carried by exchanges.
//!
//! Processors fail by returning an [`anyhow::Error`]; the engine stores the
//! failure in the exchange's exception slot as an [`ExchangeError`]. Catch
//! clauses and exception policies select failures with [`ErrorFilter`]s.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A failure recorded on an exchange.
///
/// Cheap to clone: exchange copies made for fan-out share the same error.
#[derive(Clone)]
pub struct ExchangeError(Arc<anyhow::Error>);

impl ExchangeError {
    /// Wraps an error. An `anyhow::Error` that already wraps an
    /// `ExchangeError` is unwrapped instead of nested.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        match err.into().downcast::<ExchangeError>() {
            Ok(existing) => existing,
            Err(other) => Self(Arc::new(other)),
        }
    }

    /// Creates an error from a plain message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Iterates the error and its causes, outermost first. Nested exchange
    /// errors are transparent: their own causes are yielded in their place.
    pub fn chain(&self) -> impl Iterator<Item = &(dyn StdError + 'static)> {
        let mut causes = Vec::new();
        collect_causes(self, &mut causes);
        causes.into_iter()
    }

    /// Finds the first error in the cause chain of type `E`.
    #[must_use]
    pub fn find<E: StdError + 'static>(&self) -> Option<&E> {
        self.chain().find_map(|err| err.downcast_ref::<E>())
    }

    /// Returns `true` if any error in the cause chain is of type `E`.
    #[must_use]
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.find::<E>().is_some()
    }

    /// Returns `true` if both handles point at the same recorded failure.
    #[must_use]
    pub fn same_as(&self, other: &ExchangeError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

fn collect_causes<'a>(err: &'a ExchangeError, out: &mut Vec<&'a (dyn StdError + 'static)>) {
    for cause in err.0.chain() {
        if let Some(nested) = cause.downcast_ref::<ExchangeError>() {
            // the nested chain already covers everything after this point
            collect_causes(nested, out);
            return;
        }
        out.push(cause);
    }
}

impl fmt::Debug for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for ExchangeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for ExchangeError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

impl From<ProcessingError> for ExchangeError {
    fn from(err: ProcessingError) -> Self {
        Self::new(err)
    }
}

/// Failures raised by the routing engine itself rather than by user processors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("processor {processor} panicked: {message}")]
    Panicked { processor: String, message: String },
    #[error("processor {processor} dropped its completion without signalling")]
    CompletionDropped { processor: String },
    #[error("{construct} processing failed for number {index}")]
    BranchFailed {
        construct: &'static str,
        index: usize,
        #[source]
        source: ExchangeError,
    },
    #[error("invalid correlation key: {reason}")]
    InvalidCorrelationKey { reason: String },
    #[error("correlation key {key} is closed")]
    ClosedCorrelationKey { key: String },
    #[error("expected {expected} but found {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: String,
    },
}

type Matcher = dyn Fn(&ExchangeError) -> bool + Send + Sync;

/// Selects failures by type.
///
/// A filter built with [`ErrorFilter::of`] matches when any error in the cause
/// chain is of the requested type, so wrapping a failure in context does not
/// hide it from catch clauses. [`ErrorFilter::any`] matches everything and
/// plays the role of the root of the error hierarchy.
#[derive(Clone)]
pub struct ErrorFilter {
    name: Cow<'static, str>,
    matcher: Arc<Matcher>,
}

impl ErrorFilter {
    /// Matches every failure.
    #[must_use]
    pub fn any() -> Self {
        Self {
            name: Cow::Borrowed("any"),
            matcher: Arc::new(|_: &ExchangeError| true),
        }
    }

    /// Matches failures with an `E` anywhere in their cause chain.
    #[must_use]
    pub fn of<E: StdError + Send + Sync + 'static>() -> Self {
        Self {
            name: Cow::Borrowed(std::any::type_name::<E>()),
            matcher: Arc::new(|err: &ExchangeError| err.is::<E>()),
        }
    }

    /// Matches failures with an `E` in their cause chain for which `pred` holds.
    /// Useful for selecting a single variant of an error enum.
    #[must_use]
    pub fn when<E, F>(pred: F) -> Self
    where
        E: StdError + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            name: Cow::Borrowed(std::any::type_name::<E>()),
            matcher: Arc::new(move |err: &ExchangeError| {
                err.chain().filter_map(|e| e.downcast_ref::<E>()).any(&pred)
            }),
        }
    }

    /// Matches failures whose rendered message contains `needle`.
    #[must_use]
    pub fn message_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self {
            name: Cow::Owned(format!("message contains {needle:?}")),
            matcher: Arc::new(move |err: &ExchangeError| {
                err.chain().any(|e| e.to_string().contains(&needle))
            }),
        }
    }

    #[must_use]
    pub fn matches(&self, err: &ExchangeError) -> bool {
        (self.matcher)(err)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ErrorFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorFilter").field(&self.name).finish()
    }
}

/// Returns `true` if any of `filters` matches `err`.
#[must_use]
pub fn matches_any(filters: &[ErrorFilter], err: &ExchangeError) -> bool {
    filters.iter().any(|filter| filter.matches(err))
}
