//! Routing constructs. Each one is a [`Processor`](switchyard_core::Processor)
//! composed from child processors.
//!
//! - [`pipeline`]: ordered steps with short-circuit on failure
//! - [`choice`]: content-based router
//! - [`filter`]: message filter
//! - [`fanout`]: shared engine behind multicast and splitter
//! - [`multicast`], [`splitter`]: fan-out with recombination
//! - [`aggregator`]: correlation aggregator across exchanges
//! - [`try_catch`]: try/catch/finally scopes
//! - [`transform`]: small built-in steps

pub mod aggregator;
pub mod choice;
pub mod fanout;
pub mod filter;
pub mod multicast;
pub mod pipeline;
pub mod splitter;
pub mod transform;
pub mod try_catch;

pub use aggregator::{AggregationSweeper, Aggregator, AggregatorBuilder, AggregatorCommand, CompletedBy};
pub use choice::{Choice, ChoiceBuilder};
pub use fanout::FanOutOptions;
pub use filter::Filter;
pub use multicast::Multicast;
pub use pipeline::Pipeline;
pub use splitter::Splitter;
pub use try_catch::{CatchClause, TryBuilder, TryCatchFinally};
