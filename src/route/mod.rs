//! Route matching: predicate grammar and the source-indexed route table.

pub mod filter;
pub mod matcher;

pub use filter::{Pattern, Predicate};
pub use matcher::RouteMatcher;
