//! Periodic execution logic: calendar conditions that gate table runs,
//! the dependency graph that orders jobs within a run, and the firing
//! math for run frequencies.

mod condition;
mod freq;
mod graph;

pub use condition::Condition;
pub use freq::next_firing;
pub use graph::{Graph, GraphError, GraphItem};
