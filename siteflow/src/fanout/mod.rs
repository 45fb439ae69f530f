//! The research fan-out phase.
//!
//! One [`ResearchTask`] per generated question runs concurrently under a
//! [`TaskGroup`](crate::cancellation::TaskGroup). The coordinator merges
//! the settled slots into a single `ResearchFindings` output.

mod coordinator;
mod task;

pub use coordinator::{FanOutCoordinator, FanOutPolicy};
pub use task::{ResearchTask, TaskSlot};
