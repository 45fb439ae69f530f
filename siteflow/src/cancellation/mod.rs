//! Structured cancellation utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation with parent/child links
//! - TaskGroup for joining bounded sibling tasks under a deadline

mod task_group;
mod token;

pub use task_group::{GroupOutcome, GroupStop, TaskGroup};
pub use token::{CancelCallback, CancellationToken};
