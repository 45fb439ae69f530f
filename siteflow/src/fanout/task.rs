//! Research task slots.

use crate::core::{FailedQuery, Finding, TaskStatus};

/// Result slot of one research task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskSlot {
    /// Not settled yet.
    #[default]
    Pending,
    /// The task produced a finding.
    Succeeded(Finding),
    /// The task failed.
    Failed(FailedQuery),
}

/// One query dispatched by the fan-out coordinator.
///
/// The slot moves from `Pending` to a terminal state exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchTask {
    index: usize,
    query: String,
    slot: TaskSlot,
    attempts: u32,
}

impl ResearchTask {
    /// Creates a pending task.
    #[must_use]
    pub fn new(index: usize, query: impl Into<String>) -> Self {
        Self {
            index,
            query: query.into(),
            slot: TaskSlot::Pending,
            attempts: 0,
        }
    }

    /// Returns the query's position in the question list.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns the query text.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Returns the result slot.
    #[must_use]
    pub const fn slot(&self) -> &TaskSlot {
        &self.slot
    }

    /// Returns the provider calls made for this task.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the slot status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        match self.slot {
            TaskSlot::Pending => TaskStatus::Pending,
            TaskSlot::Succeeded(_) => TaskStatus::Succeeded,
            TaskSlot::Failed(_) => TaskStatus::Failed,
        }
    }

    /// Returns true once the slot is terminal.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self.slot, TaskSlot::Pending)
    }

    /// Settles the slot with a finding.
    ///
    /// The finding is stamped with this task's index and query. Returns
    /// false, leaving the slot untouched, if it was already settled.
    pub fn succeed(&mut self, mut finding: Finding, attempts: u32) -> bool {
        if self.is_settled() {
            return false;
        }
        finding.index = self.index;
        finding.query.clone_from(&self.query);
        self.slot = TaskSlot::Succeeded(finding);
        self.attempts = attempts;
        true
    }

    /// Settles the slot with a failure.
    ///
    /// Returns false, leaving the slot untouched, if it was already settled.
    pub fn fail(
        &mut self,
        error_kind: impl Into<String>,
        message: impl Into<String>,
        attempts: u32,
    ) -> bool {
        if self.is_settled() {
            return false;
        }
        self.slot = TaskSlot::Failed(FailedQuery {
            index: self.index,
            query: self.query.clone(),
            error_kind: error_kind.into(),
            message: message.into(),
            attempts,
        });
        self.attempts = attempts;
        true
    }

    /// Returns the finding, if the task succeeded.
    #[must_use]
    pub const fn finding(&self) -> Option<&Finding> {
        match &self.slot {
            TaskSlot::Succeeded(finding) => Some(finding),
            _ => None,
        }
    }

    /// Returns the failure, if the task failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailedQuery> {
        match &self.slot {
            TaskSlot::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
