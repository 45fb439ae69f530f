//! Structured task group with bounded concurrency and a join deadline.

use super::CancellationToken;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::warn;

/// Why a group stopped before every task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStop {
    /// The join deadline elapsed.
    DeadlineElapsed,
    /// The group token was cancelled.
    Cancelled,
}

/// Result of joining a [`TaskGroup`].
#[derive(Debug)]
pub struct GroupOutcome<T> {
    /// Tasks that returned, as `(task id, value)` in completion order.
    pub completed: Vec<(usize, T)>,
    /// Ids of tasks that were aborted or panicked, ascending.
    pub unfinished: Vec<usize>,
    /// Set when the join ended early.
    pub stop: Option<GroupStop>,
}

impl<T> GroupOutcome<T> {
    /// Returns true if the join deadline elapsed.
    #[must_use]
    pub fn deadline_elapsed(&self) -> bool {
        self.stop == Some(GroupStop::DeadlineElapsed)
    }

    /// Returns true if the group was cancelled.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.stop == Some(GroupStop::Cancelled)
    }
}

enum Joined<T> {
    Task(Result<(usize, T), JoinError>),
    Empty,
    Elapsed,
}

/// A group of sibling tasks joined as a unit.
///
/// At most `max_concurrency` tasks run at once. Every task receives the
/// group's token, a child of the token the group was created from, so
/// stopping the group never cancels the caller. Tasks still running when
/// the group stops are cancelled and aborted before [`join_all`](Self::join_all)
/// returns.
pub struct TaskGroup<T> {
    cancel_token: Arc<CancellationToken>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<(usize, T)>,
    spawned: usize,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Creates a group whose token is a child of `parent`.
    #[must_use]
    pub fn new(parent: &Arc<CancellationToken>, max_concurrency: usize) -> Self {
        Self {
            cancel_token: parent.child(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: JoinSet::new(),
            spawned: 0,
        }
    }

    /// Returns the group's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Returns the number of tasks spawned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spawned
    }

    /// Returns true if no task was spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spawned == 0
    }

    /// Spawns a task and returns its id.
    ///
    /// Ids are assigned sequentially from zero.
    pub fn spawn<F, Fut>(&mut self, task: F) -> usize
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let id = self.spawned;
        self.spawned += 1;
        let token = Arc::clone(&self.cancel_token);
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            (id, task(token).await)
        });
        id
    }

    /// Waits for every task, the deadline, or cancellation, whichever is first.
    pub async fn join_all(mut self, deadline: Option<Instant>) -> GroupOutcome<T> {
        let token = Arc::clone(&self.cancel_token);
        let mut completed = Vec::with_capacity(self.spawned);
        let mut stop = None;

        loop {
            let joined = tokio::select! {
                biased;
                () = token.cancelled() => {
                    stop = Some(GroupStop::Cancelled);
                    break;
                }
                joined = join_next_until(&mut self.tasks, deadline) => joined,
            };
            match joined {
                Joined::Task(Ok((id, value))) => completed.push((id, value)),
                Joined::Task(Err(e)) => warn!(error = %e, "Task in group did not complete"),
                Joined::Empty => break,
                Joined::Elapsed => {
                    stop = Some(GroupStop::DeadlineElapsed);
                    token.cancel("task group deadline elapsed");
                    break;
                }
            }
        }

        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        let mut unfinished: Vec<usize> = (0..self.spawned)
            .filter(|id| !completed.iter().any(|(done, _)| done == id))
            .collect();
        unfinished.sort_unstable();

        GroupOutcome {
            completed,
            unfinished,
            stop,
        }
    }
}

async fn join_next_until<T: 'static>(
    tasks: &mut JoinSet<(usize, T)>,
    deadline: Option<Instant>,
) -> Joined<T> {
    let next = match deadline {
        Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
            Ok(next) => next,
            Err(_) => return Joined::Elapsed,
        },
        None => tasks.join_next().await,
    };
    next.map_or(Joined::Empty, Joined::Task)
}

impl<T> std::fmt::Debug for TaskGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("spawned", &self.spawned)
            .field("available_permits", &self.permits.available_permits())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
