use crate::C2Error;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::task::TaskTracker;

/// One terminal result of a fan-out task.
#[derive(Debug)]
pub struct GroupRecord<M> {
    pub outcome: Result<String, C2Error>,
    pub meta: M,
}

impl<M> GroupRecord<M> {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

#[derive(Debug)]
struct GroupState<M> {
    records: Vec<GroupRecord<M>>,
    error_count: usize,
}

/// Collects the results of one phase's concurrent tasks.
///
/// Cloning shares the same records and barrier.
#[derive(Debug)]
pub struct ResultGroup<M> {
    state: Arc<Mutex<GroupState<M>>>,
    tracker: TaskTracker,
}

impl<M> Clone for ResultGroup<M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            tracker: self.tracker.clone(),
        }
    }
}

impl<M> Default for ResultGroup<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ResultGroup<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GroupState {
                records: Vec::new(),
                error_count: 0,
            })),
            tracker: TaskTracker::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a task that `join` waits for.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub fn add_success(&self, msg: impl Into<String>, meta: M) {
        self.add(Ok(msg.into()), meta);
    }

    pub fn add_error(&self, err: C2Error, meta: M) {
        self.add(Err(err), meta);
    }

    pub fn add(&self, outcome: Result<String, C2Error>, meta: M) {
        let mut state = self.state();
        if outcome.is_err() {
            state.error_count += 1;
        }
        state.records.push(GroupRecord { outcome, meta });
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.state().error_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every spawned task to finish.
    pub async fn join(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Move the records out, leaving the error count intact.
    #[must_use]
    pub fn take_records(&self) -> Vec<GroupRecord<M>> {
        std::mem::take(&mut self.state().records)
    }
}
