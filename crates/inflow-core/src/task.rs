//! The poll/consume capability shared by every runner
//!
//! Protocol-specific listeners implement `PollTask` and are composed into a
//! local runner or a coordinated schedule; neither runner knows what a cycle
//! actually does.

use crate::errors::TaskError;
use std::sync::Arc;

/// One listener's poll/consume cycle
pub trait PollTask: Send + Sync {
    /// Run a single cycle
    ///
    /// A returned error is logged by the runner and never stops it.
    fn execute(&self) -> Result<(), TaskError>;

    /// Called once when the owning runner is terminated
    fn on_terminate(&self) {}
}

impl<T: PollTask + ?Sized> PollTask for Arc<T> {
    fn execute(&self) -> Result<(), TaskError> {
        (**self).execute()
    }

    fn on_terminate(&self) {
        (**self).on_terminate()
    }
}

/// Adapts a closure into a `PollTask`
pub struct FnTask<F>(F);

impl<F> FnTask<F>
where
    F: Fn() -> Result<(), TaskError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> PollTask for FnTask<F>
where
    F: Fn() -> Result<(), TaskError> + Send + Sync,
{
    fn execute(&self) -> Result<(), TaskError> {
        (self.0)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fn_task_runs_closure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let task = FnTask::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        task.execute().unwrap();
        task.execute().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_arc_task_forwards_errors() {
        let task: Arc<dyn PollTask> = Arc::new(FnTask::new(|| Err(TaskError::failed("boom"))));
        assert_eq!(task.execute(), Err(TaskError::failed("boom")));
    }
}
