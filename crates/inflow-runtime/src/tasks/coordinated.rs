//! Coordinated scheduling through a distributed job scheduler
//!
//! A `CoordinatedScheduleDelegate` wraps the same `PollTask` a local runner
//! would execute, but registers it as a job with a `DistributedScheduler`
//! so that only the cluster member elected for the job's group runs it.

use super::local::run_cycle;
use inflow_core::{PollTask, SchedulerError, TaskError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Distributed Scheduler Interface
// ----------------------------------------------------------------------------

/// A recurring job registration
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub group: String,
    pub interval: Duration,
    pub task: Arc<dyn PollTask>,
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("interval", &self.interval)
            .finish()
    }
}

/// State of one trigger firing a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

/// Notifications about a scheduled job
pub trait JobListener: Send + Sync {
    fn on_job_completed(&self, _job: &str, _result: &Result<(), TaskError>) {}

    fn on_job_removed(&self, _job: &str) {}
}

/// Cluster-wide job scheduler guaranteeing one active executor per job
pub trait DistributedScheduler: Send + Sync {
    /// Register a recurring job; fails if the name is taken
    fn schedule(&self, job: JobSpec) -> Result<(), SchedulerError>;

    fn is_scheduled(&self, name: &str) -> bool;

    fn pause(&self, name: &str) -> Result<(), SchedulerError>;

    fn resume(&self, name: &str) -> Result<(), SchedulerError>;

    /// Remove a job; `Ok(false)` if it was not scheduled
    fn delete(&self, name: &str) -> Result<bool, SchedulerError>;

    fn trigger_states(&self, name: &str) -> Vec<TriggerState>;

    fn add_listener(&self, name: &str, listener: Arc<dyn JobListener>);
}

// ----------------------------------------------------------------------------
// Guarded Task
// ----------------------------------------------------------------------------

/// Runs a task cycle, turning panics into `TaskError::Panicked`
///
/// The result reaches the scheduler's job listeners; a failure never
/// unschedules the job.
struct GuardedTask {
    name: String,
    inner: Arc<dyn PollTask>,
}

impl PollTask for GuardedTask {
    fn execute(&self) -> Result<(), TaskError> {
        run_cycle(&self.name, self.inner.as_ref())
    }

    fn on_terminate(&self) {
        self.inner.on_terminate();
    }
}

struct RemovalLogger;

impl JobListener for RemovalLogger {
    fn on_job_removed(&self, job: &str) {
        info!(job = %job, "Coordinated job removed from scheduler");
    }
}

// ----------------------------------------------------------------------------
// Coordinated Schedule Delegate
// ----------------------------------------------------------------------------

/// Runs a poll task through the distributed scheduler
pub struct CoordinatedScheduleDelegate {
    name: String,
    scheduler: Arc<dyn DistributedScheduler>,
    interval_floor: Duration,
    task: Mutex<Option<Arc<dyn PollTask>>>,
}

impl CoordinatedScheduleDelegate {
    pub fn new<N: Into<String>>(
        name: N,
        scheduler: Arc<dyn DistributedScheduler>,
        interval_floor: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            scheduler,
            interval_floor,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `task` under `group_key`
    ///
    /// Intervals below the floor are clamped up. Registering a job name that
    /// is already scheduled is a no-op.
    pub fn register(
        &self,
        task: Arc<dyn PollTask>,
        group_key: &str,
        interval: Duration,
    ) -> Result<(), SchedulerError> {
        if self.scheduler.is_scheduled(&self.name) {
            debug!(job = %self.name, "Job already scheduled, skipping registration");
            return Ok(());
        }

        let interval = if interval < self.interval_floor {
            warn!(
                job = %self.name,
                requested_ms = interval.as_millis() as u64,
                floor_ms = self.interval_floor.as_millis() as u64,
                "Coordinated interval below minimum, clamping"
            );
            self.interval_floor
        } else {
            interval
        };

        let job = JobSpec {
            name: self.name.clone(),
            group: group_key.to_string(),
            interval,
            task: Arc::new(GuardedTask {
                name: self.name.clone(),
                inner: task.clone(),
            }),
        };
        self.scheduler.schedule(job)?;
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.scheduler.add_listener(&self.name, Arc::new(RemovalLogger));
        info!(job = %self.name, group = %group_key, ?interval, "Coordinated job registered");
        Ok(())
    }

    /// Remove the job and notify its task; `Ok(false)` if it was not scheduled
    pub fn unregister(&self) -> Result<bool, SchedulerError> {
        let removed = self.scheduler.delete(&self.name)?;
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.on_terminate();
        }
        if removed {
            info!(job = %self.name, "Coordinated job unregistered");
        }
        Ok(removed)
    }

    pub fn activate(&self) -> Result<(), SchedulerError> {
        self.scheduler.resume(&self.name)?;
        info!(job = %self.name, "Coordinated job activated");
        Ok(())
    }

    pub fn deactivate(&self) -> Result<(), SchedulerError> {
        self.scheduler.pause(&self.name)?;
        info!(job = %self.name, "Coordinated job deactivated");
        Ok(())
    }

    /// Whether at least one trigger of the job is un-paused
    pub fn is_active(&self) -> bool {
        self.scheduler
            .trigger_states(&self.name)
            .iter()
            .any(|state| *state == TriggerState::Normal)
    }
}
