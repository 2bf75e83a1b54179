//! Single-member implementation of the distributed scheduler
//!
//! `StandaloneScheduler` honours the `DistributedScheduler` contract inside
//! one process: each job ticks on its own interval and its cycles run on a
//! bounded blocking pool. A `MembershipView` decides whether this member is
//! the elected executor for a job group; the default view always is.

use super::coordinated::{DistributedScheduler, JobListener, JobSpec, TriggerState};
use dashmap::DashMap;
use inflow_core::{InflowResult, SchedulerConfig, SchedulerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

// ----------------------------------------------------------------------------
// Cluster Membership
// ----------------------------------------------------------------------------

/// Leadership view used to elect one executor per job group
pub trait MembershipView: Send + Sync {
    fn is_leader(&self, group: &str) -> bool;
}

/// Membership view for a cluster of one
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

impl MembershipView for AlwaysLeader {
    fn is_leader(&self, _group: &str) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Standalone Scheduler
// ----------------------------------------------------------------------------

struct JobEntry {
    group: String,
    paused: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
}

type ListenerMap = DashMap<String, Vec<Arc<dyn JobListener>>>;

/// In-process job scheduler with a bounded execution pool
pub struct StandaloneScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    jobs: DashMap<String, JobEntry>,
    listeners: Arc<ListenerMap>,
    membership: Arc<dyn MembershipView>,
}

impl StandaloneScheduler {
    pub fn new(config: &SchedulerConfig) -> InflowResult<Self> {
        Self::with_membership(config, Arc::new(AlwaysLeader))
    }

    pub fn with_membership(
        config: &SchedulerConfig,
        membership: Arc<dyn MembershipView>,
    ) -> InflowResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.pool_size.max(1))
            .thread_name("inflow-scheduler")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            jobs: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            membership,
        })
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn group_of(&self, name: &str) -> Option<String> {
        self.jobs.get(name).map(|job| job.group.clone())
    }

    /// Cancel every job and stop the pool
    pub fn shutdown(&self) {
        let names: Vec<String> = self.jobs.iter().map(|job| job.key().clone()).collect();
        for name in names {
            let _ = self.delete(&name);
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("Standalone scheduler shut down");
        }
    }
}

impl Drop for StandaloneScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DistributedScheduler for StandaloneScheduler {
    fn schedule(&self, job: JobSpec) -> Result<(), SchedulerError> {
        if job.interval.is_zero() {
            return Err(SchedulerError::RegistrationFailed {
                job: job.name,
                reason: "interval must be greater than zero".to_string(),
            });
        }
        if self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(SchedulerError::Unavailable {
                reason: "scheduler has been shut down".to_string(),
            });
        }

        let entry = match self.jobs.entry(job.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SchedulerError::RegistrationFailed {
                    job: job.name,
                    reason: "a job with this name is already scheduled".to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let paused = Arc::new(AtomicBool::new(false));
        let ticker = self.handle.spawn(run_job(
            job.clone(),
            paused.clone(),
            self.membership.clone(),
            self.listeners.clone(),
        ));
        entry.insert(JobEntry {
            group: job.group.clone(),
            paused,
            ticker,
        });
        info!(job = %job.name, group = %job.group, interval = ?job.interval, "Job scheduled");
        Ok(())
    }

    fn is_scheduled(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    fn pause(&self, name: &str) -> Result<(), SchedulerError> {
        let job = self.jobs.get(name).ok_or_else(|| SchedulerError::JobNotFound {
            job: name.to_string(),
        })?;
        job.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self, name: &str) -> Result<(), SchedulerError> {
        let job = self.jobs.get(name).ok_or_else(|| SchedulerError::JobNotFound {
            job: name.to_string(),
        })?;
        job.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, SchedulerError> {
        let Some((_, job)) = self.jobs.remove(name) else {
            return Ok(false);
        };
        job.ticker.abort();
        if let Some((_, listeners)) = self.listeners.remove(name) {
            for listener in listeners {
                listener.on_job_removed(name);
            }
        }
        debug!(job = %name, "Job deleted");
        Ok(true)
    }

    fn trigger_states(&self, name: &str) -> Vec<TriggerState> {
        match self.jobs.get(name) {
            Some(job) if job.paused.load(Ordering::SeqCst) => vec![TriggerState::Paused],
            Some(_) => vec![TriggerState::Normal],
            None => Vec::new(),
        }
    }

    fn add_listener(&self, name: &str, listener: Arc<dyn JobListener>) {
        self.listeners
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }
}

async fn run_job(
    job: JobSpec,
    paused: Arc<AtomicBool>,
    membership: Arc<dyn MembershipView>,
    listeners: Arc<ListenerMap>,
) {
    let mut ticker = tokio::time::interval(job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if paused.load(Ordering::SeqCst) || !membership.is_leader(&job.group) {
            continue;
        }

        let task = job.task.clone();
        let result = match tokio::task::spawn_blocking(move || task.execute()).await {
            Ok(result) => result,
            Err(join_error) => {
                error!(job = %job.name, error = %join_error, "Job cycle aborted");
                continue;
            }
        };

        let current: Vec<Arc<dyn JobListener>> = listeners
            .get(&job.name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for listener in current {
            listener.on_job_completed(&job.name, &result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_core::{FnTask, TaskError};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn counting_job(name: &str, interval: Duration) -> (JobSpec, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let job = JobSpec {
            name: name.to_string(),
            group: "pollers".to_string(),
            interval,
            task: Arc::new(FnTask::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TaskError>(())
            })),
        };
        (job, calls)
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_job_runs_and_can_be_paused() {
        let scheduler = StandaloneScheduler::new(&SchedulerConfig::testing()).unwrap();
        let (job, calls) = counting_job("tick", Duration::from_millis(10));
        scheduler.schedule(job).unwrap();
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 2));

        scheduler.pause("tick").unwrap();
        assert_eq!(scheduler.trigger_states("tick"), vec![TriggerState::Paused]);
        std::thread::sleep(Duration::from_millis(30));
        let frozen = calls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), frozen);

        scheduler.resume("tick").unwrap();
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) > frozen));
    }

    #[test]
    fn test_duplicate_job_name_is_rejected() {
        let scheduler = StandaloneScheduler::new(&SchedulerConfig::testing()).unwrap();
        let (first, _) = counting_job("dup", Duration::from_secs(1));
        let (second, _) = counting_job("dup", Duration::from_secs(1));
        scheduler.schedule(first).unwrap();
        assert!(matches!(
            scheduler.schedule(second),
            Err(SchedulerError::RegistrationFailed { .. })
        ));
    }

    #[test]
    fn test_follower_does_not_execute() {
        struct Follower;
        impl MembershipView for Follower {
            fn is_leader(&self, _group: &str) -> bool {
                false
            }
        }

        let scheduler =
            StandaloneScheduler::with_membership(&SchedulerConfig::testing(), Arc::new(Follower))
                .unwrap();
        let (job, calls) = counting_job("elsewhere", Duration::from_millis(5));
        scheduler.schedule(job).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(scheduler.delete("elsewhere").unwrap());
        assert!(!scheduler.delete("elsewhere").unwrap());
    }
}
