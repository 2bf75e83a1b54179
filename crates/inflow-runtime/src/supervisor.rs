//! Endpoint Lifecycle Manager
//!
//! Owns one `RunnerHandle` per started endpoint and decides how each one runs:
//! - polling endpoints on a `LocalPollingRunner`, or through a
//!   `CoordinatedScheduleDelegate` when coordination is enabled
//! - listening endpoints as a port bound on the shared `ProtocolReactor`
//!
//! Start, stop, activate and deactivate are all idempotent.

use crate::processor::MessageProcessor;
use crate::reactor::ProtocolReactor;
use crate::tasks::{
    CoordinatedScheduleDelegate, DistributedScheduler, LocalPollingRunner, Schedule,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use inflow_core::{
    EndpointConfig, EndpointKind, InflowError, InflowResult, PollTask, SchedulerConfig,
    SchedulerError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Scheduler group coordinated endpoints are registered under
pub const DEFAULT_JOB_GROUP: &str = "inflow-inbound";

/// How long `stop_endpoint` waits for a local runner thread to exit
const RUNNER_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Runner Handles
// ----------------------------------------------------------------------------

/// Owning record for one endpoint's execution
pub enum RunnerHandle {
    Local(LocalPollingRunner),
    Coordinated(CoordinatedScheduleDelegate),
    Listener {
        port: u16,
        processor: Arc<MessageProcessor>,
        active: bool,
    },
}

/// Which execution strategy an endpoint runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    Interval,
    OneShot,
    Coordinated,
    Listening,
}

/// Point-in-time view of an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub name: String,
    pub mode: RunnerMode,
    pub active: bool,
    /// Cycles executed by a local runner
    pub cycles: Option<u64>,
    pub port: Option<u16>,
}

impl RunnerHandle {
    fn mode(&self) -> RunnerMode {
        match self {
            RunnerHandle::Local(runner) => match runner.schedule() {
                Schedule::Interval(_) => RunnerMode::Interval,
                Schedule::OneShot { .. } => RunnerMode::OneShot,
            },
            RunnerHandle::Coordinated(_) => RunnerMode::Coordinated,
            RunnerHandle::Listener { .. } => RunnerMode::Listening,
        }
    }

    fn is_active(&self) -> bool {
        match self {
            RunnerHandle::Local(runner) => !runner.is_paused() && !runner.is_terminated(),
            RunnerHandle::Coordinated(delegate) => delegate.is_active(),
            RunnerHandle::Listener { active, .. } => *active,
        }
    }
}

// ----------------------------------------------------------------------------
// Endpoint Lifecycle Manager
// ----------------------------------------------------------------------------

/// Starts, stops and toggles inbound endpoints
pub struct EndpointLifecycleManager {
    runners: DashMap<String, RunnerHandle>,
    /// Listening port to owning endpoint name
    ports: DashMap<u16, String>,
    reactor: Arc<ProtocolReactor>,
    scheduler: Option<Arc<dyn DistributedScheduler>>,
    scheduler_config: SchedulerConfig,
    job_group: String,
}

impl EndpointLifecycleManager {
    pub fn new(
        reactor: Arc<ProtocolReactor>,
        scheduler: Option<Arc<dyn DistributedScheduler>>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            runners: DashMap::new(),
            ports: DashMap::new(),
            reactor,
            scheduler,
            scheduler_config,
            job_group: DEFAULT_JOB_GROUP.to_string(),
        }
    }

    /// Register coordinated jobs under `group` instead of the default group
    pub fn with_job_group<G: Into<String>>(mut self, group: G) -> Self {
        self.job_group = group.into();
        self
    }

    pub fn reactor(&self) -> &Arc<ProtocolReactor> {
        &self.reactor
    }

    // ------------------------------------------------------------------------
    // Polling Endpoints
    // ------------------------------------------------------------------------

    /// Start a polling endpoint running `task`
    ///
    /// Coordinated endpoints are registered with the distributed scheduler;
    /// if that fails the endpoint is not started and there is no fallback to
    /// a local runner. Starting an endpoint that is already running is a
    /// no-op.
    pub fn start_endpoint(
        &self,
        config: &EndpointConfig,
        task: Arc<dyn PollTask>,
    ) -> InflowResult<()> {
        let EndpointKind::Polling {
            interval_ms,
            one_shot,
            retry_delay_ms,
        } = config.kind
        else {
            return Err(InflowError::unsupported(
                &config.name,
                "start a listening endpoint as a polling task",
            ));
        };

        let entry = match self.runners.entry(config.name.clone()) {
            Entry::Occupied(_) => {
                debug!(endpoint = %config.name, "Endpoint already started");
                return Ok(());
            }
            Entry::Vacant(entry) => entry,
        };

        let interval = Duration::from_millis(interval_ms);
        let handle = if config.coordination {
            if one_shot {
                return Err(InflowError::config_error(format!(
                    "endpoint '{}' cannot be both one-shot and coordinated",
                    config.name
                )));
            }
            let delegate = self
                .start_coordinated(config, task, interval)
                .map_err(|err| {
                    error!(
                        endpoint = %config.name,
                        error = %err,
                        "Coordinated endpoint not started"
                    );
                    err
                })?;
            RunnerHandle::Coordinated(delegate)
        } else {
            let schedule = if one_shot {
                Schedule::OneShot {
                    retry_delay: Duration::from_millis(retry_delay_ms),
                }
            } else {
                Schedule::Interval(interval)
            };
            let runner = LocalPollingRunner::start(
                config.name.clone(),
                task,
                schedule,
                config.paused_at_start,
            )?;
            RunnerHandle::Local(runner)
        };

        info!(endpoint = %config.name, mode = ?handle.mode(), "Endpoint started");
        entry.insert(handle);
        Ok(())
    }

    fn start_coordinated(
        &self,
        config: &EndpointConfig,
        task: Arc<dyn PollTask>,
        interval: Duration,
    ) -> Result<CoordinatedScheduleDelegate, SchedulerError> {
        let scheduler = self.scheduler.clone().ok_or_else(|| SchedulerError::Unavailable {
            reason: "no distributed scheduler configured".to_string(),
        })?;
        let delegate = CoordinatedScheduleDelegate::new(
            config.name.clone(),
            scheduler,
            self.scheduler_config.interval_floor(),
        );
        delegate.register(task, &self.job_group, interval)?;
        if config.paused_at_start {
            delegate.deactivate()?;
        }
        Ok(delegate)
    }

    // ------------------------------------------------------------------------
    // Listening Endpoints
    // ------------------------------------------------------------------------

    /// Bind a listening endpoint's port on the reactor
    ///
    /// Fails with `EndpointConflict` if another endpoint owns the port and
    /// with `PortUnavailable` if the port cannot be bound.
    pub fn start_listening_endpoint(
        &self,
        config: &EndpointConfig,
        processor: Arc<MessageProcessor>,
    ) -> InflowResult<()> {
        let Some(port) = config.listening_port() else {
            return Err(InflowError::unsupported(
                &config.name,
                "bind a polling endpoint as a listener",
            ));
        };

        match self.ports.entry(port) {
            Entry::Occupied(owner) if owner.get() == &config.name => {
                debug!(endpoint = %config.name, port, "Listening endpoint already started");
                return Ok(());
            }
            Entry::Occupied(owner) => {
                warn!(
                    endpoint = %config.name,
                    port,
                    owner = %owner.get(),
                    "Port already registered to another endpoint"
                );
                return Err(InflowError::EndpointConflict {
                    port,
                    existing: owner.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                if self.runners.contains_key(&config.name) {
                    return Err(InflowError::config_error(format!(
                        "endpoint '{}' is already running",
                        config.name
                    )));
                }

                let active = !config.paused_at_start;
                if active {
                    self.reactor.start()?;
                    if !self.reactor.bind(port, processor.clone()) {
                        error!(endpoint = %config.name, port, "Listening endpoint not started");
                        return Err(InflowError::port_unavailable(port));
                    }
                }
                slot.insert(config.name.clone());
                self.runners.insert(
                    config.name.clone(),
                    RunnerHandle::Listener {
                        port,
                        processor,
                        active,
                    },
                );
                info!(endpoint = %config.name, port, active, "Listening endpoint started");
                Ok(())
            }
        }
    }

    /// Unbind a listening endpoint and release its port registration
    pub fn close_listening_endpoint(&self, port: u16) -> bool {
        let Some((_, name)) = self.ports.remove(&port) else {
            return false;
        };
        if let Some((_, RunnerHandle::Listener { active, .. })) = self.runners.remove(&name) {
            if active {
                self.reactor.unbind(port);
            }
        }
        info!(endpoint = %name, port, "Listening endpoint closed");
        true
    }

    // ------------------------------------------------------------------------
    // Lifecycle Operations
    // ------------------------------------------------------------------------

    /// Stop and discard an endpoint; `false` if it was not running
    pub fn stop_endpoint(&self, name: &str) -> bool {
        let Some((_, handle)) = self.runners.remove(name) else {
            debug!(endpoint = %name, "Stop requested for an endpoint that is not running");
            return false;
        };

        match handle {
            RunnerHandle::Local(runner) => {
                runner.terminate();
                if !runner.wait_for_exit(RUNNER_EXIT_TIMEOUT) {
                    warn!(endpoint = %name, "Runner still executing a cycle after terminate");
                }
            }
            RunnerHandle::Coordinated(delegate) => {
                if let Err(err) = delegate.unregister() {
                    warn!(endpoint = %name, error = %err, "Failed to unregister coordinated job");
                }
            }
            RunnerHandle::Listener { port, active, .. } => {
                self.ports.remove(&port);
                if active {
                    self.reactor.unbind(port);
                }
            }
        }
        info!(endpoint = %name, "Endpoint stopped");
        true
    }

    /// Resume a deactivated endpoint
    pub fn activate(&self, name: &str) -> InflowResult<()> {
        let mut handle = self
            .runners
            .get_mut(name)
            .ok_or_else(|| InflowError::endpoint_not_found(name))?;

        match handle.value_mut() {
            RunnerHandle::Local(runner) => runner.resume(),
            RunnerHandle::Coordinated(delegate) => delegate.activate()?,
            RunnerHandle::Listener {
                port,
                processor,
                active,
            } => {
                if !*active {
                    self.reactor.start()?;
                    if !self.reactor.bind(*port, processor.clone()) {
                        error!(endpoint = %name, port = *port, "Failed to re-bind listening endpoint");
                        return Err(InflowError::port_unavailable(*port));
                    }
                    *active = true;
                    info!(endpoint = %name, port = *port, "Listening endpoint activated");
                }
            }
        }
        Ok(())
    }

    /// Pause an endpoint without discarding it
    pub fn deactivate(&self, name: &str) -> InflowResult<()> {
        let mut handle = self
            .runners
            .get_mut(name)
            .ok_or_else(|| InflowError::endpoint_not_found(name))?;

        match handle.value_mut() {
            RunnerHandle::Local(runner) => runner.pause(),
            RunnerHandle::Coordinated(delegate) => delegate.deactivate()?,
            RunnerHandle::Listener { port, active, .. } => {
                if *active {
                    self.reactor.unbind(*port);
                    *active = false;
                    info!(endpoint = %name, port = *port, "Listening endpoint deactivated");
                }
            }
        }
        Ok(())
    }

    /// Whether `name` is running but deactivated
    ///
    /// Unknown endpoints are reported as deactivated.
    pub fn is_deactivated(&self, name: &str) -> bool {
        self.runners
            .get(name)
            .map(|handle| !handle.is_active())
            .unwrap_or(true)
    }

    /// Re-arm a one-shot endpoint
    pub fn retrigger(&self, name: &str) -> InflowResult<()> {
        let handle = self
            .runners
            .get(name)
            .ok_or_else(|| InflowError::endpoint_not_found(name))?;
        match handle.value() {
            RunnerHandle::Local(runner) if matches!(runner.schedule(), Schedule::OneShot { .. }) => {
                runner.retrigger();
                Ok(())
            }
            _ => Err(InflowError::unsupported(name, "retrigger")),
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<EndpointStatus> {
        self.runners.get(name).map(|handle| {
            let (cycles, port) = match handle.value() {
                RunnerHandle::Local(runner) => (Some(runner.cycles()), None),
                RunnerHandle::Coordinated(_) => (None, None),
                RunnerHandle::Listener { port, .. } => (None, Some(*port)),
            };
            EndpointStatus {
                name: name.to_string(),
                mode: handle.mode(),
                active: handle.is_active(),
                cycles,
                port,
            }
        })
    }

    /// Names of every running endpoint, sorted
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Endpoint owning `port`, if any
    pub fn port_owner(&self, port: u16) -> Option<String> {
        self.ports.get(&port).map(|owner| owner.clone())
    }

    /// Stop every endpoint
    pub fn shutdown(&self) -> usize {
        let stopped = self
            .endpoints()
            .into_iter()
            .filter(|name| self.stop_endpoint(name))
            .count();
        if stopped > 0 {
            info!(stopped, "All endpoints stopped");
        }
        stopped
    }
}

impl Drop for EndpointLifecycleManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{JobListener, JobSpec, TriggerState};
    use inflow_core::{FnTask, ReactorConfig, TaskError};
    use std::sync::Mutex;

    fn idle_task() -> Arc<dyn PollTask> {
        Arc::new(FnTask::new(|| Ok::<(), TaskError>(())))
    }

    /// Scheduler that refuses every registration
    struct RefusingScheduler;

    impl DistributedScheduler for RefusingScheduler {
        fn schedule(&self, job: JobSpec) -> Result<(), SchedulerError> {
            Err(SchedulerError::RegistrationFailed {
                job: job.name,
                reason: "store offline".to_string(),
            })
        }
        fn is_scheduled(&self, _name: &str) -> bool {
            false
        }
        fn pause(&self, name: &str) -> Result<(), SchedulerError> {
            Err(SchedulerError::JobNotFound { job: name.to_string() })
        }
        fn resume(&self, name: &str) -> Result<(), SchedulerError> {
            Err(SchedulerError::JobNotFound { job: name.to_string() })
        }
        fn delete(&self, _name: &str) -> Result<bool, SchedulerError> {
            Ok(false)
        }
        fn trigger_states(&self, _name: &str) -> Vec<TriggerState> {
            Vec::new()
        }
        fn add_listener(&self, _name: &str, _listener: Arc<dyn JobListener>) {}
    }

    /// Scheduler that records registrations without running them
    #[derive(Default)]
    struct RecordingScheduler {
        jobs: Mutex<Vec<JobSpec>>,
    }

    impl DistributedScheduler for RecordingScheduler {
        fn schedule(&self, job: JobSpec) -> Result<(), SchedulerError> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
        fn is_scheduled(&self, name: &str) -> bool {
            self.jobs.lock().unwrap().iter().any(|job| job.name == name)
        }
        fn pause(&self, _name: &str) -> Result<(), SchedulerError> {
            Ok(())
        }
        fn resume(&self, _name: &str) -> Result<(), SchedulerError> {
            Ok(())
        }
        fn delete(&self, name: &str) -> Result<bool, SchedulerError> {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|job| job.name != name);
            Ok(jobs.len() != before)
        }
        fn trigger_states(&self, _name: &str) -> Vec<TriggerState> {
            vec![TriggerState::Normal]
        }
        fn add_listener(&self, _name: &str, _listener: Arc<dyn JobListener>) {}
    }

    fn manager<S: DistributedScheduler + 'static>(
        scheduler: Option<Arc<S>>,
    ) -> EndpointLifecycleManager {
        let scheduler = scheduler.map(|s| s as Arc<dyn DistributedScheduler>);
        EndpointLifecycleManager::new(
            Arc::new(ProtocolReactor::new(ReactorConfig::testing())),
            scheduler,
            SchedulerConfig::testing(),
        )
    }

    #[test]
    fn test_local_endpoint_lifecycle() {
        let manager = manager::<RefusingScheduler>(None);
        let config = EndpointConfig::polling("poller", 20);

        manager.start_endpoint(&config, idle_task()).unwrap();
        manager.start_endpoint(&config, idle_task()).unwrap();
        assert_eq!(manager.endpoints(), vec!["poller".to_string()]);
        assert!(!manager.is_deactivated("poller"));

        manager.deactivate("poller").unwrap();
        assert!(manager.is_deactivated("poller"));
        manager.activate("poller").unwrap();
        assert!(!manager.is_deactivated("poller"));

        assert!(manager.stop_endpoint("poller"));
        assert!(!manager.stop_endpoint("poller"));
        assert!(manager.is_deactivated("poller"));
    }

    #[test]
    fn test_registration_failure_does_not_fall_back() {
        let manager = manager(Some(Arc::new(RefusingScheduler)));
        let config = EndpointConfig::polling("clustered", 5_000).with_coordination(true);

        let err = manager.start_endpoint(&config, idle_task()).unwrap_err();
        assert!(matches!(
            err,
            InflowError::Scheduler(SchedulerError::RegistrationFailed { .. })
        ));
        assert!(!manager.is_running("clustered"));
    }

    #[test]
    fn test_coordinated_without_scheduler_is_rejected() {
        let manager = manager::<RefusingScheduler>(None);
        let config = EndpointConfig::polling("clustered", 5_000).with_coordination(true);
        let err = manager.start_endpoint(&config, idle_task()).unwrap_err();
        assert!(matches!(
            err,
            InflowError::Scheduler(SchedulerError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_coordinated_registration_uses_job_group_and_floor() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = manager(Some(scheduler.clone())).with_job_group("north");
        let config = EndpointConfig::polling("clustered", 1).with_coordination(true);

        manager.start_endpoint(&config, idle_task()).unwrap();
        {
            let jobs = scheduler.jobs.lock().unwrap();
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].group, "north");
            assert_eq!(jobs[0].interval, SchedulerConfig::testing().interval_floor());
        }
        assert_eq!(
            manager.status("clustered").map(|status| status.mode),
            Some(RunnerMode::Coordinated)
        );

        assert!(manager.stop_endpoint("clustered"));
        assert!(scheduler.jobs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_one_shot_coordination_is_a_configuration_error() {
        let manager = manager(Some(Arc::new(RecordingScheduler::default())));
        let config = EndpointConfig::polling("consumer", 1_000)
            .with_coordination(true)
            .with_one_shot(true);
        assert!(matches!(
            manager.start_endpoint(&config, idle_task()),
            Err(InflowError::Configuration { .. })
        ));
    }

    #[test]
    fn test_unknown_endpoint_operations() {
        let manager = manager::<RefusingScheduler>(None);
        assert!(matches!(
            manager.activate("ghost"),
            Err(InflowError::EndpointNotFound { .. })
        ));
        assert!(matches!(
            manager.deactivate("ghost"),
            Err(InflowError::EndpointNotFound { .. })
        ));
        assert!(manager.status("ghost").is_none());
        assert!(!manager.close_listening_endpoint(1));
    }
}
