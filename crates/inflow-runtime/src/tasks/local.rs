//! Locally owned polling runner
//!
//! A `LocalPollingRunner` executes one `PollTask` on a dedicated OS thread.
//! Interval runners sleep for whatever is left of the interval after each
//! cycle, so the cadence holds even when cycles take time. One-shot runners
//! run once per trigger and wait for `retrigger()` in between. Pausing,
//! resuming and terminating are signalled through one mutex and condition
//! variable, so a sleeping or paused loop observes `terminate()` immediately.

use inflow_core::{InflowResult, PollTask, TaskError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ----------------------------------------------------------------------------
// Runner Configuration
// ----------------------------------------------------------------------------

/// When a runner executes its task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Repeat with a fixed cadence
    Interval(Duration),
    /// Run once per trigger; a failed run re-arms after `retry_delay`
    OneShot { retry_delay: Duration },
}

#[derive(Debug, Default)]
struct RunnerControl {
    paused: bool,
    terminated: bool,
    triggered: bool,
    exited: bool,
    cycles: u64,
}

#[derive(Debug, Default)]
struct RunnerShared {
    control: Mutex<RunnerControl>,
    signal: Condvar,
}

impl RunnerShared {
    fn lock(&self) -> MutexGuard<'_, RunnerControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, RunnerControl>) -> MutexGuard<'a, RunnerControl> {
        self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `duration`, returning early once `wake` holds
    fn sleep<'a>(
        &self,
        guard: MutexGuard<'a, RunnerControl>,
        duration: Duration,
        wake: fn(&RunnerControl) -> bool,
    ) -> MutexGuard<'a, RunnerControl> {
        match self
            .signal
            .wait_timeout_while(guard, duration, |control| !wake(control))
        {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

// ----------------------------------------------------------------------------
// Local Polling Runner
// ----------------------------------------------------------------------------

/// Background loop repeatedly executing one listener's poll cycle
pub struct LocalPollingRunner {
    name: String,
    schedule: Schedule,
    task: Arc<dyn PollTask>,
    shared: Arc<RunnerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LocalPollingRunner {
    /// Spawn the runner thread
    pub fn start<N: Into<String>>(
        name: N,
        task: Arc<dyn PollTask>,
        schedule: Schedule,
        paused_at_start: bool,
    ) -> InflowResult<Self> {
        let name = name.into();
        let shared = Arc::new(RunnerShared {
            control: Mutex::new(RunnerControl {
                paused: paused_at_start,
                triggered: true,
                ..RunnerControl::default()
            }),
            signal: Condvar::new(),
        });

        let thread = {
            let name = name.clone();
            let task = task.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("inflow-poll-{}", name))
                .spawn(move || run_loop(&name, task.as_ref(), schedule, &shared))?
        };

        info!(runner = %name, ?schedule, paused_at_start, "Polling runner started");
        Ok(Self {
            name,
            schedule,
            task,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn pause(&self) {
        let mut control = self.shared.lock();
        if !control.paused && !control.terminated {
            control.paused = true;
            self.shared.signal.notify_all();
            info!(runner = %self.name, "Polling runner paused");
        }
    }

    pub fn resume(&self) {
        let mut control = self.shared.lock();
        if control.paused {
            control.paused = false;
            self.shared.signal.notify_all();
            info!(runner = %self.name, "Polling runner resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminated
    }

    /// Re-arm a one-shot runner so its task runs again
    pub fn retrigger(&self) {
        let mut control = self.shared.lock();
        control.triggered = true;
        self.shared.signal.notify_all();
        debug!(runner = %self.name, "Polling runner re-triggered");
    }

    /// Stop the loop; a paused or sleeping loop wakes up and exits at once
    ///
    /// Does not wait for an executing cycle to finish. Calling it again is a
    /// no-op.
    pub fn terminate(&self) {
        {
            let mut control = self.shared.lock();
            if control.terminated {
                return;
            }
            control.terminated = true;
            self.shared.signal.notify_all();
        }
        self.task.on_terminate();
        info!(runner = %self.name, "Polling runner terminated");
    }

    /// Wait up to `timeout` for the loop thread to exit
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let exited = {
            let control = self.shared.lock();
            match self
                .shared
                .signal
                .wait_timeout_while(control, timeout, |control| !control.exited)
            {
                Ok((control, _)) => control.exited,
                Err(poisoned) => poisoned.into_inner().0.exited,
            }
        };
        if exited {
            let handle = self
                .thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        exited
    }

    /// Number of cycles executed so far
    pub fn cycles(&self) -> u64 {
        self.shared.lock().cycles
    }
}

impl Drop for LocalPollingRunner {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_loop(name: &str, task: &dyn PollTask, schedule: Schedule, shared: &RunnerShared) {
    debug!(runner = %name, "Polling loop running");
    'cycles: loop {
        {
            let mut control = shared.lock();
            loop {
                if control.terminated {
                    break 'cycles;
                }
                let waiting_for_trigger =
                    matches!(schedule, Schedule::OneShot { .. }) && !control.triggered;
                if control.paused || waiting_for_trigger {
                    control = shared.wait(control);
                    continue;
                }
                break;
            }
            control.triggered = false;
        }

        let started = Instant::now();
        let outcome = run_cycle(name, task);

        let mut control = shared.lock();
        control.cycles += 1;
        match schedule {
            Schedule::Interval(interval) => {
                let remaining = interval.saturating_sub(started.elapsed());
                if !remaining.is_zero() {
                    drop(shared.sleep(control, remaining, |c| c.terminated));
                }
            }
            Schedule::OneShot { retry_delay } => {
                if let Err(err) = &outcome {
                    if matches!(err, TaskError::ConnectionLost { .. }) {
                        warn!(runner = %name, ?retry_delay, "Connection lost, reconnecting after retry delay");
                    } else {
                        debug!(runner = %name, ?retry_delay, "Re-arming failed one-shot task");
                    }
                    // A pause cuts the delay short; the retry then waits for resume
                    let mut control =
                        shared.sleep(control, retry_delay, |c| c.terminated || c.paused);
                    control.triggered = true;
                }
            }
        }
    }

    let mut control = shared.lock();
    control.exited = true;
    shared.signal.notify_all();
    debug!(runner = %name, cycles = control.cycles, "Polling loop exited");
}

/// Execute one cycle, logging failures and panics
pub(crate) fn run_cycle(name: &str, task: &dyn PollTask) -> Result<(), TaskError> {
    let result = catch_unwind(AssertUnwindSafe(|| task.execute())).unwrap_or_else(|panic| {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(TaskError::Panicked { reason })
    });
    if let Err(err) = &result {
        error!(runner = %name, error = %err, "Poll cycle failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_core::FnTask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_failed_and_panicking_cycles_do_not_stop_the_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task = Arc::new(FnTask::new(move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => Err(TaskError::failed("first cycle fails")),
                1 => panic!("second cycle panics"),
                _ => Ok(()),
            }
        }));
        let runner =
            LocalPollingRunner::start("flaky", task, Schedule::Interval(Duration::from_millis(5)), false)
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(calls.load(Ordering::SeqCst) >= 4);
        runner.terminate();
        assert!(runner.wait_for_exit(Duration::from_secs(1)));
    }

    #[test]
    fn test_paused_at_start_runs_nothing_until_resumed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task = Arc::new(FnTask::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let runner =
            LocalPollingRunner::start("idle", task, Schedule::Interval(Duration::from_millis(5)), true)
                .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(runner.is_paused());

        runner.resume();
        runner.resume();
        let deadline = Instant::now() + Duration::from_secs(1);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_terminate_is_idempotent_and_notifies_task_once() {
        struct Counting(AtomicUsize);
        impl PollTask for Counting {
            fn execute(&self) -> Result<(), TaskError> {
                Ok(())
            }
            fn on_terminate(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let task = Arc::new(Counting(AtomicUsize::new(0)));
        let runner = LocalPollingRunner::start(
            "once",
            task.clone(),
            Schedule::Interval(Duration::from_millis(10)),
            false,
        )
        .unwrap();
        runner.terminate();
        runner.terminate();
        drop(runner);
        assert_eq!(task.0.load(Ordering::SeqCst), 1);
    }
}
