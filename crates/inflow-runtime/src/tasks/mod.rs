//! Polling task runners
//!
//! A listener's `PollTask` runs either on a `LocalPollingRunner` owned by this
//! process or through a `CoordinatedScheduleDelegate` registered with a
//! `DistributedScheduler`. `StandaloneScheduler` is the in-process scheduler
//! used when no cluster scheduler is wired in.

pub mod coordinated;
pub mod local;
pub mod standalone;

pub use coordinated::{
    CoordinatedScheduleDelegate, DistributedScheduler, JobListener, JobSpec, TriggerState,
};
pub use local::{LocalPollingRunner, Schedule};
pub use standalone::{AlwaysLeader, MembershipView, StandaloneScheduler};
