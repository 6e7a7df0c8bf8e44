//! Viewport schedulers: stateful decision functions mapping the current
//! viewport and candidate set onto load/cancel actions.

mod fairness;
mod inflight;
mod policy;

pub use fairness::FairnessGuard;
pub use inflight::InflightTracker;
pub use policy::{
    scheduler_for, CancelOnlyScheduler, PriorityOnlyScheduler, QprismScheduler, SchedulePolicy,
};
