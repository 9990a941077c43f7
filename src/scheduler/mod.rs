//! Two scheduling modes selected once at program start (never both at once):
//! a cooperative single-worker scheduler and a multi-worker work-stealing
//! scheduler with a stop-the-world protocol for GC.

pub mod cooperative;
pub mod deadlock;
pub mod work_stealing;

pub use cooperative::CooperativeScheduler;
pub use work_stealing::{GlobalQueue, StwController, StwStats, WorkStealingScheduler};
