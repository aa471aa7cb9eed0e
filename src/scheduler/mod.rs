//! Cron-triggered job submission.

pub mod cron;

// Re-export common types
pub use self::cron::{
    normalize_cron, parse_cron, preview, validate, ScheduleError, ScheduleStore, ScheduledTask,
    Scheduler, UpcomingRun, MAX_PREVIEW_HOURS, MAX_PREVIEW_RUNS,
};
