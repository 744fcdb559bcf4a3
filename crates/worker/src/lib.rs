// Run runtime
//
// In-process execution of runs next to the API server:
// - RunSupervisor: one task per run, cancellation, drain on shutdown
// - Scheduler: cron tick loop that claims fire times and starts runs
// - RuntimeConfig: environment-driven limits for every runtime component

pub mod config;
pub mod scheduler;
pub mod supervisor;

pub use config::RuntimeConfig;
pub use scheduler::{FiredRun, Scheduler, SchedulerHandle};
pub use supervisor::{RunSupervisor, ShutdownReport};
