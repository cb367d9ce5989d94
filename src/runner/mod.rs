//! Worker process execution — queue, spawner, watchdog, and the failure
//! classifier that turns raw outcomes into an actionable taxonomy.

pub mod classify;
pub mod queue;
pub mod spawner;
pub mod types;
pub mod watchdog;

pub use queue::WorkerRunner;
pub use types::{EnvPolicy, ExecutionOutcome, ExecutionRequest, FailureCode, TaskFailure};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogSignal};
