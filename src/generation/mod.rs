pub mod barrier;
pub mod coordinator;
pub mod deferred;
pub mod queue;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod stats;

pub use barrier::{PauseBarrier, PauseGuard};
pub use coordinator::{pass_ranges, WorkerCoordinator};
pub use registry::{GeneratorRegistry, PassContext};
pub use request::{AreaCallback, ColumnOutcome, ReadyCallback, RequestSpec};
pub use scheduler::Scheduler;
pub use stats::SchedulerStats;
