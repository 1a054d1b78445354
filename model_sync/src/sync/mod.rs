mod allocator;
mod model_sync;
mod schedule;
mod stats;

pub use allocator::{WorkerAllocator, WorkerHandle};
pub use model_sync::{ModelSync, ParamsGuard};
pub use schedule::MergeSchedule;
pub use stats::TrainStats;
