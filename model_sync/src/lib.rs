//! Shares one model's flattened parameters between the worker threads of a process and
//! between cooperating processes.
//!
//! Workers push updates into a `ModelSync`, which merges them into a canonical buffer with
//! one of the `MergeFn` strategies. An `Exchanger` periodically reconciles that buffer with
//! the coordinating rank.

pub mod config;
pub mod error;
pub mod exchange;
pub mod merge;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::{ClusterConfig, MergeFnSpec, ParallelConfig};
pub use error::{Result, SyncErr};
pub use exchange::{Coordinator, Exchanger, Peer, Round, Standalone};
pub use merge::{GradientClip, MergeFn};
pub use model::{Checkpoint, ModelLayout, SyncModel, TensorShape};
pub use sync::{ModelSync, ParamsGuard, TrainStats, WorkerHandle};
