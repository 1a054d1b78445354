//! A training node: a synthetic linear model trained by a pool of worker threads that share
//! their parameters through `model_sync`.

pub mod config;
pub mod driver;
pub mod logging;
pub mod model;
pub mod session;
pub mod trainer;

pub use config::{NodeConfig, TrainingConfig};
pub use model::{LinearModel, SyntheticData};
pub use session::run;
pub use trainer::Trainer;
