mod shard;
mod store;

pub(crate) use shard::ParameterShard;
pub use store::ParameterStore;
