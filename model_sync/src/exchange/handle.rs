use std::{ops::Deref, sync::Arc};

use tokio::task;

use crate::{error::Result, sync::ModelSync};

/// The exchanger's access to a `ModelSync`.
///
/// It bridges the async runtime with the blocking accessors of the synchronizer, so the
/// parameter lock is only ever taken from a thread that may block.
#[derive(Debug, Clone)]
pub struct SyncHandle(Arc<ModelSync>);

impl Deref for SyncHandle {
    type Target = ModelSync;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SyncHandle {
    pub fn new(sync: Arc<ModelSync>) -> Self {
        Self(sync)
    }

    /// Async call to `ModelSync::snapshot`.
    pub async fn snapshot(&self) -> Result<Vec<f32>> {
        task::block_in_place(|| self.0.snapshot())
    }

    /// Async call to `ModelSync::reconcile`.
    pub async fn reconcile(&self, snapshot: &[f32], remote: &[f32]) -> Result<()> {
        task::block_in_place(|| self.0.reconcile(snapshot, remote))
    }

    /// Async call to `ModelSync::average_with`.
    pub async fn average_with(&self, others: &[&[f32]]) -> Result<Vec<f32>> {
        task::block_in_place(|| self.0.average_with(others))
    }

    /// Async call to `ModelSync::overwrite`.
    pub async fn overwrite(&self, params: &[f32]) -> Result<()> {
        task::block_in_place(|| self.0.overwrite(params))
    }

    /// Async call to `ModelSync::reset_epoch`.
    pub async fn reset_epoch(&self) -> Result<()> {
        task::block_in_place(|| self.0.reset_epoch())
    }
}
