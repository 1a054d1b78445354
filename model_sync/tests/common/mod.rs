#![allow(dead_code)]

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use model_sync::{MergeFnSpec, ModelLayout, ModelSync, ParallelConfig, SyncModel, TensorShape};

/// A model made of a single flat tensor.
pub struct Flat {
    pub params: Vec<f32>,
    pub reads: AtomicUsize,
}

impl Flat {
    pub fn new(params: Vec<f32>) -> Self {
        Self {
            params,
            reads: AtomicUsize::new(0),
        }
    }
}

impl SyncModel for Flat {
    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn get_params(&self, out: &mut [f32]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        out.copy_from_slice(&self.params);
    }

    fn set_params(&mut self, params: &[f32]) {
        self.params.copy_from_slice(params);
    }

    fn get_gradient(&self, out: &mut [f32]) {
        out.fill(0.);
    }

    fn layout(&self) -> ModelLayout {
        ModelLayout::new(vec![TensorShape::new("flat", vec![self.params.len()])])
    }
}

pub fn config(merge_fn: MergeFnSpec, asgd_lock: bool, shard_size: Option<usize>) -> ParallelConfig {
    ParallelConfig {
        merge_fn,
        asgd_lock,
        shard_size: shard_size.and_then(NonZeroUsize::new),
        ..Default::default()
    }
}

/// An initialized synchronizer holding `params`.
pub fn sync_with(config: &ParallelConfig, params: Vec<f32>) -> Arc<ModelSync> {
    let sync = Arc::new(ModelSync::new(config));
    assert!(sync.initialize(&Flat::new(params)));
    sync
}
