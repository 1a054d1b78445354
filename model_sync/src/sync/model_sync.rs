use std::{num::NonZeroUsize, sync::OnceLock};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};

use super::{MergeSchedule, TrainStats, WorkerAllocator, WorkerHandle};
use crate::{
    config::{MergeFnSpec, ParallelConfig},
    error::{Result, SyncErr},
    merge::{GradientClip, MergeCtx, MergeFn},
    model::{Checkpoint, ModelLayout, SyncModel},
    storage::ParameterStore,
};

/// Owns the canonical parameters of a process and serializes every access to them.
///
/// Shared between the worker threads and the exchange task through an `Arc`. The canonical
/// buffer only exists after `initialize`, every other accessor fails with `Uninitialized`
/// before that.
#[derive(Debug)]
pub struct ModelSync {
    rank: usize,
    asgd_lock: bool,
    merge_fn: MergeFnSpec,
    shard_size: Option<NonZeroUsize>,
    clip: Option<GradientClip>,
    model_lock: Mutex<()>,
    store: OnceLock<ParameterStore>,
    stats: Mutex<TrainStats>,
    allocator: WorkerAllocator,
    schedule: MergeSchedule,
}

/// Exclusive access to the canonical buffer, released when dropped.
pub struct ParamsGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    store: &'a ParameterStore,
    clip: Option<GradientClip>,
}

impl ParamsGuard<'_> {
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Merges `incoming` into the canonical buffer with the active merge function.
    pub fn merge(&self, incoming: &[f32], learning_rate: f32) -> Result<()> {
        let ctx = MergeCtx::new(incoming, learning_rate, self.clip);
        self.store.merge(incoming, &ctx)
    }

    /// Copies the canonical buffer into `out`.
    pub fn pull(&self, out: &mut [f32]) -> Result<()> {
        self.store.pull(out)
    }

    pub fn snapshot(&self) -> Vec<f32> {
        self.store.snapshot()
    }
}

impl ModelSync {
    /// Creates a new uninitialized `ModelSync`.
    ///
    /// # Arguments
    /// * `config` - The options of the parallel run.
    ///
    /// # Returns
    /// A new `ModelSync` instance.
    pub fn new(config: &ParallelConfig) -> Self {
        Self {
            rank: config.rank(),
            asgd_lock: config.asgd_lock,
            merge_fn: config.merge_fn,
            shard_size: config.shard_size,
            clip: config.clip,
            model_lock: Mutex::new(()),
            store: OnceLock::new(),
            stats: Mutex::new(TrainStats::default()),
            allocator: WorkerAllocator::new(),
            schedule: MergeSchedule::new(config.merge_size),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn merge_fn(&self) -> MergeFnSpec {
        self.merge_fn
    }

    /// Captures the parameters of `model` as the canonical buffer.
    ///
    /// Only the first caller initializes, concurrent callers wait for it and leave the buffer
    /// untouched.
    ///
    /// # Returns
    /// `true` for the caller that performed the initialization.
    pub fn initialize<M: SyncModel + ?Sized>(&self, model: &M) -> bool {
        let _lock = self.model_lock.lock();

        if self.store.get().is_some() {
            return false;
        }

        let mut params = vec![0.; model.num_params()];
        model.get_params(&mut params);

        let nparams = params.len();
        let shard_size = self
            .shard_size
            .or(NonZeroUsize::new(nparams))
            .unwrap_or(NonZeroUsize::MIN);

        let spec = self.merge_fn;
        let store = ParameterStore::new(params, shard_size, |p| MergeFn::from_spec(spec, p));
        let nshards = store.num_shards();

        if self.store.set(store).is_err() {
            return false;
        }

        info!(
            rank = self.rank,
            params = nparams,
            shards = nshards,
            asgd_lock = self.asgd_lock;
            "model synchronizer initialized"
        );

        true
    }

    pub fn is_initialized(&self) -> bool {
        self.store.get().is_some()
    }

    /// The amount of parameters in the canonical buffer, `0` before initialization.
    pub fn dim(&self) -> usize {
        self.store.get().map_or(0, ParameterStore::len)
    }

    fn store(&self) -> Result<&ParameterStore> {
        self.store.get().ok_or(SyncErr::Uninitialized)
    }

    /// The parameter lock, only taken for worker operations when `asgd_lock` is on.
    fn worker_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.asgd_lock.then(|| self.model_lock.lock())
    }

    /// Takes the parameter lock.
    ///
    /// # Returns
    /// A guard over the canonical buffer or `Uninitialized`.
    pub fn lock_params(&self) -> Result<ParamsGuard<'_>> {
        let store = self.store()?;

        Ok(ParamsGuard {
            _lock: self.model_lock.lock(),
            store,
            clip: self.clip,
        })
    }

    /// Takes the stats lock, independent of the parameter lock.
    pub fn lock_stats(&self) -> MutexGuard<'_, TrainStats> {
        self.stats.lock()
    }

    /// Merges one worker's update into the canonical buffer.
    ///
    /// # Arguments
    /// * `incoming` - A flat update (or raw gradient for the adaptive merge function).
    /// * `learning_rate` - The learning rate of the caller's current step.
    ///
    /// # Returns
    /// `Uninitialized` or `SizeMismatch` on contract violations.
    pub fn push_merge(&self, incoming: &[f32], learning_rate: f32) -> Result<()> {
        let store = self.store()?;
        let ctx = MergeCtx::new(incoming, learning_rate, self.clip);

        let _lock = self.worker_lock();
        store.merge(incoming, &ctx)
    }

    /// Copies the canonical buffer into `out`.
    pub fn pull_into(&self, out: &mut [f32]) -> Result<()> {
        let store = self.store()?;

        let _lock = self.worker_lock();
        store.pull(out)
    }

    /// Overwrites the parameters of `model` with the canonical buffer.
    ///
    /// The lock is released before the model is written.
    pub fn pull_params<M: SyncModel + ?Sized>(&self, model: &mut M) -> Result<()> {
        let mut params = vec![0.; self.dim()];
        self.pull_into(&mut params)?;
        model.set_params(&params);
        Ok(())
    }

    /// Merges `incoming` and copies the result into `out` within one lock acquisition.
    pub fn sync_step(&self, incoming: &[f32], learning_rate: f32, out: &mut [f32]) -> Result<()> {
        let store = self.store()?;
        let ctx = MergeCtx::new(incoming, learning_rate, self.clip);

        let _lock = self.worker_lock();
        store.merge(incoming, &ctx)?;
        store.pull(out)
    }

    /// Copies the whole canonical buffer under the parameter lock.
    pub fn snapshot(&self) -> Result<Vec<f32>> {
        Ok(self.lock_params()?.snapshot())
    }

    /// Applies the answer of a cross-process exchange: `canonical += remote - snapshot`.
    ///
    /// # Arguments
    /// * `snapshot` - The buffer this process sent.
    /// * `remote` - The buffer the coordinator answered with.
    pub fn reconcile(&self, snapshot: &[f32], remote: &[f32]) -> Result<()> {
        let store = self.store()?;

        let _lock = self.model_lock.lock();
        store.reconcile(snapshot, remote)?;
        debug!(rank = self.rank; "reconciled with the coordinator");
        Ok(())
    }

    /// Replaces the canonical buffer by the mean of itself and `others`.
    ///
    /// # Returns
    /// The resulting buffer, taken under the same lock acquisition.
    pub fn average_with(&self, others: &[&[f32]]) -> Result<Vec<f32>> {
        let store = self.store()?;

        let _lock = self.model_lock.lock();
        store.average_with(others)?;
        Ok(store.snapshot())
    }

    /// Replaces the canonical buffer by `params`.
    pub fn overwrite(&self, params: &[f32]) -> Result<()> {
        let store = self.store()?;

        let _lock = self.model_lock.lock();
        store.overwrite(params)
    }

    /// Starts a new synchronization epoch for the merge state.
    pub fn reset_epoch(&self) -> Result<()> {
        let store = self.store()?;

        let _lock = self.model_lock.lock();
        store.reset_epoch();
        Ok(())
    }

    pub fn next_worker_index(&self) -> usize {
        self.allocator.next_worker_index()
    }

    pub fn next_data_shard_index(&self) -> usize {
        self.allocator.next_data_shard_index()
    }

    /// Hands out the indices of a new worker of this process.
    pub fn register_worker(&self) -> WorkerHandle {
        self.allocator.register(self.rank)
    }

    /// Reports processed samples to the exchange cadence.
    ///
    /// # Returns
    /// `true` if an exchange became due.
    pub fn record_samples(&self, n: usize) -> bool {
        self.schedule.record(n)
    }

    pub fn schedule(&self) -> &MergeSchedule {
        &self.schedule
    }

    /// Hands the canonical buffer to the serialization layer.
    ///
    /// # Arguments
    /// * `layout` - The tensor layout of the model, must describe `dim()` parameters.
    pub fn checkpoint(&self, layout: &ModelLayout) -> Result<Checkpoint> {
        let params = self.snapshot()?;

        if layout.num_params() != params.len() {
            return Err(SyncErr::SizeMismatch {
                got: layout.num_params(),
                expected: params.len(),
            });
        }

        Ok(Checkpoint {
            num_params: params.len(),
            tensors: layout.tensors.clone(),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::TensorShape;

    struct Flat(Vec<f32>);

    impl SyncModel for Flat {
        fn num_params(&self) -> usize {
            self.0.len()
        }

        fn get_params(&self, out: &mut [f32]) {
            out.copy_from_slice(&self.0);
        }

        fn set_params(&mut self, params: &[f32]) {
            self.0.copy_from_slice(params);
        }

        fn get_gradient(&self, out: &mut [f32]) {
            out.fill(0.);
        }

        fn layout(&self) -> ModelLayout {
            ModelLayout::new(vec![TensorShape::new("w", vec![self.0.len()])])
        }
    }

    fn global_sum_sync() -> ModelSync {
        ModelSync::new(&ParallelConfig {
            merge_fn: MergeFnSpec::GlobalSum,
            ..Default::default()
        })
    }

    #[test]
    fn uninitialized_accessors_fail() {
        let sync = global_sum_sync();

        assert_eq!(sync.dim(), 0);
        assert!(matches!(
            sync.push_merge(&[1.], 0.1),
            Err(SyncErr::Uninitialized)
        ));
        assert!(matches!(
            sync.pull_into(&mut [0.]),
            Err(SyncErr::Uninitialized)
        ));
        assert!(sync.lock_params().is_err());
    }

    #[test]
    fn second_initialize_is_ignored() {
        let sync = global_sum_sync();

        assert!(sync.initialize(&Flat(vec![1., 2.])));
        assert!(!sync.initialize(&Flat(vec![7., 7.])));
        assert_eq!(sync.snapshot().unwrap(), vec![1., 2.]);
    }

    #[test]
    fn sync_step_returns_the_merged_buffer() {
        let sync = global_sum_sync();
        sync.initialize(&Flat(vec![1.; 3]));

        let mut out = [0.; 3];
        sync.sync_step(&[0.5; 3], 0.1, &mut out).unwrap();
        assert_eq!(out, [1.5; 3]);

        let mut model = Flat(vec![0.; 3]);
        sync.pull_params(&mut model).unwrap();
        assert_eq!(model.0, vec![1.5; 3]);
    }

    #[test]
    fn wrong_length_update_is_rejected() {
        let sync = global_sum_sync();
        sync.initialize(&Flat(vec![0.; 4]));

        let err = sync.push_merge(&[1.; 3], 0.1).unwrap_err();
        assert!(matches!(
            err,
            SyncErr::SizeMismatch {
                got: 3,
                expected: 4
            }
        ));
    }

    #[test]
    fn average_with_returns_the_mix() {
        let sync = global_sum_sync();
        sync.initialize(&Flat(vec![2.; 2]));

        let mixed = sync.average_with(&[&[4.; 2][..]]).unwrap();
        assert_eq!(mixed, vec![3.; 2]);
        assert_eq!(sync.snapshot().unwrap(), mixed);
    }

    #[test]
    fn checkpoint_carries_the_layout() {
        let sync = global_sum_sync();
        let model = Flat(vec![1., 2., 3.]);
        sync.initialize(&model);

        let checkpoint = sync.checkpoint(&model.layout()).unwrap();
        assert_eq!(checkpoint.num_params, 3);
        assert_eq!(checkpoint.params, vec![1., 2., 3.]);

        let wrong = ModelLayout::new(vec![TensorShape::new("w", vec![2])]);
        assert!(sync.checkpoint(&wrong).is_err());
    }

    #[test]
    fn workers_get_distinct_handles() {
        let sync = Arc::new(global_sum_sync());

        let a = sync.register_worker();
        let b = sync.register_worker();

        assert_ne!(a.index, b.index);
        assert_ne!(a.data_shard, b.data_shard);
    }

    #[test]
    fn guard_merges_and_pulls_under_one_lock() {
        let sync = global_sum_sync();
        sync.initialize(&Flat(vec![0.; 3]));

        let guard = sync.lock_params().unwrap();
        guard.merge(&[1., 2., 3.], 0.1).unwrap();

        let mut out = [0.; 3];
        guard.pull(&mut out).unwrap();
        assert_eq!(out, [1., 2., 3.]);
        assert_eq!(guard.len(), 3);
    }

    #[test]
    fn stats_lock_is_independent() {
        let sync = global_sum_sync();
        sync.initialize(&Flat(vec![0.; 2]));

        let _params = sync.lock_params().unwrap();
        let mut stats = sync.lock_stats();
        stats.add_batch(4, 2., 3);

        assert_eq!(stats.frames, 4);
    }
}
