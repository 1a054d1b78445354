use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, info};
use model_sync::{ModelSync, Result, SyncModel, WorkerHandle};

use crate::{
    config::TrainingConfig,
    model::{LinearModel, SyntheticData},
};

/// The training loop of one worker thread.
///
/// Every batch produces a gradient that is merged into the shared model, then the worker
/// continues from the merged parameters.
pub struct Trainer {
    sync: Arc<ModelSync>,
    handle: WorkerHandle,
    config: TrainingConfig,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    /// Creates a new `Trainer` and registers it as a worker of `sync`.
    ///
    /// # Arguments
    /// * `sync` - The initialized synchronizer of this process.
    /// * `config` - The training settings.
    /// * `stop` - Set when the process must wind down early.
    pub fn new(sync: Arc<ModelSync>, config: TrainingConfig, stop: Arc<AtomicBool>) -> Self {
        let handle = sync.register_worker();

        Self {
            sync,
            handle,
            config,
            stop,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle
    }

    /// Trains until `samples_per_worker` samples were processed or a stop is requested.
    ///
    /// # Returns
    /// The amount of processed samples.
    pub fn run(self) -> Result<usize> {
        let Self {
            sync,
            handle,
            config,
            stop,
        } = self;

        let stream = ((handle.rank as u64) << 32) | handle.data_shard as u64;
        let mut data = SyntheticData::new(config.features, config.seed, stream, config.noise);

        let mut model = LinearModel::zeros(config.features);
        sync.pull_params(&mut model)?;

        let lr = config.learning_rate;
        let consumes_gradient = sync.merge_fn().consumes_gradient();
        let dim = model.num_params();

        let mut grad = vec![0.; dim];
        let mut params = vec![0.; dim];
        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        let mut processed = 0;

        debug!(worker = handle.index, data_shard = handle.data_shard; "worker started");

        while processed < config.samples_per_worker && !stop.load(Ordering::Relaxed) {
            let n = config
                .batch_size
                .get()
                .min(config.samples_per_worker - processed);

            data.fill(n, &mut xs, &mut ys);
            let (loss, correct) = model.backward(&xs, &ys, config.tolerance);
            model.get_gradient(&mut grad);

            if !consumes_gradient {
                grad.iter_mut().for_each(|g| *g *= -lr);
            }

            sync.sync_step(&grad, lr, &mut params)?;
            model.set_params(&params);

            sync.lock_stats().add_batch(n, loss, correct);
            sync.record_samples(n);
            processed += n;
        }

        info!(worker = handle.index, samples = processed; "worker finished");
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use model_sync::{MergeFnSpec, ParallelConfig};

    use super::*;

    fn trained(merge_fn: MergeFnSpec, learning_rate: f32) -> (Arc<ModelSync>, SyntheticData) {
        let sync = Arc::new(ModelSync::new(&ParallelConfig {
            merge_fn,
            ..Default::default()
        }));
        sync.initialize(&LinearModel::zeros(2));

        let config = TrainingConfig {
            features: 2,
            samples_per_worker: 4_000,
            batch_size: std::num::NonZeroUsize::new(8).unwrap(),
            learning_rate,
            noise: 0.,
            ..Default::default()
        };
        let data = SyntheticData::new(2, config.seed, 0, 0.);

        let trainer = Trainer::new(Arc::clone(&sync), config, Arc::new(AtomicBool::new(false)));
        assert_eq!(trainer.run().unwrap(), 4_000);

        (sync, data)
    }

    #[test]
    fn global_sum_converges_to_the_target() {
        let (sync, data) = trained(MergeFnSpec::GlobalSum, 0.1);

        let params = sync.snapshot().unwrap();
        for (p, t) in params.iter().zip(data.truth()) {
            assert!((p - t).abs() < 0.05, "{params:?} vs {:?}", data.truth());
        }

        let stats = sync.lock_stats();
        assert_eq!(stats.frames, 4_000);
        assert_eq!(stats.merges, 500);
    }

    #[test]
    fn adaptive_merge_reduces_the_loss() {
        let (sync, data) = trained(MergeFnSpec::default(), 0.01);

        let start: f32 = data.truth().iter().map(|t| t * t).sum();
        let end: f32 = sync
            .snapshot()
            .unwrap()
            .iter()
            .zip(data.truth())
            .map(|(p, t)| (p - t) * (p - t))
            .sum();

        assert!(end < start);
    }

    #[test]
    fn stop_flag_ends_training_early() {
        let sync = Arc::new(ModelSync::new(&ParallelConfig::default()));
        sync.initialize(&LinearModel::zeros(2));

        let trainer = Trainer::new(
            Arc::clone(&sync),
            TrainingConfig {
                features: 2,
                ..Default::default()
            },
            Arc::new(AtomicBool::new(true)),
        );

        assert_eq!(trainer.handle().index, 0);
        assert_eq!(trainer.run().unwrap(), 0);
    }
}
