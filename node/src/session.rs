use std::{
    fs::File,
    io::{self, BufWriter},
    num::NonZeroUsize,
    path::Path,
    sync::{Arc, atomic::AtomicBool},
    thread,
};

use log::info;
use model_sync::{
    Checkpoint, Coordinator, ModelSync, Peer, Result, Standalone, SyncModel, util::with_suffix,
};
use rand::{SeedableRng, rngs::StdRng};
use tokio::task;

use crate::{
    config::{NodeConfig, TrainingConfig},
    driver::drive,
    model::LinearModel,
    trainer::Trainer,
};

/// Runs a whole node: joins the cluster, trains on every worker thread and hands back the
/// final parameters.
///
/// # Arguments
/// * `config` - The validated node configuration.
/// * `stop` - Set to wind the workers down early.
///
/// # Returns
/// The checkpoint of the canonical buffer, also written to disk when configured.
pub async fn run(config: NodeConfig, stop: Arc<AtomicBool>) -> Result<Checkpoint> {
    let NodeConfig {
        sync: sync_config,
        training,
    } = config;

    let rank = sync_config.rank();
    let threads = sync_config.num_threads;
    let sync = Arc::new(ModelSync::new(&sync_config));

    let mut rng = StdRng::seed_from_u64(training.seed);
    let model = LinearModel::random(training.features, &mut rng);
    sync.initialize(&model);

    let driver = match &sync_config.cluster {
        None => tokio::spawn(drive(Standalone::new(Arc::clone(&sync)), Arc::clone(&sync))),
        Some(cluster) if cluster.is_coordinator() => {
            let coordinator = Coordinator::bind(Arc::clone(&sync), cluster.clone()).await?;
            tokio::spawn(drive(coordinator, Arc::clone(&sync)))
        }
        Some(cluster) => {
            let peer = Peer::connect(Arc::clone(&sync), cluster).await?;
            tokio::spawn(drive(peer, Arc::clone(&sync)))
        }
    };

    let total = training.samples_per_worker * threads.get();
    info!(
        rank = rank,
        threads = threads.get(),
        expected_rounds = sync.schedule().expected_rounds(total);
        "training started"
    );

    let workers = task::spawn_blocking({
        let sync = Arc::clone(&sync);
        let training = training.clone();
        move || train(sync, training, threads, stop)
    });

    let trained = workers.await.map_err(io::Error::other)?;
    sync.schedule().close();
    let windows = driver.await.map_err(io::Error::other)?;

    let samples = trained?;
    windows?;

    info!(rank = rank, samples = samples; "{}", *sync.lock_stats());

    let checkpoint = sync.checkpoint(&model.layout())?;
    if let Some(path) = &training.checkpoint {
        write_checkpoint(&with_suffix(path, rank), &checkpoint)?;
    }

    Ok(checkpoint)
}

/// Trains on `threads` worker threads until every one of them is done.
///
/// # Returns
/// The amount of samples processed by every worker together.
fn train(
    sync: Arc<ModelSync>,
    config: TrainingConfig,
    threads: NonZeroUsize,
    stop: Arc<AtomicBool>,
) -> Result<usize> {
    thread::scope(|s| {
        let handles: Vec<_> = (0..threads.get())
            .map(|_| {
                let trainer = Trainer::new(Arc::clone(&sync), config.clone(), Arc::clone(&stop));
                s.spawn(move || trainer.run())
            })
            .collect();

        handles.into_iter().try_fold(0, |total, handle| -> Result<usize> {
            let samples = handle
                .join()
                .map_err(|_| io::Error::other("worker thread panicked"))??;
            Ok(total + samples)
        })
    })
}

fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), checkpoint).map_err(io::Error::from)?;

    info!(params = checkpoint.num_params; "checkpoint written to {}", path.display());
    Ok(())
}
