use std::sync::Arc;

use log::{debug, info};
use model_sync::{Exchanger, ModelSync, Result, Round};

/// Runs an exchange window whenever one is due, until the schedule is closed.
///
/// The exchanger is shut down on every exit path.
///
/// # Arguments
/// * `exchanger` - The exchanger of this process.
/// * `sync` - The synchronizer whose schedule drives the windows.
///
/// # Returns
/// The amount of windows run, or the first fatal error.
pub async fn drive<E>(mut exchanger: E, sync: Arc<ModelSync>) -> Result<usize>
where
    E: Exchanger + Send + 'static,
{
    let windows = run_windows(&mut exchanger, &sync).await;
    let shutdown = exchanger.shutdown().await;

    let windows = windows?;
    shutdown?;

    info!(rank = sync.rank(), windows = windows; "exchange driver stopped");
    Ok(windows)
}

async fn run_windows<E: Exchanger>(exchanger: &mut E, sync: &ModelSync) -> Result<usize> {
    let schedule = sync.schedule();
    let mut windows = 0;

    while schedule.due().await {
        windows += 1;

        match exchanger.exchange_window().await? {
            Round::Served(rounds) => {
                debug!(rank = sync.rank(), window = windows, served = rounds; "window done");
            }
            round => debug!(rank = sync.rank(), window = windows; "window done: {round:?}"),
        }
    }

    Ok(windows)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use model_sync::{ParallelConfig, Standalone};

    use super::*;
    use crate::model::LinearModel;

    #[tokio::test(flavor = "multi_thread")]
    async fn windows_follow_the_schedule() {
        let config = ParallelConfig {
            merge_size: std::num::NonZeroUsize::new(10).unwrap(),
            ..Default::default()
        };
        let sync = Arc::new(ModelSync::new(&config));
        sync.initialize(&LinearModel::zeros(2));

        let driver = tokio::spawn(drive(Standalone::new(Arc::clone(&sync)), Arc::clone(&sync)));

        for _ in 0..3 {
            assert!(sync.record_samples(10));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        sync.schedule().close();
        let windows = tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(windows, 3);
    }
}
