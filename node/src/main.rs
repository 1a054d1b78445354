use std::{
    env, io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::info;
use tokio::signal;

use node::{NodeConfig, logging};

const CONFIG_VAR: &str = "SYNC_CONFIG";
const RANK_VAR: &str = "RANK";

#[tokio::main]
async fn main() -> io::Result<()> {
    let path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_VAR).ok())
        .map(PathBuf::from);
    let rank = env::var(RANK_VAR).ok();

    let config = NodeConfig::load(path.as_deref(), rank.as_deref())?;
    logging::init(&config.sync)?;

    let stop = Arc::new(AtomicBool::new(false));
    let run = node::run(config, Arc::clone(&stop));
    tokio::pin!(run);

    let checkpoint = tokio::select! {
        res = &mut run => res?,
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, winding down");
            stop.store(true, Ordering::Relaxed);
            run.await?
        }
    };

    info!(params = checkpoint.num_params; "wrapping up");
    Ok(())
}
