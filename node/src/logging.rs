use std::{fs::File, io};

use env_logger::{Builder, Target};
use model_sync::{ParallelConfig, util::with_suffix};

/// Initializes the global logger from `RUST_LOG`.
///
/// When a log file is configured every record goes to `<log_file>.<rank>` instead of stderr.
pub fn init(config: &ParallelConfig) -> io::Result<()> {
    let mut builder = Builder::from_default_env();

    if let Some(path) = &config.log_file {
        let file = File::create(with_suffix(path, config.rank()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
