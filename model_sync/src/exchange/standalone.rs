use std::sync::Arc;

use log::debug;

use super::{Exchanger, Round, SyncHandle};
use crate::{error::Result, sync::ModelSync};

/// The exchanger of a single-process deployment.
///
/// Windows only mark the start of a new merge epoch.
#[derive(Debug)]
pub struct Standalone {
    handle: SyncHandle,
    windows: usize,
}

impl Standalone {
    pub fn new(sync: Arc<ModelSync>) -> Self {
        Self {
            handle: SyncHandle::new(sync),
            windows: 0,
        }
    }

    pub fn windows(&self) -> usize {
        self.windows
    }
}

impl Exchanger for Standalone {
    async fn exchange_window(&mut self) -> Result<Round> {
        self.handle.reset_epoch().await?;
        self.windows += 1;

        debug!(windows = self.windows; "local window");
        Ok(Round::Local)
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
