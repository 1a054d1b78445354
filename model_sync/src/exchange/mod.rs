mod coordinator;
mod handle;
mod link;
mod peer;
mod standalone;

pub use coordinator::Coordinator;
pub use handle::SyncHandle;
pub use peer::Peer;
pub use standalone::Standalone;

use crate::error::Result;

/// The outcome of one exchange window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    /// The buffer was reconciled with the coordinator.
    Exchanged,
    /// The round failed or the peer is detached, training goes on locally.
    Skipped,
    /// Peer rounds answered by the coordinator since its previous window.
    Served(usize),
    /// No cross-process step is configured.
    Local,
}

/// Reconciles the canonical buffer of this process with the rest of the cluster.
///
/// Implementations own their connections for their whole lifetime and never hold the
/// parameter lock across network I/O.
#[trait_variant::make(Exchanger: Send)]
pub trait ExchangerTemplate {
    /// Runs one exchange window, called every `merge_size` processed samples.
    ///
    /// # Returns
    /// The outcome of the window, or a fatal error. Transient peer failures are never
    /// returned as errors.
    async fn exchange_window(&mut self) -> Result<Round>;

    /// Hands in the final state when configured and releases every communication handle.
    async fn shutdown(&mut self) -> Result<()>;
}
