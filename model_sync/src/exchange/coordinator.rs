use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
    time::{self, Instant},
};

use super::{Exchanger, Round, SyncHandle};
use crate::{
    config::ClusterConfig,
    error::{Result, SyncErr},
    sync::ModelSync,
};

/// The output of a peer's serving task: its rank and the final parameters it handed in.
type PeerOutcome = (usize, Result<Option<Vec<f32>>>);

/// The exchanger of the coordinating rank.
///
/// Every joined peer is served by its own task, which mixes the peer's snapshots into the
/// canonical buffer whenever they arrive. The coordinator's own windows only report on
/// those rounds.
pub struct Coordinator {
    handle: SyncHandle,
    cluster: ClusterConfig,
    joined: BTreeSet<usize>,
    tasks: JoinSet<PeerOutcome>,
    served: Arc<AtomicUsize>,
}

impl Coordinator {
    /// Creates a new `Coordinator` with no peers.
    ///
    /// # Arguments
    /// * `sync` - An initialized synchronizer.
    /// * `cluster` - The layout of the cluster.
    pub fn new(sync: Arc<ModelSync>, cluster: ClusterConfig) -> Self {
        Self {
            handle: SyncHandle::new(sync),
            cluster,
            joined: BTreeSet::new(),
            tasks: JoinSet::new(),
            served: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Binds `cluster.coordinator_addr` and waits for every other rank to join.
    pub async fn bind(sync: Arc<ModelSync>, cluster: ClusterConfig) -> Result<Self> {
        let listener = TcpListener::bind(cluster.coordinator_addr).await?;
        info!(rank = cluster.rank; "coordinator listening at {}", cluster.coordinator_addr);

        let mut coordinator = Self::new(sync, cluster);
        coordinator.accept_peers(&listener).await?;
        Ok(coordinator)
    }

    /// The amount of peers that joined.
    pub fn peers(&self) -> usize {
        self.joined.len()
    }

    /// Accepts connections until every declared rank joined.
    ///
    /// Each handshake gets the exchange timeout, a connection that doesn't complete it in
    /// time is dropped.
    ///
    /// # Returns
    /// `MissingPeers` if the startup timeout runs out first, `PeerRejected` if a peer
    /// doesn't match this cluster.
    pub async fn accept_peers(&mut self, listener: &TcpListener) -> Result<()> {
        let rank = self.cluster.rank;
        let expected = self.cluster.num_procs - 1;
        let deadline = Instant::now() + self.cluster.startup_timeout();

        let missing = |joined| {
            error!(rank = rank; "only {joined} of {expected} peers joined");
            SyncErr::MissingPeers { expected, joined }
        };

        while self.joined.len() < expected {
            let Ok(accepted) = time::timeout_at(deadline, listener.accept()).await else {
                return Err(missing(self.joined.len()));
            };

            let (stream, addr) = accepted?;
            debug!(rank = rank; "connection from {addr}");

            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);

            let joined = self.joined.len();
            let handshake = (Instant::now() + self.cluster.exchange_timeout()).min(deadline);

            match time::timeout_at(handshake, self.admit(rx, tx)).await {
                Ok(Err(SyncErr::Io(e))) => {
                    warn!(rank = rank; "dropping connection from {addr}: {e}");
                }
                Ok(admitted) => {
                    admitted?;
                }
                Err(_) if Instant::now() < deadline => {
                    warn!(rank = rank; "dropping connection from {addr}: no hello in time");
                }
                Err(_) => return Err(missing(joined)),
            }
        }

        info!(rank = rank, peers = expected; "every peer joined");
        Ok(())
    }

    /// Runs the handshake with a new peer and spawns the task serving it.
    ///
    /// A connection whose first message isn't a hello is dropped. Frames are bounded by the
    /// size of a full parameter buffer, control frames before the hello is accepted.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the link.
    /// * `tx` - The sending end of the link.
    ///
    /// # Returns
    /// The rank of the admitted peer, `None` for a dropped connection, or `PeerRejected`.
    pub async fn admit<R, W>(
        &mut self,
        mut rx: FrameReceiver<R>,
        mut tx: FrameSender<W>,
    ) -> Result<Option<usize>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf: Vec<f32> = Vec::new();
        rx.set_max_frame(Msg::max_len(0));

        let (rank, params) = match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Hello { rank, params }) => (rank, params),
            other => {
                warn!("expected hello, got {}", other.kind());
                return Ok(None);
            }
        };

        if let Some(reason) = self.validate(rank, params) {
            error!(rank = rank; "rejecting peer: {reason}");

            if let Err(e) = tx.send(&Msg::Err(reason.as_str().into())).await {
                warn!(rank = rank; "failed to notify the rejection: {e}");
            }

            return Err(SyncErr::PeerRejected { rank, reason });
        }

        let broadcast = self.cluster.broadcast_initial;
        let collect = self.cluster.collect_final;
        tx.send(&Msg::Control(Command::Welcome { broadcast, collect }))
            .await?;

        if broadcast {
            let params = self.handle.snapshot().await?;
            tx.send(&Msg::Data(Payload::Initial(&params))).await?;
        }

        rx.set_max_frame(Msg::max_len(self.handle.dim()));
        self.joined.insert(rank);
        info!(rank = rank, params = params; "peer joined");

        let handle = self.handle.clone();
        let served = Arc::clone(&self.served);
        self.tasks.spawn(async move {
            let res = serve(&handle, rank, rx, tx, buf, &served).await;
            (rank, res)
        });

        Ok(Some(rank))
    }

    fn validate(&self, rank: usize, params: usize) -> Option<String> {
        let ClusterConfig {
            num_procs,
            coordinator_rank,
            ..
        } = self.cluster;

        if rank >= num_procs || rank == coordinator_rank {
            return Some(format!("rank {rank} is not a peer rank of {num_procs} processes"));
        }
        if self.joined.contains(&rank) {
            return Some(format!("rank {rank} already joined"));
        }
        if params != self.handle.dim() {
            return Some(format!(
                "expected {} parameters, got {params}",
                self.handle.dim()
            ));
        }

        None
    }
}

/// Answers a peer's exchange rounds until it disconnects.
///
/// # Returns
/// The final parameters the peer handed in, if any.
async fn serve<R, W>(
    handle: &SyncHandle,
    rank: usize,
    mut rx: FrameReceiver<R>,
    mut tx: FrameSender<W>,
    mut buf: Vec<f32>,
    served: &AtomicUsize,
) -> Result<Option<Vec<f32>>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut final_params = None;

    loop {
        match rx.recv_into(&mut buf).await? {
            Msg::Data(Payload::Exchange(snapshot)) => {
                let mixed = handle.average_with(&[snapshot]).await?;
                served.fetch_add(1, Ordering::Relaxed);
                tx.send(&Msg::Data(Payload::Merged(&mixed))).await?;
            }
            Msg::Data(Payload::Final(params)) => final_params = Some(params.to_vec()),
            Msg::Control(Command::Disconnect) => break,
            Msg::Err(reason) => {
                warn!(rank = rank; "peer gave up: {reason}");
                break;
            }
            other => {
                return Err(SyncErr::UnexpectedMessage {
                    rank,
                    got: other.kind(),
                });
            }
        }
    }

    debug!(rank = rank; "peer disconnected");
    Ok(final_params)
}

impl Exchanger for Coordinator {
    async fn exchange_window(&mut self) -> Result<Round> {
        let served = self.served.swap(0, Ordering::Relaxed);
        debug!(rank = self.cluster.rank, served = served; "coordinator window");
        Ok(Round::Served(served))
    }

    async fn shutdown(&mut self) -> Result<()> {
        let rank = self.cluster.rank;
        let deadline = Instant::now() + self.cluster.shutdown_timeout();
        let mut finals = Vec::new();

        loop {
            let next = match time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    warn!(rank = rank, pending = self.tasks.len(); "giving up on the remaining peers");
                    self.tasks.abort_all();
                    break;
                }
            };

            match next {
                Ok((_, Ok(Some(params)))) => finals.push(params),
                Ok((_, Ok(None))) => {}
                Ok((peer, Err(e))) => warn!(rank = peer; "peer link failed: {e}"),
                Err(e) => warn!(rank = rank; "peer task failed: {e}"),
            }
        }

        if !finals.is_empty() {
            let finals: Vec<&[f32]> = finals.iter().map(Vec::as_slice).collect();
            self.handle.average_with(&finals).await?;
            info!(rank = rank, collected = finals.len(); "folded the peers' final parameters in");
        }

        Ok(())
    }
}
