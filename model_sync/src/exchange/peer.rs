use std::{sync::Arc, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{self, Instant},
};

use super::{Exchanger, Round, SyncHandle, link::Link};
use crate::{
    config::ClusterConfig,
    error::{Result, SyncErr},
    sync::ModelSync,
};

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// The exchanger of a non-coordinating rank.
///
/// Every window sends a snapshot of the canonical buffer to the coordinator and applies the
/// mixed buffer it answers with. A round without an answer within the exchange timeout is
/// skipped, the next window tries again. Once the connection itself is lost the peer keeps
/// training on its own until shutdown.
pub struct Peer {
    handle: SyncHandle,
    rank: usize,
    timeout: Duration,
    collect: bool,
    link: Option<Link>,
    rounds: usize,
    skipped: usize,
}

impl Peer {
    /// Connects to the coordinator at `cluster.coordinator_addr` and joins the cluster.
    ///
    /// Connection attempts are retried until the startup timeout. When the coordinator can't
    /// be reached the peer runs detached.
    ///
    /// # Arguments
    /// * `sync` - An initialized synchronizer.
    /// * `cluster` - The layout of the cluster.
    ///
    /// # Returns
    /// The peer, or a fatal error if the coordinator rejected this rank.
    pub async fn connect(sync: Arc<ModelSync>, cluster: &ClusterConfig) -> Result<Self> {
        let deadline = Instant::now() + cluster.startup_timeout();
        let addr = cluster.coordinator_addr;

        let stream = loop {
            match time::timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => break Some(stream),
                Ok(Err(e)) if Instant::now() + RETRY_DELAY < deadline => {
                    debug!(rank = cluster.rank; "coordinator at {addr} not reachable yet: {e}");
                    time::sleep(RETRY_DELAY).await;
                }
                Ok(Err(e)) => {
                    warn!(rank = cluster.rank; "giving up on coordinator at {addr}: {e}");
                    break None;
                }
                Err(_) => {
                    warn!(rank = cluster.rank; "timed out connecting to coordinator at {addr}");
                    break None;
                }
            }
        };

        let Some(stream) = stream else {
            return Ok(Self::detached(sync, cluster));
        };

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        match time::timeout_at(deadline, Self::join(Arc::clone(&sync), cluster, rx, tx)).await {
            Ok(Err(SyncErr::Io(e))) => {
                warn!(rank = cluster.rank; "handshake with the coordinator failed: {e}");
                Ok(Self::detached(sync, cluster))
            }
            Ok(joined) => joined,
            Err(_) => {
                warn!(rank = cluster.rank; "handshake with the coordinator timed out");
                Ok(Self::detached(sync, cluster))
            }
        }
    }

    /// Joins the cluster over an already established link.
    ///
    /// Announces this rank and its parameter count, then applies the coordinator's initial
    /// parameters if it broadcasts them.
    ///
    /// # Arguments
    /// * `sync` - An initialized synchronizer.
    /// * `cluster` - The layout of the cluster.
    /// * `rx` - The receiving end of the link.
    /// * `tx` - The sending end of the link.
    ///
    /// # Returns
    /// The joined peer, `Rejected` if the coordinator refused it, or an io error.
    pub async fn join<R, W>(
        sync: Arc<ModelSync>,
        cluster: &ClusterConfig,
        mut rx: FrameReceiver<R>,
        mut tx: FrameSender<W>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handle = SyncHandle::new(sync);
        if !handle.is_initialized() {
            return Err(SyncErr::Uninitialized);
        }

        rx.set_max_frame(Msg::max_len(handle.dim()));

        let hello = Msg::Control(Command::Hello {
            rank: cluster.rank,
            params: handle.dim(),
        });
        tx.send(&hello).await?;

        let mut buf = Vec::new();
        let unexpected = |got| SyncErr::UnexpectedMessage {
            rank: cluster.coordinator_rank,
            got,
        };

        let (broadcast, collect) = match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Welcome { broadcast, collect }) => (broadcast, collect),
            Msg::Err(reason) => return Err(SyncErr::Rejected(reason.into_owned())),
            other => return Err(unexpected(other.kind())),
        };

        if broadcast {
            match rx.recv_into(&mut buf).await? {
                Msg::Data(Payload::Initial(params)) => handle.overwrite(params).await?,
                other => return Err(unexpected(other.kind())),
            }
        }

        info!(
            rank = cluster.rank,
            broadcast = broadcast,
            collect = collect;
            "joined the cluster"
        );

        Ok(Self {
            handle,
            rank: cluster.rank,
            timeout: cluster.exchange_timeout(),
            collect,
            link: Some(Link::spawn(rx, tx, buf, cluster.coordinator_rank)),
            rounds: 0,
            skipped: 0,
        })
    }

    /// Creates a peer that never reaches the coordinator.
    pub fn detached(sync: Arc<ModelSync>, cluster: &ClusterConfig) -> Self {
        warn!(rank = cluster.rank; "running detached from the coordinator");

        Self {
            handle: SyncHandle::new(sync),
            rank: cluster.rank,
            timeout: cluster.exchange_timeout(),
            collect: false,
            link: None,
            rounds: 0,
            skipped: 0,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.link.is_none()
    }

    /// The amount of completed exchange rounds.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// The amount of rounds skipped for lack of an answer.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn detach(&mut self) -> Round {
        warn!(rank = self.rank, rounds = self.rounds; "lost the coordinator, training on alone");
        self.link = None;
        Round::Skipped
    }
}

impl Exchanger for Peer {
    async fn exchange_window(&mut self) -> Result<Round> {
        let Some(link) = &self.link else {
            return Ok(Round::Skipped);
        };
        if link.is_closed() {
            return Ok(self.detach());
        }

        let snapshot = self.handle.snapshot().await?;
        let Some(reply) = link.exchange(snapshot.clone()) else {
            return Ok(self.detach());
        };

        match time::timeout(self.timeout, reply).await {
            Ok(Ok(mixed)) => {
                self.handle.reconcile(&snapshot, &mixed).await?;
                self.rounds += 1;
                debug!(rank = self.rank, rounds = self.rounds; "exchanged with the coordinator");
                Ok(Round::Exchanged)
            }
            Ok(Err(_)) => Ok(self.detach()),
            Err(_) => {
                self.skipped += 1;
                warn!(
                    rank = self.rank,
                    skipped = self.skipped;
                    "no answer within {:?}, skipping the round", self.timeout
                );
                Ok(Round::Skipped)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            info!(rank = self.rank, rounds = self.rounds; "detached peer shut down");
            return Ok(());
        };

        let final_params = if self.collect {
            Some(self.handle.snapshot().await?)
        } else {
            None
        };

        match link.close(final_params, self.timeout).await {
            Ok(()) => {
                info!(rank = self.rank, rounds = self.rounds; "disconnected from the coordinator");
            }
            Err(e) => warn!(rank = self.rank; "failed to disconnect cleanly: {e}"),
        }

        Ok(())
    }
}
