use std::{collections::VecDeque, sync::Arc, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{
    io::{self, AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};

use crate::error::{Result, SyncErr};

enum Outgoing {
    Exchange(Vec<f32>),
    Final(Vec<f32>),
    Disconnect,
}

/// Rounds waiting for the coordinator's answer, oldest first.
#[derive(Default)]
struct Pending {
    closed: bool,
    replies: VecDeque<oneshot::Sender<Vec<f32>>>,
}

/// A peer's connection to the coordinator.
///
/// Frames are read and written by two dedicated tasks, so giving up on a round never leaves
/// a half transferred frame behind. The coordinator answers rounds in order: a reply to a
/// round that already timed out is discarded on arrival and the link stays usable.
pub(super) struct Link {
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<Mutex<Pending>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

impl Link {
    /// Spawns the tasks driving an established link.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the link.
    /// * `tx` - The sending end of the link.
    /// * `buf` - The buffer backing received frames.
    /// * `coordinator_rank` - The rank on the other end, for error reports.
    pub(super) fn spawn<R, W>(
        rx: FrameReceiver<R>,
        tx: FrameSender<W>,
        buf: Vec<f32>,
        coordinator_rank: usize,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(Pending::default()));

        let reader = tokio::spawn(read_replies(
            rx,
            buf,
            Arc::clone(&pending),
            coordinator_rank,
        ));
        let writer = tokio::spawn(write_requests(tx, inbox));

        Self {
            outbox,
            pending,
            reader,
            writer,
        }
    }

    /// Whether the connection is gone for good.
    pub(super) fn is_closed(&self) -> bool {
        self.pending.lock().closed || self.writer.is_finished()
    }

    /// Sends a snapshot for one exchange round.
    ///
    /// # Returns
    /// The receiver of the coordinator's mixed buffer, which fails if the link closes
    /// before the answer arrives. `None` if the link is already closed.
    pub(super) fn exchange(&self, snapshot: Vec<f32>) -> Option<oneshot::Receiver<Vec<f32>>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return None;
            }
            pending.replies.push_back(reply_tx);
        }

        self.outbox.send(Outgoing::Exchange(snapshot)).ok()?;
        Some(reply_rx)
    }

    /// Hands in the final parameters if given, says goodbye and closes the connection.
    ///
    /// # Arguments
    /// * `final_params` - The parameters to hand in, if any.
    /// * `timeout` - How long to wait for the outgoing frames to be flushed.
    pub(super) async fn close(
        mut self,
        final_params: Option<Vec<f32>>,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(params) = final_params {
            let _ = self.outbox.send(Outgoing::Final(params));
        }
        let _ = self.outbox.send(Outgoing::Disconnect);

        match time::timeout(timeout, &mut self.writer).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(io::Error::other(e).into()),
            Err(_) => {
                self.writer.abort();
                let e = io::Error::new(io::ErrorKind::TimedOut, "timed out flushing the link");
                Err(e.into())
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Hands every `Merged` frame to the oldest round waiting for it.
async fn read_replies<R>(
    mut rx: FrameReceiver<R>,
    mut buf: Vec<f32>,
    pending: Arc<Mutex<Pending>>,
    coordinator_rank: usize,
) where
    R: AsyncRead + Unpin,
{
    let unexpected = |got| SyncErr::UnexpectedMessage {
        rank: coordinator_rank,
        got,
    };

    let err = loop {
        let mixed = match rx.recv_into(&mut buf).await {
            Ok(Msg::Data(Payload::Merged(mixed))) => mixed,
            Ok(Msg::Err(reason)) => break SyncErr::Rejected(reason.into_owned()),
            Ok(other) => break unexpected(other.kind()),
            Err(e) => break SyncErr::Io(e),
        };

        let Some(waiting) = pending.lock().replies.pop_front() else {
            break unexpected("merged");
        };

        if waiting.send(mixed.to_vec()).is_err() {
            debug!(coordinator = coordinator_rank; "discarded the answer to a timed out round");
        }
    };

    match &err {
        SyncErr::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!(coordinator = coordinator_rank; "the coordinator closed the link");
        }
        _ => warn!(coordinator = coordinator_rank; "link to the coordinator closed: {err}"),
    }

    let mut pending = pending.lock();
    pending.closed = true;
    pending.replies.clear();
}

/// Writes the queued frames in order, until the disconnect notice.
async fn write_requests<W>(
    mut tx: FrameSender<W>,
    mut inbox: mpsc::UnboundedReceiver<Outgoing>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(outgoing) = inbox.recv().await {
        let msg = match &outgoing {
            Outgoing::Exchange(params) => Msg::Data(Payload::Exchange(params)),
            Outgoing::Final(params) => Msg::Data(Payload::Final(params)),
            Outgoing::Disconnect => Msg::Control(Command::Disconnect),
        };

        tx.send(&msg).await?;

        if matches!(outgoing, Outgoing::Disconnect) {
            break;
        }
    }

    tx.shutdown().await?;
    Ok(())
}
