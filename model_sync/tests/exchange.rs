mod common;

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use comms::msg::{Command, Msg, Payload};
use common::{config, sync_with};
use model_sync::{ClusterConfig, Coordinator, Exchanger, MergeFnSpec, Peer, Round, SyncErr};
use tokio::{
    io::{self as tokio_io, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

const PARAMS: usize = 4;

fn cluster(num_procs: usize, rank: usize, coordinator_addr: SocketAddr) -> ClusterConfig {
    ClusterConfig {
        num_procs,
        rank,
        coordinator_addr,
        coordinator_rank: 0,
        broadcast_initial: true,
        collect_final: true,
        exchange_timeout_ms: 2_000,
        startup_timeout_ms: 2_000,
        shutdown_timeout_ms: 2_000,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_exchanges_with_the_coordinator() -> io::Result<()> {
    let config = config(MergeFnSpec::GlobalSum, true, Some(3));
    let coordinator_sync = sync_with(&config, vec![1.; PARAMS]);
    let peer_sync = sync_with(&config, vec![0.; PARAMS]);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let coordinator_task = tokio::spawn({
        let sync = Arc::clone(&coordinator_sync);
        async move {
            let mut coordinator = Coordinator::new(sync, cluster(2, 0, addr));
            coordinator.accept_peers(&listener).await?;
            Ok::<_, SyncErr>(coordinator)
        }
    });

    let mut peer = Peer::connect(Arc::clone(&peer_sync), &cluster(2, 1, addr)).await?;
    let mut coordinator = coordinator_task.await.unwrap()?;

    assert!(!peer.is_detached());
    assert_eq!(coordinator.peers(), 1);
    // The coordinator's parameters were broadcast.
    assert_eq!(peer_sync.snapshot()?, vec![1.; PARAMS]);

    peer_sync.push_merge(&[2.; PARAMS], 0.1)?;
    assert_eq!(peer.exchange_window().await?, Round::Exchanged);

    // Mean of 1 and 3 on both sides.
    assert_eq!(coordinator_sync.snapshot()?, vec![2.; PARAMS]);
    assert_eq!(peer_sync.snapshot()?, vec![2.; PARAMS]);
    assert_eq!(coordinator.exchange_window().await?, Round::Served(1));
    assert_eq!(peer.rounds(), 1);

    peer_sync.push_merge(&[4.; PARAMS], 0.1)?;
    peer.shutdown().await?;
    coordinator.shutdown().await?;

    // The peer's final 6 is folded into the coordinator's 2.
    assert_eq!(coordinator_sync.snapshot()?, vec![4.; PARAMS]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_fails_when_a_peer_is_missing() -> io::Result<()> {
    let config = config(MergeFnSpec::GlobalSum, true, None);
    let coordinator_sync = sync_with(&config, vec![1.; PARAMS]);
    let peer_sync = sync_with(&config, vec![0.; PARAMS]);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut coordinator_cluster = cluster(3, 0, addr);
    coordinator_cluster.startup_timeout_ms = 300;

    let coordinator_task = tokio::spawn(async move {
        let mut coordinator = Coordinator::new(coordinator_sync, coordinator_cluster);
        coordinator.accept_peers(&listener).await
    });

    let mut peer = Peer::connect(Arc::clone(&peer_sync), &cluster(3, 1, addr)).await?;
    let err = coordinator_task.await.unwrap().unwrap_err();

    assert!(matches!(
        err,
        SyncErr::MissingPeers {
            expected: 2,
            joined: 1
        }
    ));

    // The coordinator is gone, the peer keeps training on its own.
    assert_eq!(peer.exchange_window().await?, Round::Skipped);
    assert!(peer.is_detached());

    peer_sync.push_merge(&[1.; PARAMS], 0.1)?;
    assert_eq!(peer_sync.snapshot()?, vec![2.; PARAMS]);
    peer.shutdown().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_survives_an_unreachable_coordinator() -> io::Result<()> {
    let config = config(MergeFnSpec::Average, true, None);
    let sync = sync_with(&config, vec![0.; PARAMS]);

    // Nobody listens on this port anymore.
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let mut peer_cluster = cluster(2, 1, addr);
    peer_cluster.startup_timeout_ms = 300;

    let mut peer = Peer::connect(Arc::clone(&sync), &peer_cluster).await?;
    assert!(peer.is_detached());

    sync.push_merge(&[2.; PARAMS], 0.1)?;
    assert_eq!(peer.exchange_window().await?, Round::Skipped);
    assert_eq!(sync.snapshot()?, vec![2.; PARAMS]);

    peer.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_parameter_count_is_rejected() -> io::Result<()> {
    const BUF_SIZE: usize = 4096;

    let coordinator_sync = sync_with(&config(MergeFnSpec::GlobalSum, true, None), vec![0.; PARAMS]);
    let peer_sync = sync_with(&config(MergeFnSpec::GlobalSum, true, None), vec![0.; PARAMS - 1]);

    let (coordinator_stream, peer_stream) = tokio_io::duplex(BUF_SIZE);
    let (rx, tx) = tokio_io::split(coordinator_stream);
    let (coordinator_rx, coordinator_tx) = comms::channel(rx, tx);
    let (rx, tx) = tokio_io::split(peer_stream);
    let (peer_rx, peer_tx) = comms::channel(rx, tx);

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let mut coordinator = Coordinator::new(coordinator_sync, cluster(2, 0, addr));
    let peer_cluster = cluster(2, 1, addr);

    let (admitted, joined) = tokio::join!(
        coordinator.admit(coordinator_rx, coordinator_tx),
        Peer::join(peer_sync, &peer_cluster, peer_rx, peer_tx),
    );

    assert!(matches!(admitted, Err(SyncErr::PeerRejected { rank: 1, .. })));
    assert!(matches!(joined, Err(SyncErr::Rejected(_))));
    assert_eq!(coordinator.peers(), 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_keeps_its_parameters_without_broadcast() -> io::Result<()> {
    const BUF_SIZE: usize = 4096;

    let config = config(MergeFnSpec::GlobalSum, true, None);
    let coordinator_sync = sync_with(&config, vec![8.; PARAMS]);
    let peer_sync = sync_with(&config, vec![2.; PARAMS]);

    let (coordinator_stream, peer_stream) = tokio_io::duplex(BUF_SIZE);
    let (rx, tx) = tokio_io::split(coordinator_stream);
    let (coordinator_rx, coordinator_tx) = comms::channel(rx, tx);
    let (rx, tx) = tokio_io::split(peer_stream);
    let (peer_rx, peer_tx) = comms::channel(rx, tx);

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let mut coordinator_cluster = cluster(2, 0, addr);
    coordinator_cluster.broadcast_initial = false;
    coordinator_cluster.collect_final = false;

    let mut coordinator = Coordinator::new(Arc::clone(&coordinator_sync), coordinator_cluster);
    let peer_cluster = cluster(2, 1, addr);

    let (admitted, joined) = tokio::join!(
        coordinator.admit(coordinator_rx, coordinator_tx),
        Peer::join(Arc::clone(&peer_sync), &peer_cluster, peer_rx, peer_tx),
    );

    assert_eq!(admitted?, Some(1));
    let mut peer = joined?;
    assert_eq!(peer_sync.snapshot()?, vec![2.; PARAMS]);

    assert_eq!(peer.exchange_window().await?, Round::Exchanged);
    assert_eq!(peer_sync.snapshot()?, vec![5.; PARAMS]);

    peer.shutdown().await?;
    coordinator.shutdown().await?;

    // Nothing was collected, the coordinator keeps the mixed buffer.
    assert_eq!(coordinator_sync.snapshot()?, vec![5.; PARAMS]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn huge_length_prefix_is_dropped_without_allocating() -> io::Result<()> {
    let coordinator_sync = sync_with(&config(MergeFnSpec::GlobalSum, true, None), vec![0.; PARAMS]);

    let (coordinator_stream, mut client) = tokio_io::duplex(64);
    let (rx, tx) = tokio_io::split(coordinator_stream);
    let (rx, tx) = comms::channel(rx, tx);

    client.write_all(&(u64::MAX / 2).to_be_bytes()).await?;

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let mut coordinator = Coordinator::new(coordinator_sync, cluster(2, 0, addr));

    match coordinator.admit(rx, tx).await {
        Err(SyncErr::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
        other => panic!("expected an io error, got {other:?}"),
    }
    assert_eq!(coordinator.peers(), 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_and_garbage_connections_do_not_block_peers() -> io::Result<()> {
    let config = config(MergeFnSpec::GlobalSum, true, None);
    let coordinator_sync = sync_with(&config, vec![1.; PARAMS]);
    let peer_sync = sync_with(&config, vec![0.; PARAMS]);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut coordinator_cluster = cluster(2, 0, addr);
    coordinator_cluster.exchange_timeout_ms = 200;

    // Connected before the peer, so they are accepted first.
    let _stalled = TcpStream::connect(addr).await?;
    let mut garbage = TcpStream::connect(addr).await?;
    garbage.write_all(&u64::MAX.to_be_bytes()).await?;

    let coordinator_task = tokio::spawn({
        let sync = Arc::clone(&coordinator_sync);
        async move {
            let mut coordinator = Coordinator::new(sync, coordinator_cluster);
            coordinator.accept_peers(&listener).await?;
            Ok::<_, SyncErr>(coordinator)
        }
    });

    let mut peer = Peer::connect(Arc::clone(&peer_sync), &cluster(2, 1, addr)).await?;
    let mut coordinator = coordinator_task.await.unwrap()?;

    assert_eq!(coordinator.peers(), 1);
    assert!(!peer.is_detached());
    assert_eq!(peer_sync.snapshot()?, vec![1.; PARAMS]);

    peer.shutdown().await?;
    coordinator.shutdown().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn late_answer_only_skips_its_own_round() -> io::Result<()> {
    let peer_sync = sync_with(&config(MergeFnSpec::GlobalSum, true, None), vec![0.; PARAMS]);

    let (coordinator_stream, peer_stream) = tokio_io::duplex(4096);
    let (rx, tx) = tokio_io::split(coordinator_stream);
    let (mut rx, mut tx) = comms::channel(rx, tx);
    let (peer_rx, peer_tx) = tokio_io::split(peer_stream);
    let (peer_rx, peer_tx) = comms::channel(peer_rx, peer_tx);

    // A coordinator that answers the first round too late and the second one right away.
    let coordinator = tokio::spawn(async move {
        let mut buf: Vec<f32> = Vec::new();

        match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Hello { rank: 1, .. }) => {}
            other => panic!("unexpected message {other:?}"),
        }
        let welcome = Command::Welcome {
            broadcast: false,
            collect: false,
        };
        tx.send(&Msg::Control(welcome)).await?;

        for delay in [300, 0] {
            let mixed: Vec<f32> = match rx.recv_into(&mut buf).await? {
                Msg::Data(Payload::Exchange(snapshot)) => {
                    snapshot.iter().map(|p| p + 1.).collect()
                }
                other => panic!("unexpected message {other:?}"),
            };

            time::sleep(Duration::from_millis(delay)).await;
            tx.send(&Msg::Data(Payload::Merged(&mixed))).await?;
        }

        match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Disconnect) => io::Result::Ok(()),
            other => panic!("unexpected message {other:?}"),
        }
    });

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let mut peer_cluster = cluster(2, 1, addr);
    peer_cluster.exchange_timeout_ms = 200;

    let mut peer = Peer::join(Arc::clone(&peer_sync), &peer_cluster, peer_rx, peer_tx).await?;

    assert_eq!(peer.exchange_window().await?, Round::Skipped);
    assert!(!peer.is_detached());
    assert_eq!(peer_sync.snapshot()?, vec![0.; PARAMS]);

    // The stale answer to the first round is discarded, the second round goes through.
    assert_eq!(peer.exchange_window().await?, Round::Exchanged);
    assert_eq!(peer_sync.snapshot()?, vec![1.; PARAMS]);
    assert_eq!(peer.rounds(), 1);
    assert_eq!(peer.skipped(), 1);

    peer.shutdown().await?;
    coordinator.await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn finals_are_collected_after_the_startup_timeout() -> io::Result<()> {
    let config = config(MergeFnSpec::GlobalSum, true, None);
    let coordinator_sync = sync_with(&config, vec![1.; PARAMS]);
    let peer_sync = sync_with(&config, vec![0.; PARAMS]);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut coordinator_cluster = cluster(2, 0, addr);
    coordinator_cluster.startup_timeout_ms = 1_000;
    coordinator_cluster.shutdown_timeout_ms = 5_000;

    let coordinator_task = tokio::spawn({
        let sync = Arc::clone(&coordinator_sync);
        async move {
            let mut coordinator = Coordinator::new(sync, coordinator_cluster);
            coordinator.accept_peers(&listener).await?;
            coordinator.shutdown().await
        }
    });

    let mut peer = Peer::connect(Arc::clone(&peer_sync), &cluster(2, 1, addr)).await?;
    assert!(!peer.is_detached());

    // Keeps training well past the coordinator's startup timeout.
    time::sleep(Duration::from_millis(1_500)).await;
    peer_sync.push_merge(&[2.; PARAMS], 0.1)?;
    peer.shutdown().await?;

    coordinator_task.await.unwrap()?;

    // The peer's final 3 is folded into the coordinator's 1.
    assert_eq!(coordinator_sync.snapshot()?, vec![2.; PARAMS]);

    Ok(())
}
