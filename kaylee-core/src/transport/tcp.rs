//! TCP transport.
//!
//! The coordinator binds one listener per channel and bridges every accepted
//! connection to the link's channels with a pump task:
//!
//! - push connections compete for the shared task queue, so tasks go to
//!   whichever connected worker is ready first. A worker acknowledges every
//!   task its runtime takes, and a connection never has more than
//!   [`PUSH_CREDIT`] unacknowledged tasks, so the task queue's capacity is
//!   what bounds dispatch;
//! - pull connections forward everything they read into the result queue;
//! - control connections forward registrations inbound, and each one is
//!   subscribed to the outbound control broadcast from the moment it is
//!   accepted.
//!
//! Workers dial the three addresses with exponential backoff, so they may be
//! started before the coordinator.

use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use backoff::{future::retry_notify, ExponentialBackoffBuilder};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, info, instrument, warn};

use super::{
    Backend, CoordinatorLink, Linger, TaskReceiver, WorkerLink, CONTROL_CAPACITY,
    RESULT_CAPACITY,
};
use crate::{
    codec::{frame::FrameCodec, Frames},
    config::Addresses,
};

/// How long the coordinator waits for queued control messages to be written
/// out when it shuts down.
const LINGER: Duration = Duration::from_secs(2);

/// How long a worker keeps retrying to reach the coordinator.
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Tasks a push connection may have in flight without acknowledgement.
pub const PUSH_CREDIT: usize = 2;

/// Sent back on the push connection for every task handed to the runtime.
const ACK: &[u8] = b"ack";

/// Bind the three listeners and start accepting workers.
///
/// Returns the link and the addresses actually bound, which differ from the
/// requested ones when port `0` is used.
#[instrument(skip_all, level = "debug")]
pub async fn bind(addresses: &Addresses, task_capacity: usize) -> Result<(CoordinatorLink, Addresses)> {
    let push = listen(&addresses.push).await?;
    let pull = listen(&addresses.pull).await?;
    let control = listen(&addresses.control).await?;
    let bound = Addresses {
        push: push.local_addr()?.to_string(),
        pull: pull.local_addr()?.to_string(),
        control: control.local_addr()?.to_string(),
    };
    info!(push = %bound.push, pull = %bound.pull, control = %bound.control, "listening");

    let (tasks_tx, tasks_rx) = mpsc::channel(task_capacity.max(1));
    let (results_tx, results_rx) = mpsc::channel(RESULT_CAPACITY);
    let (control_in_tx, control_in_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (control_out, _) = broadcast::channel(CONTROL_CAPACITY);

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let tasks = TaskReceiver::new(tasks_rx);
    tracker.spawn(accept_loop(
        "push",
        push,
        token.clone(),
        tracker.clone(),
        move |socket, token| push_pump(socket, tasks.clone(), token),
    ));
    tracker.spawn(accept_loop(
        "pull",
        pull,
        token.clone(),
        tracker.clone(),
        move |socket, token| inbound_pump(socket, results_tx.clone(), token),
    ));
    let publisher = control_out.clone();
    tracker.spawn(accept_loop(
        "control",
        control,
        token.clone(),
        tracker.clone(),
        move |socket: TcpStream, token: CancellationToken| {
            let outbound = publisher.subscribe();
            let inbound = control_in_tx.clone();
            async move {
                let (reader, writer) = socket.into_split();
                tokio::try_join!(
                    inbound_pump(reader, inbound, token.clone()),
                    broadcast_pump(writer, outbound, token),
                )?;
                Ok::<_, anyhow::Error>(())
            }
        },
    ));

    let link = CoordinatorLink {
        tasks: tasks_tx,
        results: results_rx,
        control_in: control_in_rx,
        control_out,
        backend: Backend::Tcp(Linger {
            token,
            tracker,
            period: LINGER,
        }),
    };
    Ok((link, bound))
}

/// Dial the coordinator's three channels.
#[instrument(skip_all, level = "debug")]
pub async fn connect(addresses: &Addresses) -> Result<WorkerLink> {
    let (push, pull, control) = tokio::try_join!(
        dial(&addresses.push),
        dial(&addresses.pull),
        dial(&addresses.control),
    )?;

    // A single slot: a task is only acknowledged once the runtime has taken
    // the previous one.
    let (tasks_tx, tasks_rx) = mpsc::channel(1);
    let (results_tx, results_rx) = mpsc::channel(RESULT_CAPACITY);
    let (control_out_tx, control_out_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (control_in_tx, control_in_rx) = broadcast::channel(CONTROL_CAPACITY);

    let token = CancellationToken::new();
    let (control_reader, control_writer) = control.into_split();
    spawn_pump("push", credit_pump(push, tasks_tx, token.clone()));
    spawn_pump("pull", outbound_pump(pull, results_rx, token.clone()));
    spawn_pump(
        "control",
        subscribe_pump(control_reader, control_in_tx, token.clone()),
    );
    spawn_pump(
        "control",
        outbound_pump(control_writer, control_out_rx, token.clone()),
    );

    Ok(WorkerLink {
        tasks: TaskReceiver::new(tasks_rx),
        results: results_tx,
        control_out: control_out_tx,
        control_in: control_in_rx,
        _pumps: Some(token.drop_guard()),
    })
}

async fn listen(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

async fn dial(addr: &str) -> Result<TcpStream> {
    let mut policy = ExponentialBackoffBuilder::new();
    policy.with_initial_interval(Duration::from_millis(100));
    policy.with_max_interval(Duration::from_secs(2));
    policy.with_max_elapsed_time(Some(DIAL_TIMEOUT));

    let socket = retry_notify(
        policy.build(),
        move || async move { TcpStream::connect(addr).await.map_err(backoff::Error::transient) },
        |err, wait: Duration| debug!(%addr, ?wait, "coordinator unreachable: {err}"),
    )
    .await
    .with_context(|| format!("failed to connect to {addr}"))?;

    socket.set_nodelay(true)?;
    Ok(socket)
}

fn spawn_pump(channel: &'static str, pump: impl Future<Output = Result<()>> + Send + 'static) {
    tokio::spawn(async move {
        if let Err(err) = pump.await {
            warn!(channel, "connection lost: {err:#}");
        }
    });
}

async fn accept_loop<F, Fut>(
    channel: &'static str,
    listener: TcpListener,
    token: CancellationToken,
    tracker: TaskTracker,
    serve: F,
) where
    F: Fn(TcpStream, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let (socket, peer) = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(channel, "accept failed: {err}");
                    continue;
                }
            },
        };
        if let Err(err) = socket.set_nodelay(true) {
            debug!(channel, %peer, "failed to set TCP_NODELAY: {err}");
        }
        debug!(channel, %peer, "accepted connection");

        let connection = serve(socket, token.clone());
        tracker.spawn(async move {
            if let Err(err) = connection.await {
                warn!(channel, %peer, "connection lost: {err:#}");
            }
        });
    }
}

/// Hand tasks from the shared queue to one connection, at most
/// [`PUSH_CREDIT`] of them unacknowledged.
async fn push_pump(socket: TcpStream, tasks: TaskReceiver, token: CancellationToken) -> Result<()> {
    let (reader, writer) = socket.into_split();
    let mut acks = FramedRead::new(reader, FrameCodec);
    let mut sink = FramedWrite::new(writer, FrameCodec);
    let mut unacked = 0usize;
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            ack = acks.next() => match ack {
                Some(frames) => {
                    if frames?.first().map(|tag| &tag[..]) != Some(ACK) {
                        warn!("unexpected message on a push connection");
                    }
                    unacked = unacked.saturating_sub(1);
                }
                None => return Ok(()),
            },
            frames = tasks.recv(), if unacked < PUSH_CREDIT => match frames {
                Some(frames) => {
                    sink.send(frames).await?;
                    unacked += 1;
                }
                None => return Ok(()),
            },
        }
    }
}

/// The worker's end of [`push_pump`]: forward tasks into the runtime's
/// single-slot queue, acknowledging each one once it is accepted.
async fn credit_pump(socket: TcpStream, forward: mpsc::Sender<Frames>, token: CancellationToken) -> Result<()> {
    let (reader, writer) = socket.into_split();
    let mut stream = FramedRead::new(reader, FrameCodec);
    let mut acks = FramedWrite::new(writer, FrameCodec);
    loop {
        let frames = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            frames = stream.next() => match frames {
                Some(frames) => frames?,
                None => return Ok(()),
            },
        };
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            sent = forward.send(frames) => if sent.is_err() {
                return Ok(());
            },
        }
        acks.send(vec![Bytes::from_static(ACK)]).await?;
    }
}

/// Forward every message read from `reader` into `forward`.
async fn inbound_pump<R>(reader: R, forward: mpsc::Sender<Frames>, token: CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut stream = FramedRead::new(reader, FrameCodec);
    loop {
        let frames = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            frames = stream.next() => match frames {
                Some(frames) => frames?,
                None => return Ok(()),
            },
        };
        if forward.send(frames).await.is_err() {
            return Ok(());
        }
    }
}

/// Like [`inbound_pump`], but into a broadcast channel.
async fn subscribe_pump<R>(reader: R, forward: broadcast::Sender<Frames>, token: CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut stream = FramedRead::new(reader, FrameCodec);
    loop {
        let frames = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            frames = stream.next() => match frames {
                Some(frames) => frames?,
                None => return Ok(()),
            },
        };
        if forward.send(frames).is_err() {
            return Ok(());
        }
    }
}

/// Write everything published on `outbound`, then whatever is still queued
/// once cancelled.
async fn broadcast_pump<W>(writer: W, mut outbound: broadcast::Receiver<Frames>, token: CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec);
    loop {
        tokio::select! {
            biased;
            frames = outbound.recv() => match frames {
                Ok(frames) => sink.send(frames).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "control connection fell behind");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = token.cancelled() => break,
        }
    }

    while let Ok(frames) = outbound.try_recv() {
        sink.feed(frames).await?;
    }
    sink.flush().await?;
    Ok(())
}

/// Write everything sent on `outbound`, then whatever is still queued once
/// cancelled.
async fn outbound_pump<W>(writer: W, mut outbound: mpsc::Receiver<Frames>, token: CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec);
    loop {
        tokio::select! {
            biased;
            frames = outbound.recv() => match frames {
                Some(frames) => sink.send(frames).await?,
                None => return Ok(()),
            },
            _ = token.cancelled() => break,
        }
    }

    while let Ok(frames) = outbound.try_recv() {
        sink.feed(frames).await?;
    }
    sink.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{Command, Envelope, TaskTag},
        common::WorkerId,
    };

    fn loopback() -> Addresses {
        Addresses {
            push: "127.0.0.1:0".to_string(),
            pull: "127.0.0.1:0".to_string(),
            control: "127.0.0.1:0".to_string(),
        }
    }

    #[tokio::test]
    async fn loopback_carries_all_three_channels() {
        let (mut coordinator, bound) = bind(&loopback(), 4).await.unwrap();
        let mut worker = connect(&bound).await.unwrap();
        let id = WorkerId::from("w1");

        worker
            .control_out
            .send(Command::Connect { worker: id.clone() }.into_frames())
            .await
            .unwrap();
        let frames = coordinator.control_in.recv().await.unwrap();
        assert_eq!(
            Command::from_frames(frames).unwrap(),
            Command::Connect { worker: id.clone() }
        );

        // The control connection was subscribed before its first message was
        // read, so the reply is not lost.
        coordinator
            .control_out
            .send(Envelope::new(id.clone(), Command::Done).into_frames())
            .unwrap();
        let frames = worker.control_in.recv().await.unwrap();
        assert_eq!(Envelope::from_frames(frames).unwrap().to, id);

        let task = Command::Map {
            task: TaskTag::new(0, Bytes::from_static(b"k")),
            value: Bytes::from_static(b"v"),
        };
        coordinator.tasks.send(task.clone().into_frames()).await.unwrap();
        let frames = worker.tasks.recv().await.unwrap();
        assert_eq!(Command::from_frames(frames).unwrap(), task);

        let result = Command::MapKeyDone {
            task: TaskTag::new(0, Bytes::from_static(b"k")),
        };
        worker.results.send(result.clone().into_frames()).await.unwrap();
        let frames = coordinator.results.recv().await.unwrap();
        assert_eq!(Command::from_frames(frames).unwrap(), result);

        coordinator.close().await;
    }

    #[tokio::test]
    async fn a_stalled_worker_holds_a_bounded_number_of_tasks() {
        let capacity = 8;
        let (coordinator, bound) = bind(&loopback(), capacity).await.unwrap();
        let worker = connect(&bound).await.unwrap();
        let task = |n: u64| {
            Command::Map {
                task: TaskTag::new(n, Bytes::from_static(b"k")),
                value: Bytes::from_static(b"v"),
            }
            .into_frames()
        };

        // Keep the queue topped up while the worker never takes a task.
        let mut queued = 0u64;
        for _ in 0..50 {
            while coordinator.tasks.try_send(task(queued)).is_ok() {
                queued += 1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let taken = queued as usize - capacity;
        assert!(taken >= 1, "the push connection never took a task");
        assert!(taken <= PUSH_CREDIT + 1, "{taken} tasks left the queue");

        // Once the worker starts taking tasks, everything queued arrives.
        for n in 0..queued {
            let frames = tokio::time::timeout(Duration::from_secs(5), worker.tasks.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(Command::from_frames(frames).unwrap(), Command::from_frames(task(n)).unwrap());
        }

        coordinator.close().await;
    }

    #[tokio::test]
    async fn control_flushes_before_close() {
        let (mut coordinator, bound) = bind(&loopback(), 4).await.unwrap();
        let mut worker = connect(&bound).await.unwrap();
        let id = WorkerId::from("w1");

        worker
            .control_out
            .send(Command::Connect { worker: id.clone() }.into_frames())
            .await
            .unwrap();
        coordinator.control_in.recv().await.unwrap();

        coordinator
            .control_out
            .send(Envelope::new(id, Command::Done).into_frames())
            .unwrap();
        coordinator.close().await;

        let frames = worker.control_in.recv().await.unwrap();
        assert_eq!(Envelope::from_frames(frames).unwrap().command, Command::Done);
    }
}
