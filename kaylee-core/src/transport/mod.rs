//! The three logical channels between a coordinator and its workers.
//!
//! - **push**: tasks, coordinator to workers. Each task is received by exactly
//!   one worker, whichever asks first.
//! - **pull**: results, workers to coordinator (fan-in).
//! - **control**: registrations flow in; addressed [`Envelope`]s flow out and
//!   are seen by every worker, which keeps only those addressed to itself.
//!
//! Both backends hand out the same link types, so the coordinator event loop
//! and the worker runtime are oblivious to whether they talk over TCP or over
//! in-process channels:
//!
//! - [`in_memory`]: tokio channels, with an [`InMemoryBus`] from which any
//!   number of worker links can be taken. Used for tests and for the worker
//!   emulator.
//! - [`tcp`]: listeners on the coordinator, dialing workers, and pump tasks
//!   bridging sockets to the same tokio channels.
//!
//! [`Envelope`]: crate::codec::Envelope

use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};
use tracing::warn;

use crate::codec::Frames;

pub mod in_memory;
pub mod tcp;

pub use in_memory::InMemoryBus;

/// Buffer size of the result channel.
pub(crate) const RESULT_CAPACITY: usize = 1024;

/// Buffer size of the control channels. A worker that falls further behind
/// than this on the control channel misses envelopes.
pub(crate) const CONTROL_CAPACITY: usize = 1024;

/// A task queue shared by competing consumers.
///
/// Every clone pulls from the same queue; each task is delivered to a single
/// caller of [`TaskReceiver::recv`].
#[derive(Clone, Debug)]
pub struct TaskReceiver(Arc<Mutex<mpsc::Receiver<Frames>>>);

impl TaskReceiver {
    pub fn new(receiver: mpsc::Receiver<Frames>) -> Self {
        Self(Arc::new(Mutex::new(receiver)))
    }

    /// Wait for the next task. `None` once the queue is closed and empty.
    ///
    /// Cancel safe: a task is never lost if the returned future is dropped.
    pub async fn recv(&self) -> Option<Frames> {
        self.0.lock().await.recv().await
    }
}

/// The coordinator's end of the three channels.
#[derive(Debug)]
pub struct CoordinatorLink {
    pub(crate) tasks: mpsc::Sender<Frames>,
    pub(crate) results: mpsc::Receiver<Frames>,
    pub(crate) control_in: mpsc::Receiver<Frames>,
    pub(crate) control_out: broadcast::Sender<Frames>,
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    /// Keeps the in-memory channels open for the lifetime of the link, and
    /// lets the coordinator hand out worker links.
    InMemory(InMemoryBus),
    Tcp(Linger),
}

impl CoordinatorLink {
    /// The bus behind an in-memory link.
    pub fn bus(&self) -> Option<&InMemoryBus> {
        match &self.backend {
            Backend::InMemory(bus) => Some(bus),
            Backend::Tcp(_) => None,
        }
    }

    /// Tear the link down.
    ///
    /// Control messages published before this call are still written out,
    /// within a bounded linger period.
    pub async fn close(self) {
        match self.backend {
            Backend::InMemory(_) => {}
            Backend::Tcp(linger) => linger.close().await,
        }
    }
}

/// Background pumps that must be given a chance to flush on shutdown.
#[derive(Debug)]
pub(crate) struct Linger {
    token: CancellationToken,
    tracker: TaskTracker,
    period: Duration,
}

impl Linger {
    async fn close(self) {
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.period, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.tracker.len(),
                "transport did not flush within the linger period"
            );
        }
    }
}

/// A worker's end of the three channels.
#[derive(Debug)]
pub struct WorkerLink {
    pub(crate) tasks: TaskReceiver,
    pub(crate) results: mpsc::Sender<Frames>,
    pub(crate) control_out: mpsc::Sender<Frames>,
    pub(crate) control_in: broadcast::Receiver<Frames>,
    /// Stops the socket pumps when the link is dropped.
    _pumps: Option<DropGuard>,
}
