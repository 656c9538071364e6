//! In-process transport.
//!
//! ```
//! use kaylee::transport::InMemoryBus;
//!
//! let (bus, coordinator) = InMemoryBus::channel(16);
//! let worker = bus.worker_link();
//! # drop((coordinator, worker));
//! ```

use tokio::sync::{broadcast, mpsc};

use super::{
    Backend, CoordinatorLink, TaskReceiver, WorkerLink, CONTROL_CAPACITY, RESULT_CAPACITY,
};
use crate::codec::Frames;

/// The worker-facing side of an in-memory transport.
///
/// Cloneable; every clone refers to the same channels.
#[derive(Clone, Debug)]
pub struct InMemoryBus {
    tasks: TaskReceiver,
    results: mpsc::Sender<Frames>,
    control_in: mpsc::Sender<Frames>,
    control_out: broadcast::Sender<Frames>,
}

impl InMemoryBus {
    /// Create the channels, returning the bus and the coordinator's link.
    ///
    /// `task_capacity` bounds the number of undelivered tasks.
    pub fn channel(task_capacity: usize) -> (InMemoryBus, CoordinatorLink) {
        let (tasks_tx, tasks_rx) = mpsc::channel(task_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel(RESULT_CAPACITY);
        let (control_in_tx, control_in_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (control_out, _) = broadcast::channel(CONTROL_CAPACITY);

        let bus = InMemoryBus {
            tasks: TaskReceiver::new(tasks_rx),
            results: results_tx,
            control_in: control_in_tx,
            control_out: control_out.clone(),
        };
        let link = CoordinatorLink {
            tasks: tasks_tx,
            results: results_rx,
            control_in: control_in_rx,
            control_out,
            backend: Backend::InMemory(bus.clone()),
        };

        (bus, link)
    }

    /// A new worker link.
    ///
    /// The link only observes control messages published after this call.
    pub fn worker_link(&self) -> WorkerLink {
        WorkerLink {
            tasks: self.tasks.clone(),
            results: self.results.clone(),
            control_out: self.control_in.clone(),
            control_in: self.control_out.subscribe(),
            _pumps: None,
        }
    }
}
