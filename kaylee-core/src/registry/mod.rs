//! Known workers and their bootstrap state.
//!
//! Membership is monotonic for the lifetime of a job: workers are added on
//! first contact and never removed, only marked as stopped.

use std::collections::{hash_map::Entry, HashMap};

use tracing::info;

use crate::common::WorkerId;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub registered: bool,
    pub has_function_bodies: bool,
    pub stopped: bool,
}

/// Outcome of [`WorkerRegistry::register`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Registration {
    /// First contact; the worker still needs its function bodies.
    New,
    /// Already known. Nothing to do.
    Repeat,
}

#[derive(Default, Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: WorkerId) -> Registration {
        match self.workers.entry(id) {
            Entry::Occupied(_) => Registration::Repeat,
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                info!(worker = %id, "worker registered");
                entry.insert(WorkerInfo {
                    id,
                    registered: true,
                    has_function_bodies: false,
                    stopped: false,
                });
                Registration::New
            }
        }
    }

    /// Record that the function bodies were sent to `id`.
    pub fn mark_delivered(&mut self, id: &WorkerId) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.has_function_bodies = true;
        }
    }

    pub fn mark_stopped(&mut self, id: &WorkerId) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.stopped = true;
        }
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerInfo> {
        self.workers.get(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values()
    }
}
