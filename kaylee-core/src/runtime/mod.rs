//! The coordinator and worker runtimes.
//!
//! It provides two runtimes:
//! - [`Coordinator`]: owns a [`Job`], dispatches its tasks and collects their
//!   results until the job completes or times out.
//! - [`WorkerRuntime`]: executes tasks on behalf of a coordinator.
//!
//! # Event loop
//!
//! The coordinator is a single task multiplexing three inputs, in priority
//! order:
//!
//! - **control**: worker registrations. A new worker is sent the function
//!   bodies exactly once; repeated registrations are ignored.
//! - **results**: applied through the [`TaskLedger`], after which the job is
//!   given a chance to advance phases.
//! - **dispatch**: whenever the task channel has room and at least one worker
//!   is registered, the next task of the job is pushed. Once the input of a
//!   phase is exhausted, the free capacity is spent on redundant copies of
//!   outstanding tasks.
//!
//! Once the job completes (or its deadline passes), every registered worker is
//! told to stop and the transport is torn down.
//!
//! With the in-memory transport, the coordinator spawns its own workers (the
//! "emulator"), which makes it possible to run complete jobs in a single
//! process:
//!
//! ```no_run
//! # use anyhow::Result;
//! # use kaylee::{config::{Config, Transport}, job::{Job, JobOutcome}, runtime::Coordinator};
//! # async fn run<R: kaylee::function::Registry>(job: Job<R>) -> Result<()> {
//! let config = Config {
//!     transport: Transport::InMemory,
//!     num_workers: Some(4),
//!     ..Default::default()
//! };
//! match Coordinator::from_config(&config, job).await?.run().await? {
//!     JobOutcome::Completed(results) => println!("{} keys", results.len()),
//!     JobOutcome::TimedOut => println!("timed out"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`Job`]: crate::job::Job
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::{
    task::JoinSet,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, trace, warn};

pub use self::worker::{worker_loop, WorkerRuntime};
use crate::{
    codec::{Command, Envelope, Frames},
    common::{KeyValue, WorkerId},
    config::{Config, Transport},
    function::Registry,
    job::{Job, JobOutcome, JobStateMachine},
    ledger::{Completion, Stage, TaskLedger},
    registry::{Registration, WorkerRegistry},
    serializer::Serializer,
    store::{self, IntermediateStore},
    transport::{tcp, CoordinatorLink, InMemoryBus},
};

pub mod worker;

/// Emulated workers spawned when the configuration does not say.
const DEFAULT_EMULATED_WORKERS: usize = 4;

/// How long emulated workers get to wind down after the job.
const EMULATOR_GRACE: Duration = Duration::from_secs(5);

/// Runs a single job to completion.
pub struct Coordinator<R> {
    link: CoordinatorLink,
    job: JobStateMachine<R>,
    ledger: TaskLedger,
    registry: WorkerRegistry,
    timeout: Option<Duration>,
    emulator: Option<JoinSet<Result<()>>>,
}

impl<R: Registry> Coordinator<R> {
    /// Set up the transport, the intermediate store and, for the in-memory
    /// transport, the emulated workers.
    pub async fn from_config(config: &Config, job: Job<R>) -> Result<Self> {
        let serializer = job.serializer();
        let (link, emulator) = match config.transport {
            Transport::Tcp => {
                let (link, _) = tcp::bind(&config.addresses(), config.task_capacity).await?;
                (link, None)
            }
            Transport::InMemory => {
                let (bus, link) = InMemoryBus::channel(config.task_capacity);
                let num_workers = config.num_workers.unwrap_or(DEFAULT_EMULATED_WORKERS);
                (link, Some(spawn_emulator::<R>(&bus, serializer, num_workers)))
            }
        };

        let mut coordinator = Self::new(link, job).with_store(store::from_config(config).await?);
        coordinator.timeout = config.timeout();
        coordinator.emulator = emulator;
        Ok(coordinator)
    }

    pub fn new(link: CoordinatorLink, job: Job<R>) -> Self {
        Self {
            link,
            job: JobStateMachine::new(job),
            ledger: TaskLedger::default(),
            registry: WorkerRegistry::new(),
            timeout: None,
            emulator: None,
        }
    }

    pub fn with_store(mut self, store: Box<dyn IntermediateStore>) -> Self {
        self.ledger = TaskLedger::new(store);
        self
    }

    /// Give up on the job once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the job.
    ///
    /// Workers are stopped and the transport is closed on every exit path,
    /// errors included.
    pub async fn run(mut self) -> Result<JobOutcome> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let started = Instant::now();

        let outcome = match self.event_loop(deadline).await {
            Ok(true) => {
                let results = self.job.take_results(&mut self.ledger);
                info!(
                    keys = results.len(),
                    elapsed = ?started.elapsed(),
                    "job completed"
                );
                Ok(JobOutcome::Completed(results))
            }
            Ok(false) => {
                warn!(phase = %self.job.phase(), "job timed out");
                Ok(JobOutcome::TimedOut)
            }
            Err(err) => Err(err),
        };

        self.shutdown().await;
        outcome
    }

    /// Returns `false` if the deadline passed first.
    async fn event_loop(&mut self, deadline: Option<Instant>) -> Result<bool> {
        // Empty input completes without any worker.
        self.job.advance(&mut self.ledger).await?;

        let expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        while !self.job.is_completed() {
            tokio::select! {
                biased;
                _ = &mut expired => return Ok(false),
                frames = self.link.control_in.recv() => {
                    let Some(frames) = frames else {
                        bail!("control channel closed");
                    };
                    self.on_control(frames)?;
                    while let Ok(frames) = self.link.control_in.try_recv() {
                        self.on_control(frames)?;
                    }
                }
                frames = self.link.results.recv() => {
                    let Some(frames) = frames else {
                        bail!("result channel closed");
                    };
                    self.on_result(frames).await?;
                    while let Ok(frames) = self.link.results.try_recv() {
                        self.on_result(frames).await?;
                    }
                    self.job.advance(&mut self.ledger).await?;
                }
                permit = self.link.tasks.clone().reserve_owned(), if !self.registry.is_empty() => {
                    let Ok(permit) = permit else {
                        bail!("task channel closed");
                    };
                    if let Some(task) = self.job.next_task(&mut self.ledger).await? {
                        trace!(
                            attempt = task.tag().attempt,
                            phase = %self.job.phase(),
                            "dispatching task"
                        );
                        permit.send(task.into_command().into_frames());
                    }
                }
            }
        }

        Ok(true)
    }

    fn on_control(&mut self, frames: Frames) -> Result<()> {
        match Command::from_frames(frames) {
            Ok(Command::Connect { worker }) => {
                if self.registry.register(worker.clone()) == Registration::Repeat {
                    debug!(%worker, "repeated registration");
                    return Ok(());
                }
                let bodies = self.job.function_bodies()?;
                self.publish(
                    &worker,
                    Command::Bytecode {
                        map: bodies.map,
                        reduce: bodies.reduce,
                    },
                );
                self.registry.mark_delivered(&worker);
            }
            Ok(other) => warn!(command = other.name(), "unexpected message on the control channel"),
            Err(err) => warn!("malformed control message: {err}"),
        }
        Ok(())
    }

    async fn on_result(&mut self, frames: Frames) -> Result<()> {
        let command = match Command::from_frames(frames) {
            Ok(command) => command,
            Err(err) => {
                warn!("malformed result: {err}");
                return Ok(());
            }
        };

        let name = command.name();
        let completion = match command {
            Command::MapDone { task, key, value } => {
                self.ledger.record_emission(task, KeyValue { key, value })
            }
            Command::MapKeyDone { task } => {
                let completion = self.ledger.complete_map(&task).await?;
                if completion == Completion::Accepted {
                    debug!(
                        attempt = task.attempt,
                        remaining = self.ledger.outstanding(Stage::Map),
                        "map task completed"
                    );
                }
                completion
            }
            Command::ReduceDone { task, result } => {
                let completion = self.ledger.complete_reduce(&task, result);
                if completion == Completion::Accepted {
                    debug!(
                        attempt = task.attempt,
                        remaining = self.ledger.outstanding(Stage::Reduce),
                        "reduce task completed"
                    );
                }
                completion
            }
            other => {
                warn!(command = other.name(), "unexpected message on the result channel");
                return Ok(());
            }
        };

        if completion == Completion::Rejected {
            trace!(command = name, "discarded result of a task that is not outstanding");
        }
        Ok(())
    }

    /// Send `command` to a single worker over the control channel.
    fn publish(&self, to: &WorkerId, command: Command) {
        let name = command.name();
        if self
            .link
            .control_out
            .send(Envelope::new(to.clone(), command).into_frames())
            .is_err()
        {
            debug!(worker = %to, command = name, "nobody is listening on the control channel");
        }
    }

    async fn shutdown(mut self) {
        // Late registrations still get a stop signal.
        while let Ok(frames) = self.link.control_in.try_recv() {
            if let Err(err) = self.on_control(frames) {
                warn!("failed to handle a late registration: {err:#}");
            }
        }

        let running: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|worker| !worker.stopped)
            .map(|worker| worker.id.clone())
            .collect();
        for id in &running {
            self.publish(id, Command::Done);
            self.registry.mark_stopped(id);
        }
        debug!(workers = running.len(), "stop signal sent");

        // A completed job has already released them.
        if !self.job.is_completed() {
            if let Err(err) = self.ledger.release_intermediate().await {
                warn!("failed to clear the intermediate store: {err:#}");
            }
        }

        let Self { link, emulator, .. } = self;
        link.close().await;

        if let Some(mut workers) = emulator {
            let joined = timeout(EMULATOR_GRACE, async {
                while let Some(joined) = workers.join_next().await {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!("emulated worker failed: {err:#}"),
                        Err(err) => warn!("emulated worker panicked: {err}"),
                    }
                }
            })
            .await;
            if joined.is_err() {
                warn!("emulated workers did not stop in time");
            }
        }
    }
}

/// Spawn `num_workers` workers over the in-memory bus.
fn spawn_emulator<R: Registry>(
    bus: &InMemoryBus,
    serializer: Serializer,
    num_workers: usize,
) -> JoinSet<Result<()>> {
    let mut workers = JoinSet::new();
    for _ in 0..num_workers {
        let runtime = WorkerRuntime::<R>::new(bus.worker_link(), serializer);
        workers.spawn(runtime.main_loop());
    }
    debug!(num_workers, "spawned emulated workers");
    workers
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::broadcast::error::RecvError;

    use super::*;
    use crate::{
        config::Addresses,
        function::test_functions::{SplitWords, Sum, TestFunctions},
    };

    const SERIALIZER: Serializer = Serializer::Postcard;
    const GUARD: Duration = Duration::from_secs(10);

    fn word_count(lines: &[&str]) -> Job<TestFunctions> {
        let data: Vec<(u64, String)> = lines
            .iter()
            .enumerate()
            .map(|(n, line)| (n as u64, line.to_string()))
            .collect();
        Job::new(SERIALIZER, SplitWords, Sum, data)
    }

    fn counts(outcome: JobOutcome) -> HashMap<String, u64> {
        match outcome {
            JobOutcome::Completed(results) => results.decode().unwrap(),
            JobOutcome::TimedOut => panic!("job timed out"),
        }
    }

    fn expected(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn emulated_word_count() {
        let config = Config {
            transport: Transport::InMemory,
            num_workers: Some(3),
            ..Default::default()
        };
        let coordinator = Coordinator::from_config(&config, word_count(&["a b a"]))
            .await
            .unwrap();

        let outcome = timeout(GUARD, coordinator.run()).await.unwrap().unwrap();
        assert_eq!(counts(outcome), expected(&[("a", 2), ("b", 1)]));
    }

    #[tokio::test]
    async fn empty_input_completes_without_workers() {
        let config = Config {
            transport: Transport::InMemory,
            num_workers: Some(0),
            ..Default::default()
        };
        let coordinator = Coordinator::from_config(&config, word_count(&[]))
            .await
            .unwrap();

        let outcome = timeout(GUARD, coordinator.run()).await.unwrap().unwrap();
        assert!(counts(outcome).is_empty());
    }

    #[tokio::test]
    async fn times_out_without_workers() {
        let (_bus, link) = InMemoryBus::channel(4);
        let coordinator =
            Coordinator::new(link, word_count(&["a"])).with_timeout(Duration::from_millis(50));

        let outcome = timeout(GUARD, coordinator.run()).await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::TimedOut));
    }

    #[tokio::test]
    async fn each_worker_is_bootstrapped_and_stopped_once() {
        let (bus, link) = InMemoryBus::channel(8);
        let mut observer = bus.worker_link();
        let workers: Vec<_> = (0..2)
            .map(|_| WorkerRuntime::<TestFunctions>::new(bus.worker_link(), SERIALIZER))
            .collect();
        let ids: Vec<WorkerId> = workers.iter().map(|w| w.id().clone()).collect();
        drop(bus);

        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| tokio::spawn(w.main_loop()))
            .collect();
        // A duplicate registration on behalf of the first worker.
        observer
            .control_out
            .send(Command::Connect { worker: ids[0].clone() }.into_frames())
            .await
            .unwrap();
        // Let both workers register before the job starts.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = tokio::spawn(Coordinator::new(link, word_count(&["a b", "b c", "a"])).run());

        let mut seen: HashMap<(WorkerId, &'static str), usize> = HashMap::new();
        loop {
            match observer.control_in.recv().await {
                Ok(frames) => {
                    let envelope = Envelope::from_frames(frames).unwrap();
                    *seen
                        .entry((envelope.to, envelope.command.name()))
                        .or_default() += 1;
                }
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => panic!("observer lagged by {n}"),
            }
        }

        let outcome = timeout(GUARD, job).await.unwrap().unwrap().unwrap();
        assert_eq!(counts(outcome), expected(&[("a", 2), ("b", 2), ("c", 1)]));
        for handle in handles {
            timeout(GUARD, handle).await.unwrap().unwrap().unwrap();
        }

        for id in &ids {
            assert_eq!(seen.get(&(id.clone(), "bytecode")), Some(&1), "{id}");
            assert_eq!(seen.get(&(id.clone(), "done")), Some(&1), "{id}");
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn completes_despite_a_worker_that_swallows_tasks() {
        let (bus, link) = InMemoryBus::channel(8);

        let black_hole = bus.worker_link();
        black_hole
            .control_out
            .send(Command::Connect { worker: WorkerId::from("black-hole") }.into_frames())
            .await
            .unwrap();
        let swallowed = tokio::spawn(async move {
            let mut swallowed = 0usize;
            while black_hole.tasks.recv().await.is_some() {
                swallowed += 1;
            }
            swallowed
        });

        let worker = WorkerRuntime::<TestFunctions>::new(bus.worker_link(), SERIALIZER);
        let worker = tokio::spawn(worker.main_loop());
        drop(bus);

        let coordinator = Coordinator::new(link, word_count(&["x y", "y", "z x y"]));
        let outcome = timeout(GUARD, coordinator.run()).await.unwrap().unwrap();
        assert_eq!(counts(outcome), expected(&[("x", 2), ("y", 3), ("z", 1)]));

        timeout(GUARD, worker).await.unwrap().unwrap().unwrap();
        // The task channel closes with the coordinator.
        timeout(GUARD, swallowed).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn word_count_over_tcp() {
        let loopback = Addresses {
            push: "127.0.0.1:0".to_string(),
            pull: "127.0.0.1:0".to_string(),
            control: "127.0.0.1:0".to_string(),
        };
        let (link, bound) = tcp::bind(&loopback, 8).await.unwrap();

        let mut workers = Vec::new();
        for _ in 0..2 {
            let link = tcp::connect(&bound).await.unwrap();
            let worker = WorkerRuntime::<TestFunctions>::new(link, SERIALIZER);
            workers.push(tokio::spawn(worker.main_loop()));
        }
        // Let both workers register before the job starts.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let job = word_count(&["a b", "b c", "a", "c c d", "d a"]);
        let outcome = timeout(GUARD, Coordinator::new(link, job).run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            counts(outcome),
            expected(&[("a", 3), ("b", 2), ("c", 3), ("d", 2)])
        );

        for worker in workers {
            timeout(GUARD, worker).await.unwrap().unwrap().unwrap();
        }
    }
}
