//! The worker side of the protocol.
//!
//! A worker registers once, then listens exclusively on the control channel
//! until its function bodies arrive. Tasks that are queued for it in the
//! meantime stay queued. Once ready it serves tasks and control messages
//! until told to stop:
//!
//! ```text
//! AwaitingFunctions -> Ready -> (executing) -> Ready -> ... -> Stopped
//! ```
//!
//! A failing user function is fatal to the worker. The task it was running
//! never completes, and the coordinator eventually hands it to someone else.
//!
//! A coordinator that finishes while this worker is mid-task stops reading
//! results before the worker notices. Losing the result channel is therefore
//! only an error if no stop signal follows within [`STOP_GRACE`].

use std::{marker::PhantomData, time::Duration};

use anyhow::{bail, Context, Result};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tracing::{debug, debug_span, info, instrument, warn, Instrument};

use crate::{
    codec::{Command, Envelope, Frames},
    common::{KeyValue, WorkerId},
    config::{Config, Transport},
    function::Registry,
    serializer::Serializer,
    transport::{tcp, WorkerLink},
};

/// How long a worker whose results go nowhere waits to be told to stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

enum State<R> {
    AwaitingFunctions,
    Ready(Functions<R>),
    Stopped,
}

struct Functions<R> {
    map: R,
    reduce: R,
}

/// Executes tasks on behalf of a coordinator.
///
/// `R` is the function registry shared with the coordinator.
pub struct WorkerRuntime<R> {
    id: WorkerId,
    link: WorkerLink,
    serializer: Serializer,
    tasks_open: bool,
    _registry: PhantomData<fn() -> R>,
}

impl<R: Registry> WorkerRuntime<R> {
    /// Dial the coordinator described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let link = match config.transport {
            Transport::Tcp => tcp::connect(&config.addresses()).await?,
            Transport::InMemory => {
                bail!("in-memory workers are spawned by the coordinator itself")
            }
        };
        Ok(Self::new(link, Serializer::from(config)))
    }

    pub fn new(link: WorkerLink, serializer: Serializer) -> Self {
        Self {
            id: WorkerId::random(),
            link,
            serializer,
            tasks_open: true,
            _registry: PhantomData,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Register with the coordinator and serve until told to stop.
    pub async fn main_loop(mut self) -> Result<()> {
        let span = debug_span!("worker", id = %self.id);
        async move {
            self.send_control(Command::Connect {
                worker: self.id.clone(),
            })
            .await
            .context("failed to register")?;

            let mut state = State::AwaitingFunctions;
            loop {
                state = match state {
                    State::AwaitingFunctions => self.await_functions().await?,
                    State::Ready(functions) => self.serve(functions).await?,
                    State::Stopped => {
                        info!(worker = %self.id, "stopped");
                        return Ok(());
                    }
                };
            }
        }
        .instrument(span)
        .await
    }

    /// Block on the control channel until the function bodies arrive.
    async fn await_functions(&mut self) -> Result<State<R>> {
        loop {
            let Some(command) = next_control(&mut self.link.control_in, &self.id).await? else {
                continue;
            };
            match command {
                Command::Bytecode { map, reduce } => {
                    let map: R = self
                        .serializer
                        .from_bytes(&map)
                        .context("malformed map function body")?;
                    let reduce: R = self
                        .serializer
                        .from_bytes(&reduce)
                        .context("malformed reduce function body")?;
                    info!(map = map.name(), reduce = reduce.name(), "received function bodies");
                    return Ok(State::Ready(Functions { map, reduce }));
                }
                Command::Done => return Ok(State::Stopped),
                other => warn!(command = other.name(), "unexpected control message"),
            }
        }
    }

    /// Handle the next task or control message.
    async fn serve(&mut self, functions: Functions<R>) -> Result<State<R>> {
        tokio::select! {
            biased;
            command = next_control(&mut self.link.control_in, &self.id) => match command? {
                Some(Command::Done) => return Ok(State::Stopped),
                Some(other) => warn!(command = other.name(), "unexpected control message"),
                None => {}
            },
            task = self.link.tasks.recv(), if self.tasks_open => match task {
                Some(frames) => {
                    if let Err(err) = self.execute(&functions, frames).await {
                        if self.link.results.is_closed() {
                            return self.await_stop(err).await;
                        }
                        return Err(err);
                    }
                }
                None => {
                    debug!("task channel closed, waiting for the stop signal");
                    self.tasks_open = false;
                }
            },
        }
        Ok(State::Ready(functions))
    }

    /// Wait for the stop signal after the result channel closed, failing with
    /// `cause` if it does not come.
    async fn await_stop(&mut self, cause: anyhow::Error) -> Result<State<R>> {
        debug!("result channel closed, waiting for the stop signal");
        loop {
            match timeout(STOP_GRACE, next_control(&mut self.link.control_in, &self.id)).await {
                Ok(Ok(Some(Command::Done))) => return Ok(State::Stopped),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => return Err(cause),
            }
        }
    }

    #[instrument(skip_all, level = "debug")]
    async fn execute(&self, functions: &Functions<R>, frames: Frames) -> Result<()> {
        match Command::from_frames(frames) {
            Ok(Command::Map { task, value }) => {
                let emissions = functions
                    .map
                    .map_as_bytes(self.serializer, &task.key, &value)
                    .context("map function failed")?;
                for pair in emissions {
                    let KeyValue { key, value } = pair.context("map function failed")?;
                    self.send_result(Command::MapDone {
                        task: task.clone(),
                        key,
                        value,
                    })
                    .await?;
                }
                self.send_result(Command::MapKeyDone { task }).await
            }
            Ok(Command::Reduce { task, values }) => {
                let result = functions
                    .reduce
                    .reduce_as_bytes(self.serializer, &task.key, &values)
                    .context("reduce function failed")?;
                self.send_result(Command::ReduceDone { task, result }).await
            }
            Ok(other) => {
                warn!(command = other.name(), "unexpected message on the task channel");
                Ok(())
            }
            Err(err) => {
                warn!("malformed task: {err}");
                Ok(())
            }
        }
    }

    async fn send_control(&self, command: Command) -> Result<()> {
        self.link
            .control_out
            .send(command.into_frames())
            .await
            .context("control channel closed")
    }

    async fn send_result(&self, command: Command) -> Result<()> {
        self.link
            .results
            .send(command.into_frames())
            .await
            .context("result channel closed")
    }
}

/// The next control command addressed to `id`, if the message just received
/// was one.
async fn next_control(
    control_in: &mut broadcast::Receiver<Frames>,
    id: &WorkerId,
) -> Result<Option<Command>> {
    let frames = match control_in.recv().await {
        Ok(frames) => frames,
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "fell behind on the control channel");
            return Ok(None);
        }
        Err(RecvError::Closed) => bail!("control channel closed"),
    };

    match Envelope::from_frames(frames) {
        Ok(envelope) if envelope.to == *id => Ok(Some(envelope.command)),
        Ok(_) => Ok(None),
        Err(err) => {
            warn!("malformed control message: {err}");
            Ok(None)
        }
    }
}

/// Run a worker until its coordinator tells it to stop.
pub async fn worker_loop<R: Registry>(config: &Config) -> Result<()> {
    let runtime = WorkerRuntime::<R>::from_config(config).await?;
    info!(worker = %runtime.id(), "worker started");
    runtime.main_loop().await
}
