//! The job and the phase state machine that drives it.
//!
//! A job moves through its phases in a fixed order and never goes back:
//!
//! ```text
//! Start -> Map -> Shuffle -> Partition -> Reduce -> Collect -> Done
//! ```
//!
//! In `Map` and `Reduce`, fresh tasks are produced until the input is
//! exhausted. After that, as long as tasks of the phase are outstanding, every
//! request for work re-issues a uniformly random outstanding task. Idle
//! dispatch capacity is thus spent on stragglers, and a phase only ends once
//! its working set has fully drained. The [`TaskLedger`] takes care of
//! discarding the surplus results.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    iter::{Fuse, Peekable},
};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::{
    codec::{Command, TaskTag},
    common::KeyValue,
    function::Registry,
    ledger::{Stage, TaskLedger},
    serializer::Serializer,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Phase {
    Start,
    Map,
    Shuffle,
    Partition,
    Reduce,
    Collect,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::Map => "map",
            Phase::Shuffle => "shuffle",
            Phase::Partition => "partition",
            Phase::Reduce => "reduce",
            Phase::Collect => "collect",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// A unit of work ready to be pushed to a worker.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Task {
    Map { tag: TaskTag, value: Bytes },
    /// `values` is the serialized collection of intermediate values.
    Reduce { tag: TaskTag, values: Bytes },
}

impl Task {
    pub fn tag(&self) -> &TaskTag {
        match self {
            Task::Map { tag, .. } | Task::Reduce { tag, .. } => tag,
        }
    }

    pub fn into_command(self) -> Command {
        match self {
            Task::Map { tag, value } => Command::Map { task: tag, value },
            Task::Reduce { tag, values } => Command::Reduce { task: tag, values },
        }
    }
}

type Source = Box<dyn Iterator<Item = Result<KeyValue>> + Send>;

/// A MapReduce job: the functions to ship and the data to feed them.
///
/// The input is consumed lazily, one pair per dispatched map task.
pub struct Job<R> {
    serializer: Serializer,
    map: R,
    reduce: R,
    source: Source,
}

impl<R: Registry> Job<R> {
    /// A job over typed input pairs, serialized on demand.
    pub fn new<K, V, I>(serializer: Serializer, map: impl Into<R>, reduce: impl Into<R>, data: I) -> Self
    where
        K: Serialize + 'static,
        V: Serialize + 'static,
        I: IntoIterator<Item = (K, V)>,
        I::IntoIter: Send + 'static,
    {
        Self::try_new(serializer, map, reduce, data.into_iter().map(Ok::<_, anyhow::Error>))
    }

    /// Like [`Job::new`], over an input that can fail while it is read, such
    /// as the lines of a file. A read error fails the job when the pair is
    /// due for dispatch.
    pub fn try_new<K, V, E, I>(
        serializer: Serializer,
        map: impl Into<R>,
        reduce: impl Into<R>,
        data: I,
    ) -> Self
    where
        K: Serialize + 'static,
        V: Serialize + 'static,
        E: Into<anyhow::Error>,
        I: IntoIterator<Item = std::result::Result<(K, V), E>>,
        I::IntoIter: Send + 'static,
    {
        let source = data.into_iter().map(move |pair| -> Result<KeyValue> {
            let (key, value) = pair.map_err(Into::into)?;
            Ok(KeyValue::new(
                serializer.to_bytes(&key)?,
                serializer.to_bytes(&value)?,
            ))
        });
        Self::from_source(serializer, map, reduce, Box::new(source))
    }

    /// A job over pairs that are already serialized with `serializer`. They
    /// are forwarded to workers as-is.
    pub fn from_pairs<I>(serializer: Serializer, map: impl Into<R>, reduce: impl Into<R>, pairs: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
        I::IntoIter: Send + 'static,
    {
        Self::from_source(serializer, map, reduce, Box::new(pairs.into_iter().map(Ok::<_, anyhow::Error>)))
    }

    fn from_source(serializer: Serializer, map: impl Into<R>, reduce: impl Into<R>, source: Source) -> Self {
        Self {
            serializer,
            map: map.into(),
            reduce: reduce.into(),
            source,
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }
}

/// The serialized map and reduce functions, as shipped to workers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionBodies {
    pub map: Bytes,
    pub reduce: Bytes,
}

/// The reduced value of every intermediate key, still serialized.
#[derive(Clone, Debug)]
pub struct FinalResults {
    entries: HashMap<Bytes, Bytes>,
    serializer: Serializer,
}

impl FinalResults {
    pub fn raw(&self) -> &HashMap<Bytes, Bytes> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deserialize every key and value.
    pub fn decode<K, V>(&self) -> Result<HashMap<K, V>>
    where
        K: DeserializeOwned + Eq + Hash,
        V: DeserializeOwned,
    {
        self.entries
            .iter()
            .map(|(key, value)| -> Result<(K, V)> {
                let key = self
                    .serializer
                    .from_bytes(key)
                    .context("failed to decode a result key")?;
                let value = self
                    .serializer
                    .from_bytes(value)
                    .context("failed to decode a result value")?;
                Ok((key, value))
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(FinalResults),
    /// The deadline passed before the job completed.
    TimedOut,
}

/// Drives a [`Job`] through its phases.
pub struct JobStateMachine<R> {
    serializer: Serializer,
    map: R,
    reduce: R,
    source: Option<Source>,
    map_tasks: Option<Peekable<Fuse<Source>>>,
    reduce_keys: std::vec::IntoIter<Bytes>,
    rng: StdRng,
    phase: Phase,
    history: Vec<Phase>,
    completed: bool,
    bodies: Option<FunctionBodies>,
}

impl<R: Registry> JobStateMachine<R> {
    pub fn new(job: Job<R>) -> Self {
        Self {
            serializer: job.serializer,
            map: job.map,
            reduce: job.reduce,
            source: Some(job.source),
            map_tasks: None,
            reduce_keys: Vec::new().into_iter(),
            rng: StdRng::from_entropy(),
            phase: Phase::Start,
            history: vec![Phase::Start],
            completed: false,
            bodies: None,
        }
    }

    /// Use a fixed seed for redundant task selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// The serialized function bodies, generated on first use.
    pub fn function_bodies(&mut self) -> Result<FunctionBodies> {
        if let Some(bodies) = &self.bodies {
            return Ok(bodies.clone());
        }
        let bodies = FunctionBodies {
            map: self
                .serializer
                .to_bytes(&self.map)
                .context("failed to serialize the map function")?,
            reduce: self
                .serializer
                .to_bytes(&self.reduce)
                .context("failed to serialize the reduce function")?,
        };
        self.bodies = Some(bodies.clone());
        Ok(bodies)
    }

    /// The next task to dispatch, advancing through phases as needed.
    ///
    /// `None` only once the job is done.
    pub async fn next_task(&mut self, ledger: &mut TaskLedger) -> Result<Option<Task>> {
        self.step(ledger, true).await
    }

    /// Advance through every phase that can be left without dispatching.
    pub async fn advance(&mut self, ledger: &mut TaskLedger) -> Result<()> {
        self.step(ledger, false).await.map(|_| ())
    }

    async fn step(&mut self, ledger: &mut TaskLedger, dispatch: bool) -> Result<Option<Task>> {
        loop {
            match self.phase {
                Phase::Start => {
                    ledger.reset().await?;
                    self.map_tasks = self.source.take().map(|source| source.fuse().peekable());
                    self.transition(Phase::Map);
                }
                Phase::Map => {
                    let fresh = self
                        .map_tasks
                        .as_mut()
                        .is_some_and(|tasks| tasks.peek().is_some());
                    if fresh || !ledger.is_drained(Stage::Map) {
                        if !dispatch {
                            return Ok(None);
                        }
                        if let Some(task) = self.map_task(ledger)? {
                            return Ok(Some(task));
                        }
                    }
                    self.transition(Phase::Shuffle);
                }
                Phase::Shuffle => {
                    let keys = ledger.intermediate_keys().await?;
                    debug!(keys = keys.len(), "shuffled intermediate results");
                    self.reduce_keys = keys.into_iter();
                    self.transition(Phase::Partition);
                }
                // Reserved for task affinity.
                Phase::Partition => self.transition(Phase::Reduce),
                Phase::Reduce => {
                    let fresh = !self.reduce_keys.as_slice().is_empty();
                    if fresh || !ledger.is_drained(Stage::Reduce) {
                        if !dispatch {
                            return Ok(None);
                        }
                        if let Some(task) = self.reduce_task(ledger).await? {
                            return Ok(Some(task));
                        }
                    }
                    self.transition(Phase::Collect);
                }
                Phase::Collect => {
                    if !ledger.is_drained(Stage::Reduce) {
                        return Ok(None);
                    }
                    ledger.release_intermediate().await?;
                    self.completed = true;
                    self.transition(Phase::Done);
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    fn map_task(&mut self, ledger: &mut TaskLedger) -> Result<Option<Task>> {
        if let Some(pair) = self.map_tasks.as_mut().and_then(Iterator::next) {
            let KeyValue { key, value } = pair.context("failed to read the job input")?;
            let Some(tag) = ledger.record_dispatch(Stage::Map, key, value.clone()) else {
                bail!("duplicate input key");
            };
            return Ok(Some(Task::Map { tag, value }));
        }
        Ok(ledger
            .redispatch(Stage::Map, &mut self.rng)
            .map(|(tag, value)| Task::Map { tag, value }))
    }

    async fn reduce_task(&mut self, ledger: &mut TaskLedger) -> Result<Option<Task>> {
        if let Some(key) = self.reduce_keys.next() {
            let values = ledger.intermediate_values(&key).await?;
            let values = self.serializer.to_bytes(&values)?;
            let Some(tag) = ledger.record_dispatch(Stage::Reduce, key, values.clone()) else {
                bail!("duplicate intermediate key");
            };
            return Ok(Some(Task::Reduce { tag, values }));
        }
        Ok(ledger
            .redispatch(Stage::Reduce, &mut self.rng)
            .map(|(tag, values)| Task::Reduce { tag, values }))
    }

    fn transition(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "{} -> {next}", self.phase);
        info!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        self.history.push(next);
    }

    /// Hand out the final results. Empty unless the job completed.
    pub fn take_results(&mut self, ledger: &mut TaskLedger) -> FinalResults {
        FinalResults {
            entries: ledger.take_final_results(),
            serializer: self.serializer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        function::test_functions::{Failing, SplitWords, Sum, TestFunctions},
        ledger::Completion,
    };

    fn word_count(lines: &[&'static str]) -> JobStateMachine<TestFunctions> {
        let data: Vec<(u64, String)> = lines
            .iter()
            .enumerate()
            .map(|(n, line)| (n as u64, line.to_string()))
            .collect();
        JobStateMachine::new(Job::new(Serializer::Postcard, SplitWords, Sum, data)).with_seed(11)
    }

    /// Run `task` in-process, as a worker would, and feed the results back.
    async fn execute(
        job: &mut JobStateMachine<TestFunctions>,
        ledger: &mut TaskLedger,
        task: Task,
    ) -> Completion {
        let serializer = job.serializer();
        match task {
            Task::Map { tag, value } => {
                let emissions = job
                    .map
                    .map_as_bytes(serializer, &tag.key, &value)
                    .unwrap();
                for pair in emissions {
                    let _ = ledger.record_emission(tag.clone(), pair.unwrap());
                }
                ledger.complete_map(&tag).await.unwrap()
            }
            Task::Reduce { tag, values } => {
                let result = job
                    .reduce
                    .reduce_as_bytes(serializer, &tag.key, &values)
                    .unwrap();
                ledger.complete_reduce(&tag, result)
            }
        }
    }

    #[tokio::test]
    async fn word_count_over_a_single_line() {
        let mut job = word_count(&["a b a"]);
        let mut ledger = TaskLedger::default();

        while let Some(task) = job.next_task(&mut ledger).await.unwrap() {
            let _ = execute(&mut job, &mut ledger, task).await;
        }

        assert!(job.is_completed());
        assert!(ledger.intermediate_keys().await.unwrap().is_empty());
        let results: HashMap<String, u64> = job.take_results(&mut ledger).decode().unwrap();
        assert_eq!(results, HashMap::from([("a".to_string(), 2), ("b".to_string(), 1)]));
    }

    #[tokio::test]
    async fn duplicate_input_keys_fail_the_job() {
        let data = vec![(0u64, "a".to_string()), (0u64, "b".to_string())];
        let job = Job::new(Serializer::Postcard, SplitWords, Sum, data);
        let mut job = JobStateMachine::<TestFunctions>::new(job);
        let mut ledger = TaskLedger::default();

        let first = job.next_task(&mut ledger).await.unwrap().unwrap();
        let err = job.next_task(&mut ledger).await.unwrap_err();
        assert!(err.to_string().contains("duplicate input key"));

        // The first task is untouched.
        assert_eq!(ledger.outstanding(Stage::Map), 1);
        assert_eq!(execute(&mut job, &mut ledger, first).await, Completion::Accepted);
    }

    #[tokio::test]
    async fn input_read_errors_surface_on_dispatch() {
        let data = vec![
            Ok((0u64, "a b".to_string())),
            Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "not utf-8")),
        ];
        let job = Job::try_new(Serializer::Postcard, SplitWords, Sum, data);
        let mut job = JobStateMachine::<TestFunctions>::new(job);
        let mut ledger = TaskLedger::default();

        assert!(job.next_task(&mut ledger).await.unwrap().is_some());
        let err = job.next_task(&mut ledger).await.unwrap_err();
        assert!(format!("{err:#}").contains("not utf-8"));
    }

    #[tokio::test]
    async fn phases_are_visited_once_in_order() {
        let mut job = word_count(&["x y", "y z", ""]);
        let mut ledger = TaskLedger::default();

        let mut observed = vec![job.phase()];
        while let Some(task) = job.next_task(&mut ledger).await.unwrap() {
            let _ = execute(&mut job, &mut ledger, task).await;
            observed.push(job.phase());
        }
        observed.push(job.phase());

        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            job.history(),
            [
                Phase::Start,
                Phase::Map,
                Phase::Shuffle,
                Phase::Partition,
                Phase::Reduce,
                Phase::Collect,
                Phase::Done
            ]
        );
    }

    #[tokio::test]
    async fn map_drains_before_shuffle() {
        let mut job = word_count(&["a", "b"]);
        let mut ledger = TaskLedger::default();

        let first = job.next_task(&mut ledger).await.unwrap().unwrap();
        let second = job.next_task(&mut ledger).await.unwrap().unwrap();

        // Input exhausted: further requests re-issue outstanding tasks.
        for _ in 0..8 {
            let again = job.next_task(&mut ledger).await.unwrap().unwrap();
            assert!(again.tag().key == first.tag().key || again.tag().key == second.tag().key);
            assert_eq!(job.phase(), Phase::Map);
        }

        assert_eq!(execute(&mut job, &mut ledger, first.clone()).await, Completion::Accepted);
        job.advance(&mut ledger).await.unwrap();
        assert_eq!(job.phase(), Phase::Map);

        // Only the second task remains outstanding.
        let again = job.next_task(&mut ledger).await.unwrap().unwrap();
        assert_eq!(again.tag().key, second.tag().key);

        assert_eq!(execute(&mut job, &mut ledger, again).await, Completion::Accepted);
        assert_eq!(execute(&mut job, &mut ledger, second).await, Completion::Rejected);

        job.advance(&mut ledger).await.unwrap();
        assert_eq!(job.phase(), Phase::Reduce);
        assert!(job.history().contains(&Phase::Shuffle));
    }

    #[tokio::test]
    async fn one_completion_out_of_many_dispatches_suffices() {
        let mut job = word_count(&["solo"]);
        let mut ledger = TaskLedger::default();

        let mut dispatched = Vec::new();
        for _ in 0..5 {
            dispatched.push(job.next_task(&mut ledger).await.unwrap().unwrap());
        }
        assert!(dispatched.iter().all(|t| t.tag().key == dispatched[0].tag().key));

        // Only the fourth dispatch ever reports back.
        let _ = execute(&mut job, &mut ledger, dispatched.swap_remove(3)).await;
        job.advance(&mut ledger).await.unwrap();
        assert_eq!(job.phase(), Phase::Reduce);

        let mut reduces = Vec::new();
        for _ in 0..5 {
            reduces.push(job.next_task(&mut ledger).await.unwrap().unwrap());
        }
        let _ = execute(&mut job, &mut ledger, reduces.swap_remove(2)).await;
        job.advance(&mut ledger).await.unwrap();

        assert_eq!(job.phase(), Phase::Done);
        assert_eq!(job.take_results(&mut ledger).len(), 1);
    }

    #[tokio::test]
    async fn empty_input_completes_without_dispatching() {
        let mut job = word_count(&[]);
        let mut ledger = TaskLedger::default();

        job.advance(&mut ledger).await.unwrap();
        assert!(job.is_completed());
        assert!(job.take_results(&mut ledger).is_empty());
    }

    #[test]
    fn function_bodies_are_generated_once() {
        let mut job = JobStateMachine::<TestFunctions>::new(Job::new(
            Serializer::Cbor,
            Failing,
            Sum,
            Vec::<(u64, String)>::new(),
        ));
        let first = job.function_bodies().unwrap();
        assert_eq!(job.function_bodies().unwrap(), first);

        let map: TestFunctions = Serializer::Cbor.from_bytes(&first.map).unwrap();
        assert!(matches!(map, TestFunctions::Failing(_)));
    }
}
