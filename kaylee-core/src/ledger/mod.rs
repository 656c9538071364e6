//! Per-phase task bookkeeping: what is outstanding, and which results count.
//!
//! Each stage has a [`WorkingSet`] of dispatched but unconfirmed task keys.
//! A result is applied only while its task key is still in the working set,
//! and applying it removes the key. This single rule neutralizes duplicate,
//! late and superseded results, whatever their origin.
//!
//! Map results arrive as a stream of emitted pairs followed by a completion
//! sentinel. Emitted pairs are buffered per dispatch attempt ([`TaskTag`])
//! and only reach the intermediate store once the sentinel of that same
//! attempt is accepted. Pairs from any other attempt of the key are then
//! discarded, so two redundant dispatches of one task can never both
//! contribute.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;
use rand::{seq::SliceRandom, Rng};
use tracing::trace;

use crate::{
    codec::TaskTag,
    common::KeyValue,
    store::{InMemoryStore, IntermediateStore},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
    Map,
    Reduce,
}

/// Outcome of submitting a result to the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[must_use]
pub enum Completion {
    Accepted,
    /// The task was not outstanding; the result was ignored.
    Rejected,
}

/// Outstanding task keys of one stage, with their original payloads.
///
/// Supports uniform random selection in constant time.
#[derive(Default, Debug)]
pub struct WorkingSet {
    keys: Vec<Bytes>,
    entries: HashMap<Bytes, (usize, Bytes)>,
}

impl WorkingSet {
    /// Returns `false`, keeping the original payload, if `key` is already
    /// outstanding.
    pub fn insert(&mut self, key: Bytes, payload: Bytes) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key.clone(), (self.keys.len(), payload));
        self.keys.push(key);
        true
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Bytes> {
        let (index, payload) = self.entries.remove(key)?;
        self.keys.swap_remove(index);
        if let Some(moved) = self.keys.get(index) {
            if let Some(entry) = self.entries.get_mut(moved) {
                entry.0 = index;
            }
        }
        Some(payload)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// A uniformly random outstanding key and its payload.
    pub fn choose<G: Rng + ?Sized>(&self, rng: &mut G) -> Option<(&Bytes, &Bytes)> {
        let key = self.keys.choose(rng)?;
        self.entries.get(key).map(|(_, payload)| (key, payload))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.entries.clear();
    }
}

pub struct TaskLedger {
    map: WorkingSet,
    reduce: WorkingSet,
    /// Emitted pairs of map attempts whose sentinel has not arrived yet.
    pending: HashMap<TaskTag, Vec<KeyValue>>,
    store: Box<dyn IntermediateStore>,
    finals: HashMap<Bytes, Bytes>,
    next_attempt: u64,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new(Box::<InMemoryStore>::default())
    }
}

impl TaskLedger {
    pub fn new(store: Box<dyn IntermediateStore>) -> Self {
        Self {
            map: WorkingSet::default(),
            reduce: WorkingSet::default(),
            pending: HashMap::new(),
            store,
            finals: HashMap::new(),
            next_attempt: 0,
        }
    }

    fn set(&self, stage: Stage) -> &WorkingSet {
        match stage {
            Stage::Map => &self.map,
            Stage::Reduce => &self.reduce,
        }
    }

    fn set_mut(&mut self, stage: Stage) -> &mut WorkingSet {
        match stage {
            Stage::Map => &mut self.map,
            Stage::Reduce => &mut self.reduce,
        }
    }

    fn tag(&mut self, key: Bytes) -> TaskTag {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        TaskTag::new(attempt, key)
    }

    /// Mark `key` as outstanding in `stage` and tag its first dispatch.
    ///
    /// `None` if `key` is already outstanding. The outstanding task keeps its
    /// payload and no attempt is issued.
    pub fn record_dispatch(
        &mut self,
        stage: Stage,
        key: Bytes,
        payload: Bytes,
    ) -> Option<TaskTag> {
        if !self.set_mut(stage).insert(key.clone(), payload) {
            return None;
        }
        Some(self.tag(key))
    }

    /// Pick an outstanding task of `stage` at random and tag a new dispatch
    /// of it. `None` once the stage is drained.
    pub fn redispatch<G: Rng + ?Sized>(&mut self, stage: Stage, rng: &mut G) -> Option<(TaskTag, Bytes)> {
        let (key, payload) = self.set(stage).choose(rng)?;
        let (key, payload) = (key.clone(), payload.clone());
        Some((self.tag(key), payload))
    }

    /// Buffer one pair emitted by the map attempt `tag`.
    pub fn record_emission(&mut self, tag: TaskTag, pair: KeyValue) -> Completion {
        if !self.map.contains(&tag.key) {
            return Completion::Rejected;
        }
        self.pending.entry(tag).or_default().push(pair);
        Completion::Accepted
    }

    /// Apply the completion sentinel of the map attempt `tag`.
    ///
    /// On acceptance, the pairs buffered for this attempt are appended to the
    /// intermediate store and the buffers of every other attempt of the same
    /// key are dropped.
    pub async fn complete_map(&mut self, tag: &TaskTag) -> Result<Completion> {
        if self.map.remove(&tag.key).is_none() {
            self.pending.remove(tag);
            return Ok(Completion::Rejected);
        }

        let pairs = self.pending.remove(tag).unwrap_or_default();
        self.pending.retain(|other, _| other.key != tag.key);
        trace!(attempt = tag.attempt, pairs = pairs.len(), "map task complete");
        self.store.extend(pairs).await?;
        Ok(Completion::Accepted)
    }

    /// Apply the result of the reduce attempt `tag`. Final results are
    /// write-once.
    pub fn complete_reduce(&mut self, tag: &TaskTag, result: Bytes) -> Completion {
        if self.reduce.remove(&tag.key).is_none() {
            return Completion::Rejected;
        }
        self.finals.entry(tag.key.clone()).or_insert(result);
        Completion::Accepted
    }

    pub fn is_drained(&self, stage: Stage) -> bool {
        self.set(stage).is_empty()
    }

    pub fn outstanding(&self, stage: Stage) -> usize {
        self.set(stage).len()
    }

    /// Forget everything, including the intermediate store's contents.
    pub async fn reset(&mut self) -> Result<()> {
        self.map.clear();
        self.reduce.clear();
        self.pending.clear();
        self.finals.clear();
        self.store.clear().await
    }

    /// Drop the intermediate pairs once nothing will read them again.
    pub async fn release_intermediate(&mut self) -> Result<()> {
        self.pending.clear();
        self.store.clear().await
    }

    pub async fn intermediate_keys(&mut self) -> Result<Vec<Bytes>> {
        self.store.keys().await
    }

    pub async fn intermediate_values(&mut self, key: &[u8]) -> Result<Vec<Bytes>> {
        self.store.get(key).await
    }

    pub fn final_results(&self) -> &HashMap<Bytes, Bytes> {
        &self.finals
    }

    pub fn take_final_results(&mut self) -> HashMap<Bytes, Bytes> {
        std::mem::take(&mut self.finals)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn key(k: &'static str) -> Bytes {
        Bytes::from_static(k.as_bytes())
    }

    fn pair(k: &'static str, v: &'static str) -> KeyValue {
        KeyValue::new(k, v)
    }

    #[test]
    fn working_set_tracks_indices_across_removals() {
        let mut set = WorkingSet::default();
        for k in ["a", "b", "c", "d"] {
            assert!(set.insert(key(k), key(k)));
        }
        assert!(!set.insert(key("a"), key("other")));

        assert_eq!(set.remove(b"a"), Some(key("a")));
        assert_eq!(set.remove(b"c"), Some(key("c")));
        assert_eq!(set.remove(b"c"), None);
        assert_eq!(set.len(), 2);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let (k, payload) = set.choose(&mut rng).unwrap();
            assert!(k == "b" || k == "d");
            assert_eq!(k, payload);
        }
    }

    #[tokio::test]
    async fn duplicate_map_completion_is_idempotent() {
        let mut ledger = TaskLedger::default();
        let tag = ledger.record_dispatch(Stage::Map, key("0"), key("a b a")).unwrap();

        for kv in [pair("a", "1"), pair("b", "1"), pair("a", "1")] {
            assert_eq!(ledger.record_emission(tag.clone(), kv), Completion::Accepted);
        }
        assert_eq!(ledger.complete_map(&tag).await.unwrap(), Completion::Accepted);
        assert!(ledger.is_drained(Stage::Map));

        // The same messages again.
        assert_eq!(
            ledger.record_emission(tag.clone(), pair("a", "1")),
            Completion::Rejected
        );
        assert_eq!(ledger.complete_map(&tag).await.unwrap(), Completion::Rejected);

        assert_eq!(ledger.intermediate_values(b"a").await.unwrap().len(), 2);
        assert_eq!(ledger.intermediate_values(b"b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_the_first_completed_attempt_contributes() {
        let mut ledger = TaskLedger::default();
        let mut rng = StdRng::seed_from_u64(1);
        let first = ledger.record_dispatch(Stage::Map, key("0"), key("x")).unwrap();
        let (second, payload) = ledger.redispatch(Stage::Map, &mut rng).unwrap();
        assert_eq!(second.key, first.key);
        assert_ne!(second.attempt, first.attempt);
        assert_eq!(payload, key("x"));

        // Interleaved emissions from both attempts.
        let _ = ledger.record_emission(first.clone(), pair("x", "1"));
        let _ = ledger.record_emission(second.clone(), pair("x", "1"));
        let _ = ledger.record_emission(first.clone(), pair("y", "1"));

        assert_eq!(ledger.complete_map(&second).await.unwrap(), Completion::Accepted);
        assert_eq!(ledger.complete_map(&first).await.unwrap(), Completion::Rejected);

        assert_eq!(ledger.intermediate_values(b"x").await.unwrap().len(), 1);
        assert!(ledger.intermediate_values(b"y").await.unwrap().is_empty());
        assert!(ledger.pending.is_empty());
    }

    #[test]
    fn reduce_results_are_write_once() {
        let mut ledger = TaskLedger::default();
        let mut rng = StdRng::seed_from_u64(3);
        let first = ledger.record_dispatch(Stage::Reduce, key("a"), key("[1,1]")).unwrap();
        let (second, _) = ledger.redispatch(Stage::Reduce, &mut rng).unwrap();

        assert_eq!(
            ledger.complete_reduce(&second, key("2")),
            Completion::Accepted
        );
        assert_eq!(
            ledger.complete_reduce(&first, key("3")),
            Completion::Rejected
        );
        assert_eq!(ledger.final_results().get(&key("a")), Some(&key("2")));
        assert!(ledger.is_drained(Stage::Reduce));
        assert!(ledger.redispatch(Stage::Reduce, &mut rng).is_none());
    }

    #[test]
    fn results_for_unknown_tasks_are_rejected() {
        let mut ledger = TaskLedger::default();
        let stray = TaskTag::new(9, key("nope"));
        assert_eq!(
            ledger.record_emission(stray.clone(), pair("a", "1")),
            Completion::Rejected
        );
        assert_eq!(ledger.complete_reduce(&stray, key("1")), Completion::Rejected);
        assert!(ledger.final_results().is_empty());
    }

    #[tokio::test]
    async fn outstanding_keys_are_not_dispatched_twice() {
        let mut ledger = TaskLedger::default();
        let first = ledger.record_dispatch(Stage::Map, key("0"), key("a")).unwrap();
        assert!(ledger.record_dispatch(Stage::Map, key("0"), key("b")).is_none());
        assert_eq!(ledger.outstanding(Stage::Map), 1);

        let _ = ledger.record_emission(first.clone(), pair("a", "1"));
        assert_eq!(ledger.complete_map(&first).await.unwrap(), Completion::Accepted);

        // Completed keys are no longer outstanding.
        assert!(ledger.record_dispatch(Stage::Map, key("0"), key("c")).is_some());
    }

    #[tokio::test]
    async fn releasing_intermediate_pairs_keeps_final_results() {
        let mut ledger = TaskLedger::default();
        let map = ledger.record_dispatch(Stage::Map, key("0"), key("a")).unwrap();
        let _ = ledger.record_emission(map.clone(), pair("a", "1"));
        let _ = ledger.complete_map(&map).await.unwrap();
        let reduce = ledger.record_dispatch(Stage::Reduce, key("a"), key("[1]")).unwrap();
        let _ = ledger.complete_reduce(&reduce, key("1"));

        ledger.release_intermediate().await.unwrap();
        assert!(ledger.intermediate_keys().await.unwrap().is_empty());
        assert_eq!(ledger.final_results().len(), 1);
    }
}
