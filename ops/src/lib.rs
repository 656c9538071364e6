//! Sample map and reduce functions for demo and testing purposes.

use anyhow::Result;
use kaylee::function::{MapFunction, MapOutput, ReduceFunction};
use serde::{Deserialize, Serialize};

/// Emits `(word, 1)` for every whitespace separated word of a line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct WordCount;

impl MapFunction for WordCount {
    type Key = u64;
    type Value = String;
    type OutKey = String;
    type OutValue = u64;

    fn map(&self, _line: u64, text: String) -> MapOutput<String, u64> {
        let words: Vec<_> = text
            .split_whitespace()
            .map(|word| Ok((word.to_string(), 1)))
            .collect();
        Ok(Box::new(words.into_iter()))
    }
}

/// Like [`WordCount`], restricted to words containing the pattern.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Grep(pub String);

impl MapFunction for Grep {
    type Key = u64;
    type Value = String;
    type OutKey = String;
    type OutValue = u64;

    fn map(&self, _line: u64, text: String) -> MapOutput<String, u64> {
        let words: Vec<_> = text
            .split_whitespace()
            .filter(|word| word.contains(self.0.as_str()))
            .map(|word| Ok((word.to_string(), 1)))
            .collect();
        Ok(Box::new(words.into_iter()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct Sum;

impl ReduceFunction for Sum {
    type Key = String;
    type Value = u64;
    type Output = u64;

    fn reduce(&self, _word: String, counts: Vec<u64>) -> Result<u64> {
        Ok(counts.into_iter().sum())
    }
}

kaylee::registry! {
    pub enum Functions {
        map { WordCount(WordCount), Grep(Grep) }
        reduce { Sum(Sum) }
    }
}
