#![cfg_attr(docsrs, feature(doc_cfg))]

//! A small distributed MapReduce engine.
//!
//! Kaylee runs a single MapReduce job across a pool of workers. A coordinator
//! owns the job: it ships the map and reduce functions to every worker that
//! registers, streams map tasks out of the input, groups the intermediate
//! pairs by key and hands each group to a reduce task. The results of the
//! reduce tasks are the results of the job.
//!
//! Features:
//! - **Straggler tolerance**: once the input of a phase is exhausted, idle
//!   dispatch capacity is spent on redundant copies of outstanding tasks. The
//!   first result of a task wins; the others are discarded.
//! - **Shippable functions**: map and reduce functions are plain serializable
//!   values, declared once in a [`registry!`] shared by the coordinator and
//!   the workers.
//! - **Transport agnostic**: the same runtimes run over TCP or over in-process
//!   channels, the latter with emulated workers for tests and local runs.
//!
//! # How to use Kaylee
//!
//! ## Defining functions
//!
//! A map function turns one input pair into any number of intermediate
//! pairs; a reduce function folds every intermediate value of a key into a
//! single result.
//!
//! ```
//! use kaylee::function::{AnyResult, MapFunction, MapOutput, ReduceFunction};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! struct Words;
//!
//! impl MapFunction for Words {
//!     type Key = u64;
//!     type Value = String;
//!     type OutKey = String;
//!     type OutValue = u64;
//!
//!     fn map(&self, _line: u64, text: String) -> MapOutput<String, u64> {
//!         let words: Vec<_> = text
//!             .split_whitespace()
//!             .map(|word| Ok((word.to_lowercase(), 1)))
//!             .collect();
//!         Ok(Box::new(words.into_iter()))
//!     }
//! }
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! struct Total;
//!
//! impl ReduceFunction for Total {
//!     type Key = String;
//!     type Value = u64;
//!     type Output = u64;
//!
//!     fn reduce(&self, _word: String, counts: Vec<u64>) -> AnyResult<u64> {
//!         Ok(counts.into_iter().sum())
//!     }
//! }
//!
//! kaylee::registry! {
//!     enum Functions {
//!         map { Words(Words) }
//!         reduce { Total(Total) }
//!     }
//! }
//! ```
//!
//! ## Running a job
//!
//! ```
//! # use kaylee::function::{AnyResult, MapFunction, MapOutput, ReduceFunction};
//! # use serde::{Deserialize, Serialize};
//! #
//! # #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! # struct Words;
//! #
//! # impl MapFunction for Words {
//! #     type Key = u64;
//! #     type Value = String;
//! #     type OutKey = String;
//! #     type OutValue = u64;
//! #
//! #     fn map(&self, _line: u64, text: String) -> MapOutput<String, u64> {
//! #         let words: Vec<_> = text
//! #             .split_whitespace()
//! #             .map(|word| Ok((word.to_lowercase(), 1)))
//! #             .collect();
//! #         Ok(Box::new(words.into_iter()))
//! #     }
//! # }
//! #
//! # #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! # struct Total;
//! #
//! # impl ReduceFunction for Total {
//! #     type Key = String;
//! #     type Value = u64;
//! #     type Output = u64;
//! #
//! #     fn reduce(&self, _word: String, counts: Vec<u64>) -> AnyResult<u64> {
//! #         Ok(counts.into_iter().sum())
//! #     }
//! # }
//! #
//! # kaylee::registry! {
//! #     enum Functions {
//! #         map { Words(Words) }
//! #         reduce { Total(Total) }
//! #     }
//! # }
//! use std::collections::HashMap;
//!
//! use kaylee::{
//!     config::{Config, Transport},
//!     job::{Job, JobOutcome},
//!     runtime::Coordinator,
//!     serializer::Serializer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config {
//!         transport: Transport::InMemory,
//!         num_workers: Some(2),
//!         ..Default::default()
//!     };
//!     let lines = vec![(0u64, "to be or".to_string()), (1, "not to be".to_string())];
//!     let job = Job::<Functions>::new(Serializer::Postcard, Words, Total, lines);
//!
//!     let JobOutcome::Completed(results) = Coordinator::from_config(&config, job).await?.run().await? else {
//!         anyhow::bail!("timed out");
//!     };
//!     let counts: HashMap<String, u64> = results.decode()?;
//!     assert_eq!(counts["to"], 2);
//!     assert_eq!(counts["or"], 1);
//!     Ok(())
//! }
//! ```
//!
//! With the in-memory transport the coordinator spawns its own workers. With
//! the TCP transport, workers are separate processes running
//! [`worker_loop`](crate::runtime::worker_loop) with the same registry type.
//!
//! ## Application and deployment architecture
//!
//! We suggest the following project layout:
//! ```bash
//! ops
//! ├── Cargo.toml
//! └── src
//!    └── lib.rs
//! worker
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! coordinator
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! ```
//!
//! - `ops`: the function definitions and their registry, shared between
//!   `worker` and `coordinator`.
//! - `worker`: executes tasks; any number of them may run.
//! - `coordinator`: owns the job. Exactly one runs per job.
pub mod codec;
pub mod common;
pub mod config;
pub mod function;
pub mod job;
pub mod ledger;
pub mod registry;
pub mod runtime;
pub mod serializer;
pub mod store;
pub mod transport;

pub use async_trait::async_trait;
pub use bytes;
pub use futures;
pub use tracing;
