//! Shared runtime configuration.
//!
//! Both the coordinator and the worker binaries flatten [`Config`] into their
//! command line, so the two sides of a job agree on addresses, transport and
//! serialization format without any extra wiring.
//!
//! # Usage:
//! ```
//! use clap::Parser;
//! use kaylee::config::{Config, Transport};
//!
//! #[derive(Parser, Debug)]
//! struct Cli {
//!     #[command(flatten)]
//!     options: Config,
//! }
//!
//! let cli = Cli::parse_from(["worker", "--transport", "in-memory", "--num-workers", "2"]);
//! assert_eq!(cli.options.transport, Transport::InMemory);
//! assert_eq!(cli.options.push_addr, "127.0.0.1:5555");
//! ```

use std::time::Duration;

use clap::{Args, ValueEnum};

const DEFAULT_PUSH_ADDR: &str = "127.0.0.1:5555";
const DEFAULT_PULL_ADDR: &str = "127.0.0.1:6666";
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:7777";
const DEFAULT_TASK_CAPACITY: usize = 64;
const HELP_HEADING: &str = "Kaylee options";

/// Represents the main configuration structure for the runtime.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Address of the task channel (coordinator to workers).
    #[arg(long, help_heading = HELP_HEADING, env = "KAYLEE_PUSH_ADDR", default_value = DEFAULT_PUSH_ADDR)]
    pub push_addr: String,

    /// Address of the result channel (workers to coordinator).
    #[arg(long, help_heading = HELP_HEADING, env = "KAYLEE_PULL_ADDR", default_value = DEFAULT_PULL_ADDR)]
    pub pull_addr: String,

    /// Address of the control channel (registration, function bodies, stop
    /// signals).
    #[arg(long, help_heading = HELP_HEADING, env = "KAYLEE_CONTROL_ADDR", default_value = DEFAULT_CONTROL_ADDR)]
    pub control_addr: String,

    /// Determines the serialization format to be used.
    #[arg(long, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Specifies the transport to use.
    #[arg(long, help_heading = HELP_HEADING, value_enum, default_value_t = Transport::Tcp)]
    pub transport: Transport,

    /// Number of emulated workers to spawn (in-memory transport only).
    #[arg(long, help_heading = HELP_HEADING)]
    pub num_workers: Option<usize>,

    /// How many dispatched tasks may queue on the task channel before the
    /// coordinator stops producing more.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_TASK_CAPACITY)]
    pub task_capacity: usize,

    /// Abort the job after this many seconds.
    #[arg(long, help_heading = HELP_HEADING, env = "KAYLEE_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Stage intermediate results in Redis (requires the `redis` feature).
    #[arg(long, help_heading = HELP_HEADING, env = "KAYLEE_REDIS_URL")]
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            push_addr: DEFAULT_PUSH_ADDR.to_string(),
            pull_addr: DEFAULT_PULL_ADDR.to_string(),
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            serializer: Default::default(),
            transport: Default::default(),
            num_workers: Default::default(),
            task_capacity: DEFAULT_TASK_CAPACITY,
            timeout_secs: Default::default(),
            redis_url: Default::default(),
        }
    }
}

impl Config {
    /// The three channel addresses, with any `tcp://` scheme stripped.
    pub fn addresses(&self) -> Addresses {
        Addresses {
            push: strip_scheme(&self.push_addr).to_string(),
            pull: strip_scheme(&self.pull_addr).to_string(),
            control: strip_scheme(&self.control_addr).to_string(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Socket addresses of the three logical channels.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Addresses {
    pub push: String,
    pub pull: String,
    pub control: String,
}

fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("tcp://").unwrap_or(addr)
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// Enumerates the available transports.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Transport {
    #[default]
    Tcp,
    InMemory,
}
