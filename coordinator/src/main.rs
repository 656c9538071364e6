use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use kaylee::{
    config::Config,
    job::{Job, JobOutcome},
    runtime::Coordinator,
    serializer::Serializer,
};
use ops::{Functions, Grep, Sum, WordCount};
use tokio::time::Instant;
use tracing::info;

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    /// Text file whose lines are the map inputs.
    #[arg(long, short)]
    pub input: PathBuf,

    /// Only count words containing this pattern.
    #[arg(long)]
    pub grep: Option<String>,

    /// How many of the most frequent words to print.
    #[arg(long, default_value_t = 20)]
    pub top: usize,

    #[command(flatten)]
    pub options: Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    let file = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    info!(input = %args.input.display(), "streaming input");

    // Lines are read as map tasks are dispatched.
    let data = (0u64..)
        .zip(BufReader::new(file).lines())
        .map(|(n, line)| line.map(|line| (n, line)));
    let serializer = Serializer::from(&args.options);
    let job = match args.grep {
        Some(pattern) => Job::<Functions>::try_new(serializer, Grep(pattern), Sum, data),
        None => Job::<Functions>::try_new(serializer, WordCount, Sum, data),
    };

    let started = Instant::now();
    let outcome = Coordinator::from_config(&args.options, job).await?.run().await?;
    let elapsed = started.elapsed();

    let JobOutcome::Completed(results) = outcome else {
        bail!("job timed out after {elapsed:?}");
    };
    let counts: HashMap<String, u64> = results.decode()?;

    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_unstable_by(|(a_word, a), (b_word, b)| b.cmp(a).then_with(|| a_word.cmp(b_word)));
    for (word, count) in counts.iter().take(args.top) {
        println!("{count:>8} {word}");
    }
    println!("{} distinct words in {:.3}s", counts.len(), elapsed.as_secs_f64());

    Ok(())
}
