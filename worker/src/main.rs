use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use kaylee::{config::Config, runtime::worker_loop};
use ops::Functions;

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    worker_loop::<Functions>(&args.options).await?;

    Ok(())
}
