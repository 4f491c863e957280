//! Wehe command-line client.

use clap::Parser;

use wehe::cli::{Cli, Commands};
use wehe::config::{init_logging, Config};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> wehe::Result<()> {
    match cli.command {
        Commands::Replay(args) => {
            let config = Config::load(&args.test_names, &args.config)?;
            init_logging(config.log_level)?;
            wehe::app::run(config).await
        }
    }
}
