//! Command-line interface for the Wehe client.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Wehe - network-neutrality measurement client
#[derive(Parser, Debug)]
#[command(
    name = "wehe",
    author,
    version,
    about = "Detects traffic differentiation by replaying recorded app traffic",
    long_about = r#"
Wehe replays a recorded packet trace of an app's traffic against a
measurement server, then replays a byte-randomized rendition of the same
trace. If the network treats the two replays differently beyond statistical
thresholds, it is differentiating (shaping, throttling) that app's traffic.

QUICK START:
  wehe replay -n netflix
  wehe replay -n netflix,youtube -c res/config/config.ini
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more differentiation tests
    Replay(ReplayArgs),
}

/// Replay command arguments
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Names of the tests to run, comma-delimited (matched against the
    /// catalog's image names, case-insensitive)
    #[arg(short = 'n', long = "names", required = true)]
    pub test_names: String,

    /// Path to the .ini configuration file
    #[arg(short = 'c', long = "config", default_value = "res/config/config.ini")]
    pub config: PathBuf,
}
