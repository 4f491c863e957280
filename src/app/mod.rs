//! Top-level driver: identity, replay ordering, server fan-out.
//!
//! The driver reads (or mints) the user identity, loads the requested
//! tests, bootstraps the server set once, and then runs each test through
//! the orchestrator with a freshly flipped replay order.

use std::path::Path;

use colored::Colorize;
use rand::Rng;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::orchestrator::{ReplayType, Status, TestOrchestrator, TestResult};
use crate::server::{self, Server};
use crate::testdata::{self, Test};

const USER_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const USER_ID_LENGTH: usize = 10;
/// Command-line user IDs are distinguished from the mobile apps' by their
/// first character.
const USER_ID_FIRST_CHAR: char = '@';

/// Runs the whole measurement session described by `cfg`.
pub async fn run(cfg: Config) -> Result<()> {
    let (user_id, test_id) = read_user_config(&cfg.user_config_file);
    info!(%user_id, test_id, "starting session");

    let mut tests = testdata::load_tests(&cfg.tests_config_file, &cfg.test_names)?;
    let mut servers = server::bootstrap_servers(&cfg).await?;

    let outcome = run_tests(&cfg, &mut tests, &mut servers, &user_id, test_id).await;
    for srv in &mut servers {
        srv.close().await;
    }
    outcome
}

async fn run_tests(
    cfg: &Config,
    tests: &mut [Test],
    servers: &mut [Server],
    user_id: &str,
    mut test_id: u32,
) -> Result<()> {
    for test in tests.iter_mut() {
        test_id += 1;
        test.test_id = test_id;

        let replay_types = replay_order();
        info!(name = %test.name, test_id, ?replay_types, "running test");

        let mut orchestrator = TestOrchestrator::new(test, replay_types, cfg, servers);
        let results = orchestrator.run(user_id, crate::VERSION).await?;
        print_results(test, &results);
    }
    Ok(())
}

/// Fair coin flip deciding which rendition replays first.
fn replay_order() -> [ReplayType; 2] {
    if rand::thread_rng().gen_bool(0.5) {
        [ReplayType::Original, ReplayType::Random]
    } else {
        [ReplayType::Random, ReplayType::Original]
    }
}

fn print_results(test: &Test, results: &[TestResult]) {
    println!();
    println!("{}", test.name.bold());
    println!(
        "  client avg throughput: original {:.2} Mbps, random {:.2} Mbps",
        test.original_throughput, test.random_throughput
    );
    for result in results {
        let status = match result.status {
            Status::NoDifferentiation => result.status.to_string().green(),
            Status::ResultsInconclusive => result.status.to_string().yellow(),
            Status::DifferentiationDetected => result.status.to_string().red(),
        };
        println!("  {} [{}]", status.bold(), result.server_hostname);
        println!(
            "    server avg throughput: original {:.2} Mbps, random {:.2} Mbps",
            result.ks2_result.original_avg_throughput, result.ks2_result.random_avg_throughput
        );
        println!(
            "    area {:.3} (threshold {:.2}), p-value {:.4} (threshold {:.4})",
            result.ks2_result.area0_var,
            result.area_threshold,
            result.ks2_result.ks2_p_val,
            result.ks2_p_value_threshold
        );
    }
}

/// Reads the user ID and test ID from the two-line user-config file.
/// An unreadable or invalid file yields a fresh identity with the test
/// counter reset.
fn read_user_config<P: AsRef<Path>>(path: P) -> (String, u32) {
    let Ok(contents) = std::fs::read_to_string(path.as_ref()) else {
        return (generate_user_id(), 0);
    };
    let mut lines = contents.lines();
    let user_id = lines.next().unwrap_or_default().to_string();
    let test_id = lines.next().and_then(|line| line.trim().parse().ok());

    match test_id {
        Some(test_id) if is_user_id_valid(&user_id) => (user_id, test_id),
        _ => (generate_user_id(), 0),
    }
}

/// A valid command-line user ID is ten characters: `@` followed by nine
/// alphanumerics.
fn is_user_id_valid(user_id: &str) -> bool {
    let mut chars = user_id.chars();
    chars.next() == Some(USER_ID_FIRST_CHAR)
        && user_id.len() == USER_ID_LENGTH
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Mints a fresh user ID.
fn generate_user_id() -> String {
    let mut rng = rand::thread_rng();
    let mut user_id = String::with_capacity(USER_ID_LENGTH);
    user_id.push(USER_ID_FIRST_CHAR);
    for _ in 1..USER_ID_LENGTH {
        let index = rng.gen_range(0..USER_ID_CHARSET.len());
        user_id.push(USER_ID_CHARSET[index] as char);
    }
    user_id
}
