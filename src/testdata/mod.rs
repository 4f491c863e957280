//! Test catalog and server-computed statistics.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

mod trace;

pub use trace::{load_replay, CSPair, Packet, ReplayInfo, TcpPacket, UdpPacket};

/// One entry of the test catalog: a named app trace plus the state the
/// orchestrator accumulates while the test runs.
#[derive(Debug, Clone, Deserialize)]
pub struct Test {
    /// Pretty name shown to the user.
    pub name: String,

    /// Duration budget in seconds for a single replay.
    pub time: u64,

    /// Icon identifier; doubles as the stable command-line key.
    pub image: String,

    /// File name of the original replay trace.
    pub datafile: String,

    /// File name of the byte-randomized replay trace.
    pub randomdatafile: String,

    /// Average throughput of the original replay (Mb/s), set after report.
    #[serde(skip)]
    pub original_throughput: f64,

    /// Average throughput of the random replay (Mb/s), set after report.
    #[serde(skip)]
    pub random_throughput: f64,

    /// Per-user monotonic test counter, assigned by the driver.
    #[serde(skip)]
    pub test_id: u32,
}

/// Two-sample Kolmogorov–Smirnov statistics returned by the server after
/// `AnalyzeTest`. Field names follow the server's JSON encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KS2Result {
    /// Signed area between the empirical throughput CDFs.
    #[serde(rename = "Area0var")]
    pub area0_var: f64,

    /// p-value of the KS-2 test.
    #[serde(rename = "KS2pVal")]
    pub ks2_p_val: f64,

    /// Average throughput of the original replay as seen by the server (Mb/s).
    #[serde(rename = "OriginalAvgThroughput")]
    pub original_avg_throughput: f64,

    /// Average throughput of the random replay as seen by the server (Mb/s).
    #[serde(rename = "RandomAvgThroughput")]
    pub random_avg_throughput: f64,
}

/// Loads the test catalog and selects the entries the user asked for.
///
/// `names` must already be trimmed and lowercased (the config layer does
/// this); they are matched case-insensitively against each entry's `image`
/// key. Unknown names fail the whole load; duplicate matches are ignored.
pub fn load_tests<P: AsRef<Path>>(catalog_path: P, names: &[String]) -> Result<Vec<Test>> {
    let data = std::fs::read_to_string(catalog_path.as_ref()).map_err(|e| {
        Error::Catalog(format!(
            "failed to read {}: {e}",
            catalog_path.as_ref().display()
        ))
    })?;

    let catalog: Vec<Test> =
        serde_json::from_str(&data).map_err(|e| Error::Catalog(format!("failed to parse: {e}")))?;

    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    let mut selected = Vec::new();
    let mut matched = HashSet::new();
    for test in catalog {
        if wanted.contains(test.image.to_lowercase().as_str()) {
            matched.insert(test.image.to_lowercase());
            debug!(name = %test.name, image = %test.image, "selected test");
            selected.push(test);
        }
    }

    let unknown: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| !matched.contains(*n))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Catalog(format!(
            "invalid test names: {}",
            unknown.join(", ")
        )));
    }

    Ok(selected)
}
