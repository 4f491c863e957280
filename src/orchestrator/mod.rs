//! Per-test orchestration: drives both replays of a test across every
//! server and turns the server's KS-2 statistics into a verdict.
//!
//! The state machine per test: load the first trace and connect the side
//! channels, announce (`ReceiveID`), obtain permission, run replay one in
//! parallel across servers, report its throughputs, declare and run replay
//! two, report again, then request the analysis and decide. Cleanup always
//! runs, whatever state failed.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{TcpReplayClient, UdpReplayClient};
use crate::server::{ReplayStats, Server};
use crate::testdata::{load_replay, KS2Result, ReplayInfo, Test};

/// Which rendition of the trace a replay sends. The wire `replayID` field
/// carries the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayType {
    Original = 0,
    Random = 1,
}

impl ReplayType {
    pub fn replay_id(self) -> u32 {
        self as u32
    }
}

/// Differentiation verdict for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoDifferentiation,
    ResultsInconclusive,
    DifferentiationDetected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoDifferentiation => "No Differentiation",
            Self::ResultsInconclusive => "Results Inconclusive",
            Self::DifferentiationDetected => "Differentiation Detected",
        })
    }
}

/// Per-server outcome of a completed test.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub server_hostname: String,
    pub status: Status,
    pub ks2_result: KS2Result,
    /// Effective area threshold the verdict used.
    pub area_threshold: f64,
    pub ks2_p_value_threshold: f64,
}

/// Drives one test — two replays — to completion.
pub struct TestOrchestrator<'a> {
    test: &'a mut Test,
    replay_types: [ReplayType; 2],
    /// Index of the replay currently running (0 or 1).
    replay_index: usize,
    tests_dir: PathBuf,
    servers: &'a mut [Server],
    is_last_replay: bool,
    samples_per_replay: u32,
    use_default_thresholds: bool,
    area_test_threshold: f64,
    ks2_p_val_threshold: f64,
    results: Vec<TestResult>,
}

impl<'a> TestOrchestrator<'a> {
    pub fn new(
        test: &'a mut Test,
        replay_types: [ReplayType; 2],
        cfg: &Config,
        servers: &'a mut [Server],
    ) -> Self {
        Self {
            test,
            replay_types,
            replay_index: 0,
            tests_dir: PathBuf::from(&cfg.tests_dir),
            servers,
            is_last_replay: false,
            samples_per_replay: 0,
            use_default_thresholds: cfg.use_default_thresholds,
            area_test_threshold: f64::from(cfg.area_threshold) / 100.0,
            ks2_p_val_threshold: f64::from(cfg.ks2pvalue_threshold) / 100.0,
            results: Vec::new(),
        }
    }

    /// Runs the whole test. Cleanup releases every server connection on
    /// all exit paths.
    pub async fn run(&mut self, user_id: &str, client_version: &str) -> Result<Vec<TestResult>> {
        let outcome = self.run_states(user_id, client_version).await;
        self.clean_up().await;
        outcome
    }

    async fn run_states(&mut self, user_id: &str, client_version: &str) -> Result<Vec<TestResult>> {
        let replay_info = Arc::new(self.current_replay_info()?);
        self.connect_side_channels().await?;

        self.send_id(&replay_info, user_id, client_version).await?;
        self.ask4_permission().await?;

        self.run_replays(&replay_info).await?;
        self.send_throughputs().await?;

        self.replay_index += 1;
        self.is_last_replay = true;
        let replay_info = Arc::new(self.current_replay_info()?);
        self.declare_replay(&replay_info).await?;

        self.run_replays(&replay_info).await?;
        self.send_throughputs().await?;

        self.analyze_test().await?;
        Ok(self.results.clone())
    }

    async fn connect_side_channels(&mut self) -> Result<()> {
        for (id, server) in self.servers.iter_mut().enumerate() {
            server.connect_side_channel(id).await?;
        }
        Ok(())
    }

    /// Announces the test and its first replay to every server.
    async fn send_id(
        &mut self,
        replay_info: &ReplayInfo,
        user_id: &str,
        client_version: &str,
    ) -> Result<()> {
        let replay_type = self.current_replay_type()?;
        let test_id = self.test.test_id;
        let is_last_replay = self.is_last_replay;
        for server in self.servers.iter_mut() {
            server
                .send_id(
                    replay_info.is_tcp,
                    replay_info.server_port,
                    user_id,
                    replay_type.replay_id(),
                    &replay_info.replay_name,
                    test_id,
                    is_last_replay,
                    client_version,
                )
                .await?;
        }
        // TODO: drop this sleep once the server acks ReceiveID; without it
        // Ask4Permission lands before the server has processed the announce
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn ask4_permission(&mut self) -> Result<()> {
        for server in self.servers.iter_mut() {
            let samples = server.ask4_permission().await?;
            debug!(hostname = %server.hostname, samples, "permission granted");
            self.samples_per_replay = samples;
        }
        Ok(())
    }

    /// Runs the current replay against every server in parallel and
    /// records each server's receive-side stats. One cancellation token
    /// spans the whole replay; any branch error fails the test.
    async fn run_replays(&mut self, replay_info: &Arc<ReplayInfo>) -> Result<()> {
        let token = CancellationToken::new();
        let replay_length = Duration::from_secs(self.test.time);
        let timing = !replay_info.is_port_test;

        let mut branches: Vec<JoinHandle<Result<ReplayStats>>> = Vec::new();
        for server in self.servers.iter() {
            let ip = server.ip;
            let replay = Arc::clone(replay_info);
            let token = token.clone();
            let samples = self.samples_per_replay;
            branches.push(tokio::spawn(async move {
                run_one_replay(ip, replay, timing, replay_length, samples, token).await
            }));
        }

        let mut first_error = None;
        let mut stats = Vec::with_capacity(branches.len());
        for branch in branches {
            match branch.await {
                Ok(Ok(replay_stats)) => stats.push(Some(replay_stats)),
                Ok(Err(err)) => {
                    token.cancel();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    stats.push(None);
                }
                Err(err) => {
                    token.cancel();
                    if first_error.is_none() {
                        first_error = Some(Error::ReplayIo(format!("replay task: {err}")));
                    }
                    stats.push(None);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        for (server, replay_stats) in self.servers.iter_mut().zip(stats) {
            server.last_replay = replay_stats;
        }
        Ok(())
    }

    /// Reports each server's sampled series; the last server's average is
    /// what survives on the test entity (per-server numbers stay in the
    /// results).
    async fn send_throughputs(&mut self) -> Result<()> {
        let replay_type = self.current_replay_type()?;
        for server in self.servers.iter_mut() {
            let average = server.send_throughputs().await?;
            debug!(hostname = %server.hostname, average, "average throughput");
            match replay_type {
                ReplayType::Original => self.test.original_throughput = average,
                ReplayType::Random => self.test.random_throughput = average,
            }
        }
        Ok(())
    }

    async fn declare_replay(&mut self, replay_info: &ReplayInfo) -> Result<()> {
        let replay_type = self.current_replay_type()?;
        let is_last_replay = self.is_last_replay;
        for server in self.servers.iter_mut() {
            let samples = server
                .declare_replay(
                    replay_type.replay_id(),
                    &replay_info.replay_name,
                    is_last_replay,
                )
                .await?;
            self.samples_per_replay = samples;
        }
        Ok(())
    }

    async fn analyze_test(&mut self) -> Result<()> {
        for server in self.servers.iter_mut() {
            let ks2_result = server.analyze_test().await?;
            let (status, area_threshold) = decide(
                self.use_default_thresholds,
                self.area_test_threshold,
                self.ks2_p_val_threshold,
                &ks2_result,
            );
            info!(hostname = %server.hostname, %status, "verdict");
            self.results.push(TestResult {
                server_hostname: server.hostname.clone(),
                status,
                ks2_result,
                area_threshold,
                ks2_p_value_threshold: self.ks2_p_val_threshold,
            });
        }
        Ok(())
    }

    async fn clean_up(&mut self) {
        for server in self.servers.iter_mut() {
            server.close().await;
        }
    }

    fn current_replay_type(&self) -> Result<ReplayType> {
        self.replay_types
            .get(self.replay_index)
            .copied()
            .ok_or_else(|| {
                Error::ReplayIo(format!(
                    "replay index {} out of bounds for a test with {} replays",
                    self.replay_index,
                    self.replay_types.len()
                ))
            })
    }

    fn current_replay_info(&self) -> Result<ReplayInfo> {
        let data_file = match self.current_replay_type()? {
            ReplayType::Original => &self.test.datafile,
            ReplayType::Random => &self.test.randomdatafile,
        };
        load_replay(self.tests_dir.join(data_file))
    }
}

/// Runs one replay against one server, sampling received throughput.
async fn run_one_replay(
    ip: std::net::IpAddr,
    replay: Arc<ReplayInfo>,
    timing: bool,
    replay_length: Duration,
    samples_per_replay: u32,
    token: CancellationToken,
) -> Result<ReplayStats> {
    let analyzer = Analyzer::new(replay_length, samples_per_replay)?;

    if replay.is_tcp {
        let client = TcpReplayClient::connect(ip, replay.server_port, timing).await?;
        client
            .run(replay, timing, Arc::clone(&analyzer), token)
            .await?;
    } else {
        let client = UdpReplayClient::connect(ip, replay.server_port, timing).await?;
        client
            .run(replay, timing, Arc::clone(&analyzer), token)
            .await?;
    }

    Ok(ReplayStats {
        duration: analyzer.elapsed(),
        throughputs: analyzer.throughputs(),
        sample_times: analyzer.sample_times(),
        average_throughput: analyzer.average_throughput(),
    })
}

/// High-bandwidth replays demand a larger absolute area gap so users are
/// not confused by proportionally small deltas.
const HIGH_BANDWIDTH_MBPS: f64 = 10.0;
const HIGH_BANDWIDTH_AREA_THRESHOLD: f64 = 0.3;

/// Turns a KS-2 result into a verdict. Returns the status and the
/// effective area threshold that was applied.
pub fn decide(
    use_default_thresholds: bool,
    area_threshold: f64,
    ks2_p_val_threshold: f64,
    ks2: &KS2Result,
) -> (Status, f64) {
    let mut effective_area_threshold = area_threshold;
    if use_default_thresholds
        && (ks2.original_avg_throughput > HIGH_BANDWIDTH_MBPS
            || ks2.random_avg_throughput > HIGH_BANDWIDTH_MBPS)
    {
        effective_area_threshold = HIGH_BANDWIDTH_AREA_THRESHOLD;
    }

    let above_area = ks2.area0_var.abs() >= effective_area_threshold;
    let below_p = ks2.ks2_p_val < ks2_p_val_threshold;

    let status = if !above_area {
        Status::NoDifferentiation
    } else if below_p {
        Status::DifferentiationDetected
    } else {
        Status::ResultsInconclusive
    };
    (status, effective_area_threshold)
}
