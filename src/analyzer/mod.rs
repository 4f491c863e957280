//! Receive-side throughput sampling.
//!
//! During a replay the receive loop feeds every read's byte count into an
//! [`Analyzer`]; a periodic tick task snapshots and zeroes the running
//! counter, producing a uniform time series of per-interval throughputs
//! that is later reported to the server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Error, Result};

/// Bytes per megabit.
const BYTES_PER_MEGABIT: f64 = 125_000.0;

/// Periodic sampler converting received byte counts into per-interval Mb/s.
///
/// The byte counter is the only datum shared between the receive task (via
/// [`Analyzer::add_bytes_read`]) and the tick task, so it is an atomic; the
/// sample store is touched by the tick task and by `stop` and sits behind a
/// mutex.
pub struct Analyzer {
    bytes_read: AtomicU64,
    sample_interval: Duration,
    state: Mutex<SampleState>,
}

#[derive(Default)]
struct SampleState {
    started_at: Option<Instant>,
    tick_task: Option<JoinHandle<()>>,
    samples: Vec<u64>,
    sample_times: Vec<f64>,
    throughputs: Vec<f64>,
    elapsed: Duration,
    stopped: bool,
}

impl Analyzer {
    /// Creates an analyzer sampling `number_of_samples` times over
    /// `replay_length`.
    ///
    /// The interval is the floor division of the two; a replay short enough
    /// to floor it to zero cannot be sampled and is rejected.
    pub fn new(replay_length: Duration, number_of_samples: u32) -> Result<Arc<Self>> {
        if number_of_samples == 0 {
            return Err(Error::Config("number of samples must be positive".into()));
        }
        let sample_interval = replay_length / number_of_samples;
        if sample_interval.is_zero() {
            return Err(Error::Config(format!(
                "sample interval of {replay_length:?} / {number_of_samples} samples rounds to zero"
            )));
        }
        Ok(Arc::new(Self {
            bytes_read: AtomicU64::new(0),
            sample_interval,
            state: Mutex::new(SampleState::default()),
        }))
    }

    /// Starts the periodic tick task. Each tick snapshots and zeroes the
    /// byte counter and records one sample.
    pub fn run(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.started_at = Some(Instant::now());

        let this = Arc::clone(self);
        state.tick_task = Some(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval_at(Instant::now() + this.sample_interval, this.sample_interval);
            loop {
                tick.tick().await;
                this.take_sample();
            }
        }));
    }

    fn take_sample(&self) {
        let bytes = self.bytes_read.swap(0, Ordering::AcqRel);
        let mut state = self.state.lock();
        // the sample's wall offset is its tick index times the interval
        let offset = (state.samples.len() as f64 + 1.0) * self.sample_interval.as_secs_f64();
        state.sample_times.push(offset);
        state.samples.push(bytes);
        trace!(offset, bytes, "throughput sample");
    }

    /// Credits bytes received by the replay client. Called from the receive
    /// task while the tick task reads and resets the counter.
    pub fn add_bytes_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    /// Halts sampling, records the elapsed replay time, and converts the
    /// byte samples to Mb/s. The final sample is discarded: the last tick
    /// may coincide with shutdown and cover a truncated interval, producing
    /// an outlier. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;

        if let Some(task) = state.tick_task.take() {
            task.abort();
        }
        state.elapsed = state.started_at.map_or(Duration::ZERO, |t| t.elapsed());

        let interval_secs = self.sample_interval.as_secs_f64();
        state.throughputs = state
            .samples
            .iter()
            .map(|&bytes| bytes as f64 / BYTES_PER_MEGABIT / interval_secs)
            .collect();

        state.samples.pop();
        state.sample_times.pop();
        state.throughputs.pop();
    }

    /// Arithmetic mean of the throughput series, or 0 if no samples survived.
    pub fn average_throughput(&self) -> f64 {
        let state = self.state.lock();
        if state.throughputs.is_empty() {
            return 0.0;
        }
        state.throughputs.iter().sum::<f64>() / state.throughputs.len() as f64
    }

    /// Per-interval throughputs in Mb/s (valid after `stop`).
    pub fn throughputs(&self) -> Vec<f64> {
        self.state.lock().throughputs.clone()
    }

    /// Wall offsets of the samples in seconds (valid after `stop`).
    pub fn sample_times(&self) -> Vec<f64> {
        self.state.lock().sample_times.clone()
    }

    /// How long the replay actually ran (valid after `stop`).
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().tick_task.take() {
            task.abort();
        }
    }
}
