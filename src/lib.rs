//! # Wehe
//!
//! Network-neutrality measurement client. For each named app (YouTube,
//! Netflix, …) the client replays a previously recorded packet trace of that
//! app's traffic against a measurement server, then replays a
//! byte-randomized rendition of the same trace. The server compares the
//! throughput distributions of the two replays with a two-sample
//! Kolmogorov–Smirnov test; if they differ beyond configured thresholds, the
//! network is differentiating that app's traffic.
//!
//! ## Architecture
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Driver (app)                            │
//! │     user/test IDs · replay-order coin flip · fan-out         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                  Test orchestrator                           │
//! │     per-test state machine · differentiation verdict         │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Server bootstrap          │   Side channel (:55556)        │
//! │   MLab locator · WebSocket  │   opcoded request/response     │
//! ├──────────────────────────────────────────────────────────────┤
//! │   TCP / UDP replay clients  ↔  Throughput analyzer           │
//! │   paced send · deadline-bounded receive · Mb/s sampling      │
//! └──────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)] // Acceptable for throughput math
#![allow(clippy::cast_possible_truncation)] // Durations fit the sample arithmetic
#![allow(clippy::future_not_send)] // Async internals

pub mod analyzer;
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod server;
pub mod testdata;

pub use config::Config;
pub use error::{Error, Result};

/// Client version reported to the server in `ReceiveID`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
