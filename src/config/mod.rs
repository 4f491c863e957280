//! Configuration for the Wehe client.
//!
//! Settings come from two places: the test names on the command line and a
//! `.ini` file (default section only). Every key is required and
//! range-checked; a missing or out-of-range value fails startup.

use std::path::Path;

use ini::{Ini, Properties};

use crate::error::{Error, Result};

/// Validated configuration record the rest of the client consumes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Requested test names from the command line, trimmed and lowercased.
    pub test_names: Vec<String>,

    // keys from the .ini file
    pub server_display: String,
    /// MLab hands out at most 4 servers to choose from.
    pub num_servers: usize,
    pub extra_string: String,
    pub send_mobile_stats: bool,
    pub result: bool,
    pub confirmation_replays: bool,
    pub use_default_thresholds: bool,
    /// Area threshold in percent (0..=100).
    pub area_threshold: u32,
    /// KS-2 p-value threshold in percent (0..=100).
    pub ks2pvalue_threshold: u32,
    pub log_level: LogLevel,
    pub user_config_file: String,
    pub tests_config_file: String,
    pub server_cert_file: String,
    pub tests_dir: String,
    pub results_ui_dir: String,
    pub results_log_dir: String,
    pub info_file: String,
}

/// Log verbosity, ordered from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Ui = 0,
    Wtf = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
}

impl LogLevel {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "ui" => Ok(Self::Ui),
            "wtf" => Ok(Self::Wtf),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(Error::Config(format!(
                "{other} is not a log level; choose from ui, wtf, error, warn, info, or debug"
            ))),
        }
    }

    /// Maps onto a tracing filter directive. The two app-specific levels
    /// below `error` have no tracing counterpart and collapse into it.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Ui | Self::Wtf | Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl Config {
    /// Builds a configuration from the raw `-n` argument and the `.ini`
    /// file at `config_path`.
    pub fn load<P: AsRef<Path>>(test_names: &str, config_path: P) -> Result<Self> {
        let names: Vec<String> = test_names
            .split(',')
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return Err(Error::Config("no test names entered".into()));
        }

        let ini = Ini::load_from_file(config_path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "unable to process {}: {e}",
                config_path.as_ref().display()
            ))
        })?;
        let section = ini
            .section(None::<String>)
            .ok_or_else(|| Error::Config("config file has no default section".into()))?;

        Ok(Self {
            test_names: names,
            server_display: get_string(section, "server_display")?,
            num_servers: get_int(section, "num_servers", 1, 4)? as usize,
            extra_string: get_string(section, "extra_string")?,
            send_mobile_stats: get_bool(section, "send_mobile_stats")?,
            result: get_bool(section, "result")?,
            confirmation_replays: get_bool(section, "confirmation_replays")?,
            use_default_thresholds: get_bool(section, "use_default_thresholds")?,
            area_threshold: get_int(section, "area_threshold", 0, 100)? as u32,
            ks2pvalue_threshold: get_int(section, "ks2pvalue_threshold", 0, 100)? as u32,
            log_level: LogLevel::parse(&get_string(section, "log_level")?)?,
            user_config_file: get_string(section, "user_config_file")?,
            tests_config_file: get_string(section, "tests_config_file")?,
            server_cert_file: get_string(section, "server_cert_file")?,
            tests_dir: get_string(section, "tests_dir")?,
            results_ui_dir: get_string(section, "results_ui_dir")?,
            results_log_dir: get_string(section, "results_log_dir")?,
            info_file: get_string(section, "info_file")?,
        })
    }
}

fn get_string(section: &Properties, key: &str) -> Result<String> {
    let value = section
        .get(key)
        .ok_or_else(|| Error::Config(format!("missing {key} key")))?;
    if value.is_empty() {
        return Err(Error::Config(format!("no value read from {key} key")));
    }
    Ok(value.to_string())
}

fn get_int(section: &Properties, key: &str, low: i64, high: i64) -> Result<i64> {
    let raw = get_string(section, key)?;
    let value: i64 = raw
        .parse()
        .map_err(|e| Error::Config(format!("{e} in {key} key")))?;
    if value < low || value > high {
        return Err(Error::Config(format!(
            "{value} is not a valid number for {key}; must be between {low} and {high} inclusive"
        )));
    }
    Ok(value)
}

fn get_bool(section: &Properties, key: &str) -> Result<bool> {
    let raw = get_string(section, key)?;
    match raw.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(Error::Config(format!("{other:?} is not a boolean in {key} key"))),
    }
}

/// Initializes tracing with the configured level; `RUST_LOG` overrides it.
pub fn init_logging(level: LogLevel) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;

    Ok(())
}
