#![forbid(unsafe_code)]
//! Configuration shared by the haystack crates: node location, scan tuning, cache and log paths.
use std::{
    path::{Path, PathBuf},
    sync::Once,
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

pub const DEFAULT_NODE_SERVER: &str = "http://127.0.0.1:18081";
pub const DEFAULT_NODE_PORT: u16 = 18081;
pub const DEFAULT_CACHE_DIR_NAME: &str = "xmr-haystack";
pub const DEFAULT_CACHE_NAME: &str = "xmrhaystack.json";
pub const DEFAULT_LOGFILE_NAME: &str = "haystack.debug.log";

/// Number of block summaries retained for reorg detection.
pub const MAX_WINDOW: usize = 50;
pub const RESTRICTED_BATCH_SIZE: usize = 100;
pub const UNRESTRICTED_BATCH_SIZE: usize = 10_000;
pub const MIN_RESUME_OFFSET: u64 = 25;
pub const MAX_RESUME_OFFSET: u64 = 250;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Size at which the logfile is rolled over.
pub const LOG_ROLL_SIZE: u64 = 5 * 1024 * 1024;
/// Rolled logfiles kept next to the live one, `<logfile>.0` being the newest.
pub const LOG_ROLL_WINDOW: u32 = 3;

static LOG_INIT: Once = Once::new();

/// Problems with the supplied options, surfaced before any scanning starts.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid node uri `{0}`")]
    InvalidUri(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("resume offset range is empty: min {min} > max {max}")]
    InvertedOffsets { min: u64, max: u64 },
    #[error("scan height {requested} is above the chain tip {chain_height}")]
    HeightAboveChainTip { requested: u64, chain_height: u64 },
    #[error("cache passphrase must not be empty")]
    EmptyPassphrase,
    #[error("logfile setup failed. {0}")]
    Logging(String),
}

/// Parses a user supplied node address, filling in scheme and port when missing.
pub fn construct_node_uri(server: Option<String>) -> Result<http::Uri, ConfigError> {
    let server = match server {
        Some(s) => {
            let mut s = if s.starts_with("http") {
                s
            } else {
                "http://".to_string() + &s
            };
            let uri: http::Uri = s
                .parse()
                .map_err(|_| ConfigError::InvalidUri(s.clone()))?;
            if uri.port().is_none() {
                s += &format!(":{DEFAULT_NODE_PORT}");
            }
            s
        }
        None => DEFAULT_NODE_SERVER.to_string(),
    };

    server
        .parse()
        .map_err(|_| ConfigError::InvalidUri(server.clone()))
}

/// Tuning of the scan engine and resume planner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    /// Upper bound on the number of block summaries kept in the chain window.
    pub max_window: usize,
    /// Transactions per lookup when the node restricts RPC.
    pub restricted_batch_size: usize,
    pub unrestricted_batch_size: usize,
    /// Smallest random step back from a resume anchor.
    pub min_resume_offset: u64,
    /// Largest random step back from a resume anchor.
    pub max_resume_offset: u64,
    /// Minimum wall-clock gap between two progress events.
    pub progress_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_window: MAX_WINDOW,
            restricted_batch_size: RESTRICTED_BATCH_SIZE,
            unrestricted_batch_size: UNRESTRICTED_BATCH_SIZE,
            min_resume_offset: MIN_RESUME_OFFSET,
            max_resume_offset: MAX_RESUME_OFFSET,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ScanConfig {
    /// Batch size for the node's RPC mode.
    pub fn batch_size(&self, restricted: bool) -> usize {
        if restricted {
            self.restricted_batch_size
        } else {
            self.unrestricted_batch_size
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_window == 0 {
            return Err(ConfigError::Zero("max_window"));
        }
        if self.restricted_batch_size == 0 {
            return Err(ConfigError::Zero("restricted_batch_size"));
        }
        if self.unrestricted_batch_size == 0 {
            return Err(ConfigError::Zero("unrestricted_batch_size"));
        }
        if self.min_resume_offset > self.max_resume_offset {
            return Err(ConfigError::InvertedOffsets {
                min: self.min_resume_offset,
                max: self.max_resume_offset,
            });
        }

        Ok(())
    }
}

/// Configuration data sufficient to run a scan session from an outer layer such as a CLI.
#[derive(Clone, Debug)]
pub struct HaystackConfig {
    pub node_uri: http::Uri,
    pub scan: ScanConfig,
    /// Cache container location. When `None`, [`HaystackConfig::get_cache_path`] falls back to the
    /// per-user cache directory.
    pub cache_path: Option<PathBuf>,
    /// The directory where logfiles will be created. Defaults to the cache directory.
    pub log_dir: Option<PathBuf>,
    /// The filename of the logfile. This will be created in the `log_dir`.
    pub logfile_name: PathBuf,
    /// Records below this level are not written to the logfile.
    pub log_level: LevelFilter,
}

impl Default for HaystackConfig {
    fn default() -> Self {
        Self {
            node_uri: http::Uri::from_static(DEFAULT_NODE_SERVER),
            scan: ScanConfig::default(),
            cache_path: None,
            log_dir: None,
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            log_level: LevelFilter::Info,
        }
    }
}

impl HaystackConfig {
    pub fn new(server: Option<String>, cache_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = Self {
            node_uri: construct_node_uri(server)?,
            cache_path,
            ..Self::default()
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()
    }

    pub fn get_cache_path(&self) -> Option<PathBuf> {
        self.cache_path.clone().or_else(default_cache_path)
    }

    pub fn get_log_path(&self) -> Box<Path> {
        let mut log_path = self
            .log_dir
            .clone()
            .or_else(default_cache_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        log_path.push(&self.logfile_name);

        log_path.into_boxed_path()
    }

    /// Rolling logfile config. Creates the log directory and opens the logfile.
    ///
    /// Rolled files are written next to the logfile as `<logfile>.0` up to
    /// `<logfile>.{LOG_ROLL_WINDOW - 1}`.
    pub fn get_log_config(&self) -> Result<Config, ConfigError> {
        let log_path = self.get_log_path();
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir).map_err(logging_error)?;
        }

        let roll_pattern = format!("{}.{{}}", log_path.display());
        let fixed_window_roller = FixedWindowRoller::builder()
            .build(&roll_pattern, LOG_ROLL_WINDOW)
            .map_err(logging_error)?;
        let compound_policy = CompoundPolicy::new(
            Box::new(SizeTrigger::new(LOG_ROLL_SIZE)),
            Box::new(fixed_window_roller),
        );
        let logfile = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d} {l} {t}::{m}{n}")))
            .build(&log_path, Box::new(compound_policy))
            .map_err(logging_error)?;

        Config::builder()
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(self.log_level)))
                    .build("logfile", Box::new(logfile)),
            )
            .build(
                Root::builder()
                    .appender("logfile")
                    .build(LevelFilter::Debug),
            )
            .map_err(logging_error)
    }

    /// Routes log records to the rolling logfile. `tracing` events reach it through the `log`
    /// bridge as long as no `tracing` subscriber is installed. Fails if a logger is already set.
    pub fn init_file_logging(&self) -> Result<(), ConfigError> {
        let config = self.get_log_config()?;
        log4rs::init_config(config).map_err(logging_error)?;

        Ok(())
    }
}

fn logging_error(e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Logging(e.to_string())
}

/// Installs a stdout `tracing` subscriber. Later calls are no-ops.
pub fn init_logging() {
    LOG_INIT.call_once(tracing_subscriber::fmt::init);
}

pub fn default_cache_dir() -> Option<PathBuf> {
    let mut dir = dirs::cache_dir()?;
    dir.push(DEFAULT_CACHE_DIR_NAME);

    Some(dir)
}

/// `<user cache dir>/xmr-haystack/xmrhaystack.json`, or `None` when the platform has no cache
/// directory.
pub fn default_cache_path() -> Option<PathBuf> {
    let mut path = default_cache_dir()?;
    if let Err(e) = std::fs::create_dir_all(&path) {
        tracing::warn!("could not prepare cache directory {}: {e}", path.display());
    }
    path.push(DEFAULT_CACHE_NAME);

    Some(path)
}
