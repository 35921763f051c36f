//! Static server configuration.

use std::fmt::Display;

/// Everything the server needs to know before binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// TCP port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    /// Directory prepended to request targets to form filesystem paths.
    pub document_root: String,
    /// Number of worker threads in the pool.
    pub worker_count: usize,
    /// Bound on queued tasks; `None` leaves the queue unbounded.
    pub max_queue: Option<usize>,
}

/// Default size of the worker pool.
pub const DEFAULT_WORKERS: usize = 8;

impl Config {
    /// Builds a configuration from the command line:
    /// `<program> <port> [<www_dir>]`.
    ///
    /// The port must be an all-digit string; the document root defaults to
    /// the current directory.
    pub fn from_args<I>(mut args: I) -> Result<Config, ConfigError>
    where
        I: Iterator<Item = String>,
    {
        let port = args.next().ok_or(ConfigError::MissingPort)?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::BadPort);
        }
        let port: u16 = port.parse().map_err(|_| ConfigError::BadPort)?;
        let document_root = args.next().unwrap_or_else(|| ".".to_string());
        if args.next().is_some() {
            return Err(ConfigError::TooManyArguments);
        }
        Ok(Config {
            port,
            document_root,
            worker_count: DEFAULT_WORKERS,
            max_queue: None,
        })
    }
}

/// Rejected command line.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// No port argument was given.
    MissingPort,
    /// The port argument is not an all-digit string fitting a port.
    BadPort,
    /// Extra arguments after the document root.
    TooManyArguments,
}

impl ConfigError {
    fn description_str(&self) -> &'static str {
        match *self {
            ConfigError::MissingPort => "missing port argument",
            ConfigError::BadPort => "port must be a numeric string below 65536",
            ConfigError::TooManyArguments => "too many arguments",
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ConfigError {}
