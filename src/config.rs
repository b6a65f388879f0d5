//! Client configuration read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `MSSQLSCRIPTER_POLL_INTERVAL_MS` | 50 |
//! | `MSSQLSCRIPTER_REQUEST_TIMEOUT_SECS` | unset (wait forever; `0` also disables) |
//! | `MSSQLSCRIPTER_SHUTDOWN_GRACE_MS` | 500 |

use std::time::Duration;

use thiserror::Error;
use tracing::info;

pub const POLL_INTERVAL_ENV: &str = "MSSQLSCRIPTER_POLL_INTERVAL_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "MSSQLSCRIPTER_REQUEST_TIMEOUT_SECS";
pub const SHUTDOWN_GRACE_ENV: &str = "MSSQLSCRIPTER_SHUTDOWN_GRACE_MS";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Timing knobs for [`SqlToolsClient`](crate::sqltools::SqlToolsClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Sleep between polls that found no message.
    pub poll_interval: Duration,
    /// Upper bound on draining one request. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// How long an engine child gets to exit after its input is closed.
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ClientConfig {
    /// Read the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to something other than a
    /// non-negative integer, or the poll interval is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = read_number(&lookup, POLL_INTERVAL_ENV)? {
            if ms == 0 {
                return Err(ConfigError::Zero(POLL_INTERVAL_ENV));
            }
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(secs) = read_number(&lookup, REQUEST_TIMEOUT_ENV)? {
            config.request_timeout = (secs > 0).then_some(Duration::from_secs(secs));
        }

        if let Some(ms) = read_number(&lookup, SHUTDOWN_GRACE_ENV)? {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        if config != Self::default() {
            info!("Using client configuration from environment: {:?}", config);
        }
        Ok(config)
    }
}

fn read_number<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match trimmed.parse() {
        Ok(value) => Ok(Some(value)),
        Err(_) => Err(ConfigError::InvalidNumber { name, value: raw }),
    }
}
