//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Poll interval used by collectors and the live drain loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval used by deadline enforcers.
pub const DEFAULT_ENFORCER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Execution coordination policy.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Global execution timeout. `Duration::ZERO` disables deadline enforcement.
    pub exec_timeout: Duration,
    /// Restart the worker after interrupting a timed-out submission.
    pub restart_on_timeout: bool,
    /// Default wait timeout for `submit_and_collect` callers that don't pick one.
    pub collect_timeout: Duration,
    /// Bounded wait per stream poll (collectors and live drain).
    pub poll_interval: Duration,
    /// Sleep between deadline checks.
    pub enforcer_poll_interval: Duration,
    /// Capacity of the live subscriber broadcast channel.
    pub subscriber_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::ZERO,
            restart_on_timeout: false,
            collect_timeout: Duration::from_secs(5),
            poll_interval: DEFAULT_POLL_INTERVAL,
            enforcer_poll_interval: DEFAULT_ENFORCER_POLL_INTERVAL,
            subscriber_capacity: 256,
        }
    }
}

impl ExecConfig {
    /// Read the execution policy from `FLOW_EXEC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let exec_timeout = parse_env::<u64>("FLOW_EXEC_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.exec_timeout);

        let collect_timeout = parse_env::<u64>("FLOW_EXEC_COLLECT_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.collect_timeout);

        Ok(Self {
            exec_timeout,
            restart_on_timeout: env_flag("FLOW_EXEC_RESTART_ON_TIMEOUT"),
            collect_timeout,
            ..defaults
        })
    }

    /// Whether a positive global execution timeout is configured.
    pub fn timeout_enabled(&self) -> bool {
        !self.exec_timeout.is_zero()
    }
}

/// Process-level settings: HTTP surface and the bundled shell worker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Shared API token. Auth is disabled when `None`.
    pub api_token: Option<SecretString>,
    /// When false the worker is never started and every request sees "not ready".
    pub worker_enabled: bool,
    /// Shell binary used by the shell worker.
    pub shell: String,
    /// Working directory for submitted snippets (process cwd when `None`).
    pub working_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            api_token: None,
            worker_enabled: true,
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_token = std::env::var("FLOW_EXEC_API_TOKEN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        Ok(Self {
            port: parse_env("FLOW_EXEC_PORT")?.unwrap_or(defaults.port),
            api_token,
            worker_enabled: !env_flag("FLOW_EXEC_DISABLE_WORKER"),
            shell: std::env::var("FLOW_EXEC_SHELL").unwrap_or(defaults.shell),
            working_dir: std::env::var("FLOW_EXEC_WORKDIR").ok().map(PathBuf::from),
        })
    }
}

/// `1`, `true`, `yes` and `on` (any case, surrounding whitespace ignored).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| is_truthy(&v)).unwrap_or(false)
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}
