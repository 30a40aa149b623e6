//! Engine configuration loaded from environment variables.

use std::str::FromStr;

/// What happens to an instance that reaches a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizePolicy {
    /// Delete the instance from the repository.
    #[default]
    Remove,
    /// Keep the instance, stored in its final state.
    Archive,
}

impl FromStr for FinalizePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remove" => Ok(FinalizePolicy::Remove),
            "archive" => Ok(FinalizePolicy::Archive),
            other => Err(format!("unknown finalize policy '{other}'")),
        }
    }
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Engine settings with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_MAX_RETRIES`: attempts after a concurrency conflict (default: `5`)
/// - `SAGA_FINALIZE_POLICY`: `remove` or `archive` (default: `remove`)
/// - `SAGA_LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency_retries: u32,
    pub finalize_policy: FinalizePolicy,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrency_retries: parse_var(
                "SAGA_MAX_RETRIES",
                defaults.max_concurrency_retries,
            ),
            finalize_policy: parse_var("SAGA_FINALIZE_POLICY", defaults.finalize_policy),
            log_format: parse_var("SAGA_LOG_FORMAT", defaults.log_format),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    pub fn with_finalize_policy(mut self, policy: FinalizePolicy) -> Self {
        self.finalize_policy = policy;
        self
    }

    pub fn with_max_concurrency_retries(mut self, retries: u32) -> Self {
        self.max_concurrency_retries = retries;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency_retries: 5,
            finalize_policy: FinalizePolicy::Remove,
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            tracing::warn!(var = name, value = %raw, error = %e, "ignoring invalid setting");
            default
        }),
        Err(_) => default,
    }
}
