//! Process-level settings, sourced from the environment.
//!
//! The resolution chain is environment variable > built-in default. The
//! runner renders the active settings back into environment variables when
//! spawning flow-run child processes so they observe the same configuration.

use anyhow::{Context, Result, bail};

pub const ENV_API_URL: &str = "WEIR_API_URL";
pub const ENV_WORKER_PREFETCH_SECONDS: &str = "WEIR_WORKER_PREFETCH_SECONDS";
pub const ENV_WORKER_QUERY_SECONDS: &str = "WEIR_WORKER_QUERY_SECONDS";
pub const ENV_WORKER_HEARTBEAT_SECONDS: &str = "WEIR_WORKER_HEARTBEAT_SECONDS";
pub const ENV_TASKS_REFRESH_CACHE: &str = "WEIR_TASKS_REFRESH_CACHE";
pub const ENV_DEBUG_MODE: &str = "WEIR_DEBUG_MODE";

/// Settings consumed by the execution core.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Orchestration API endpoint. `None` (or empty) means the in-process
    /// ephemeral backend: no remote scheduling is available.
    pub api_url: Option<String>,
    /// How far ahead of their scheduled start the runner claims flow runs.
    pub worker_prefetch_seconds: f64,
    /// Interval of the submit loop; the cancellation loop runs at twice it.
    pub worker_query_seconds: f64,
    /// Interval of the heartbeat loop.
    pub worker_heartbeat_seconds: f64,
    /// Global default for ignoring cached task results. A task-level
    /// `refresh_cache` setting overrides it.
    pub tasks_refresh_cache: bool,
    /// Verbose state rendering in engine logs.
    pub debug_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: None,
            worker_prefetch_seconds: 10.0,
            worker_query_seconds: 10.0,
            worker_heartbeat_seconds: 30.0,
            tasks_refresh_cache: false,
            debug_mode: false,
        }
    }
}

impl Settings {
    /// Load settings from the environment, validating each value.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            api_url: read_env(ENV_API_URL).filter(|url| !url.is_empty()),
            worker_prefetch_seconds: parse_seconds(
                ENV_WORKER_PREFETCH_SECONDS,
                defaults.worker_prefetch_seconds,
            )?,
            worker_query_seconds: parse_seconds(
                ENV_WORKER_QUERY_SECONDS,
                defaults.worker_query_seconds,
            )?,
            worker_heartbeat_seconds: parse_seconds(
                ENV_WORKER_HEARTBEAT_SECONDS,
                defaults.worker_heartbeat_seconds,
            )?,
            tasks_refresh_cache: parse_bool(ENV_TASKS_REFRESH_CACHE, defaults.tasks_refresh_cache)?,
            debug_mode: parse_bool(ENV_DEBUG_MODE, defaults.debug_mode)?,
        })
    }

    /// Render the settings as environment variables for child processes.
    pub fn to_environment_variables(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(api_url) = &self.api_url {
            vars.push((ENV_API_URL.to_owned(), api_url.clone()));
        }
        vars.push((
            ENV_WORKER_PREFETCH_SECONDS.to_owned(),
            self.worker_prefetch_seconds.to_string(),
        ));
        vars.push((
            ENV_WORKER_QUERY_SECONDS.to_owned(),
            self.worker_query_seconds.to_string(),
        ));
        vars.push((
            ENV_WORKER_HEARTBEAT_SECONDS.to_owned(),
            self.worker_heartbeat_seconds.to_string(),
        ));
        vars.push((
            ENV_TASKS_REFRESH_CACHE.to_owned(),
            self.tasks_refresh_cache.to_string(),
        ));
        vars.push((ENV_DEBUG_MODE.to_owned(), self.debug_mode.to_string()));
        vars
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_seconds(name: &str, default: f64) -> Result<f64> {
    let Some(raw) = read_env(name) else {
        return Ok(default);
    };
    let value: f64 = raw
        .parse()
        .with_context(|| format!("{name} must be a number of seconds, got {raw:?}"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("{name} must be a non-negative number of seconds, got {raw:?}");
    }
    Ok(value)
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    let Some(raw) = read_env(name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{name} must be a boolean, got {raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.api_url, None);
        assert_eq!(settings.worker_prefetch_seconds, 10.0);
        assert_eq!(settings.worker_query_seconds, 10.0);
        assert_eq!(settings.worker_heartbeat_seconds, 30.0);
        assert!(!settings.tasks_refresh_cache);
        assert!(!settings.debug_mode);
    }

    #[test]
    fn environment_variables_round_trip() {
        let settings = Settings {
            api_url: Some("http://localhost:4200".to_owned()),
            worker_prefetch_seconds: 15.0,
            ..Default::default()
        };
        let vars = settings.to_environment_variables();
        assert!(
            vars.contains(&(
                ENV_API_URL.to_owned(),
                "http://localhost:4200".to_owned()
            ))
        );
        assert!(vars.contains(&(ENV_WORKER_PREFETCH_SECONDS.to_owned(), "15".to_owned())));
    }

    #[test]
    fn ephemeral_settings_omit_api_url() {
        let vars = Settings::default().to_environment_variables();
        assert!(vars.iter().all(|(name, _)| name != ENV_API_URL));
    }
}
