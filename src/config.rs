//! Environment-variable driven runtime configuration.
//!
//! Mirrors the reference crate's `Config::from_env` shape (required fields
//! fail fast, everything else has a documented default) but carries the
//! knobs the load-generation/redline core actually consumes instead of a
//! single fixed HTTP target.

use std::env;

use thiserror::Error;
use tokio::time::Duration;

use crate::utils::parse_duration_string;

/// How a worker reacts to a runner/transport failure outside of redline mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Abort,
    Continue,
}

impl OnError {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "abort" => Ok(OnError::Abort),
            "continue" => Ok(OnError::Continue),
            other => Err(ConfigError::InvalidValue {
                var: "WORKER_COORDINATOR_ON_ERROR".into(),
                message: format!("expected 'abort' or 'continue', got '{other}'"),
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

fn env_duration_or(name: &str, default_str: &str) -> Result<Duration, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default_str.to_string());
    parse_duration_string(&raw).map_err(|e| ConfigError::InvalidDuration {
        var: name.into(),
        message: e,
    })
}

/// `workload.redline.*` tunables, only meaningful when `redline_enabled`.
#[derive(Debug, Clone)]
pub struct RedlineConfig {
    pub enabled: bool,
    pub max_clients: usize,
    pub max_cpu_usage_pct: f64,
    pub scale_step: usize,
    pub scale_down_pct: f64,
    pub sleep_seconds: u64,
    pub cpu_window_seconds: u64,
    pub cpu_check_interval_seconds: u64,
}

/// Top-level runtime configuration for the coordinator/worker/feedback core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the YAML `TestProcedure` describing the workload to run.
    pub workload_path: String,
    pub on_error: OnError,
    pub profiling_enabled: bool,
    pub assertions_enabled: bool,
    pub sample_queue_size: usize,
    pub metrics_downsample_factor: usize,
    pub test_mode_enabled: bool,
    pub load_test_clients: usize,
    pub available_cores: usize,
    pub worker_count: usize,
    pub flush_interval: Duration,
    pub percentile_sampling_rate: u8,
    pub redline: RedlineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let workload_path = env::var("WORKLOAD_PATH").map_err(|_| ConfigError::MissingEnvVar("WORKLOAD_PATH".into()))?;

        let on_error = OnError::parse(&env::var("WORKER_COORDINATOR_ON_ERROR").unwrap_or_else(|_| "abort".to_string()))?;
        let profiling_enabled = env_bool("WORKER_COORDINATOR_PROFILING", false);
        let assertions_enabled = env_bool("WORKER_COORDINATOR_ASSERTIONS", false);
        let sample_queue_size: usize = env_parse_or("RESULTS_PUBLISHING_SAMPLE_QUEUE_SIZE", 16_384)?;
        let metrics_downsample_factor: usize = env_parse_or("RESULTS_PUBLISHING_METRICS_DOWNSAMPLE_FACTOR", 1)?;
        let test_mode_enabled = env_bool("WORKLOAD_TEST_MODE_ENABLED", false);
        let load_test_clients: usize = env_parse_or("WORKLOAD_LOAD_TEST_CLIENTS", 1)?;
        let available_cores: usize = env_parse_or("SYSTEM_AVAILABLE_CORES", num_cpus_fallback())?;
        let worker_count: usize = env_parse_or("WORKER_COUNT", available_cores.max(1))?;
        let flush_interval = env_duration_or("SAMPLE_FLUSH_INTERVAL", "1s")?;
        let percentile_sampling_rate: u8 = env_parse_or("PERCENTILE_SAMPLING_RATE", 100u8)?;

        let redline = RedlineConfig {
            enabled: env_bool("WORKLOAD_REDLINE_TEST", false),
            max_clients: env_parse_or("WORKLOAD_REDLINE_MAX_CLIENTS", 1_000)?,
            max_cpu_usage_pct: env_parse_or("WORKLOAD_REDLINE_MAX_CPU_USAGE", 90.0)?,
            scale_step: env_parse_or("WORKLOAD_REDLINE_SCALE_STEP", 5)?,
            scale_down_pct: env_parse_or("WORKLOAD_REDLINE_SCALE_DOWN_PCT", 0.10)?,
            sleep_seconds: env_parse_or("WORKLOAD_REDLINE_SLEEP_SECONDS", 30)?,
            cpu_window_seconds: env_parse_or("WORKLOAD_REDLINE_CPU_WINDOW_SECONDS", 10)?,
            cpu_check_interval_seconds: env_parse_or("WORKLOAD_REDLINE_CPU_CHECK_INTERVAL", 10)?,
        };

        let config = Config {
            workload_path,
            on_error,
            profiling_enabled,
            assertions_enabled,
            sample_queue_size,
            metrics_downsample_factor,
            test_mode_enabled,
            load_test_clients,
            available_cores,
            worker_count,
            flush_interval,
            percentile_sampling_rate,
            redline,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.load_test_clients == 0 {
            return Err(ConfigError::InvalidValue {
                var: "WORKLOAD_LOAD_TEST_CLIENTS".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                var: "WORKER_COUNT".into(),
                message: "must be greater than 0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.redline.scale_down_pct) {
            return Err(ConfigError::InvalidValue {
                var: "WORKLOAD_REDLINE_SCALE_DOWN_PCT".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            workload_path: "workload.yaml".into(),
            on_error: OnError::Abort,
            profiling_enabled: false,
            assertions_enabled: false,
            sample_queue_size: 1024,
            metrics_downsample_factor: 1,
            test_mode_enabled: true,
            load_test_clients: 4,
            available_cores: 4,
            worker_count: 1,
            flush_interval: Duration::from_secs(1),
            percentile_sampling_rate: 100,
            redline: RedlineConfig {
                enabled: false,
                max_clients: 100,
                max_cpu_usage_pct: 90.0,
                scale_step: 5,
                scale_down_pct: 0.10,
                sleep_seconds: 30,
                cpu_window_seconds: 10,
                cpu_check_interval_seconds: 10,
            },
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        let vars = [
            "WORKLOAD_PATH",
            "WORKER_COORDINATOR_ON_ERROR",
            "WORKER_COORDINATOR_PROFILING",
            "WORKER_COORDINATOR_ASSERTIONS",
            "RESULTS_PUBLISHING_SAMPLE_QUEUE_SIZE",
            "RESULTS_PUBLISHING_METRICS_DOWNSAMPLE_FACTOR",
            "WORKLOAD_TEST_MODE_ENABLED",
            "WORKLOAD_LOAD_TEST_CLIENTS",
            "SYSTEM_AVAILABLE_CORES",
            "WORKER_COUNT",
            "SAMPLE_FLUSH_INTERVAL",
            "PERCENTILE_SAMPLING_RATE",
            "WORKLOAD_REDLINE_TEST",
            "WORKLOAD_REDLINE_MAX_CLIENTS",
            "WORKLOAD_REDLINE_MAX_CPU_USAGE",
            "WORKLOAD_REDLINE_SCALE_STEP",
            "WORKLOAD_REDLINE_SCALE_DOWN_PCT",
            "WORKLOAD_REDLINE_SLEEP_SECONDS",
            "WORKLOAD_REDLINE_CPU_WINDOW_SECONDS",
            "WORKLOAD_REDLINE_CPU_CHECK_INTERVAL",
        ];
        for var in vars {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_with_minimal_config() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("WORKLOAD_PATH", "workload.yaml");

        let config = Config::from_env().unwrap();
        assert_eq!(config.workload_path, "workload.yaml");
        assert_eq!(config.on_error, OnError::Abort);
        assert!(!config.profiling_enabled);
        assert!(!config.redline.enabled);
        assert_eq!(config.metrics_downsample_factor, 1);

        clear_env_vars();
    }

    #[test]
    fn missing_workload_path_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "WORKLOAD_PATH"));
        clear_env_vars();
    }

    #[test]
    fn redline_config_parsed() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("WORKLOAD_PATH", "workload.yaml");
        env::set_var("WORKLOAD_REDLINE_TEST", "true");
        env::set_var("WORKLOAD_REDLINE_MAX_CLIENTS", "200");
        env::set_var("WORKLOAD_REDLINE_SCALE_DOWN_PCT", "0.25");

        let config = Config::from_env().unwrap();
        assert!(config.redline.enabled);
        assert_eq!(config.redline.max_clients, 200);
        assert!((config.redline.scale_down_pct - 0.25).abs() < 1e-9);

        clear_env_vars();
    }

    #[test]
    fn invalid_on_error_value_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("WORKLOAD_PATH", "workload.yaml");
        env::set_var("WORKER_COORDINATOR_ON_ERROR", "retry");

        let result = Config::from_env();
        assert!(result.is_err());
        clear_env_vars();
    }

    #[test]
    fn scale_down_pct_out_of_range_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("WORKLOAD_PATH", "workload.yaml");
        env::set_var("WORKLOAD_REDLINE_SCALE_DOWN_PCT", "1.5");

        let result = Config::from_env();
        assert!(result.is_err());
        clear_env_vars();
    }
}
