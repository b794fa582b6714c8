use std::path::PathBuf;
use std::time::Duration;

use crate::metrics::server::DEFAULT_METRICS_PORT;
use crate::sampler::SampleKey;
use crate::writer::resolve::{InvalidServerName, ServerName};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<InvalidServerName> for ConfigError {
    fn from(value: InvalidServerName) -> Self {
        Self::Invalid(value.to_string())
    }
}

fn default_backlog_size() -> usize {
    1_000_000
}

fn default_sample_ratio() -> f64 {
    1.0
}

fn default_state_file() -> PathBuf {
    PathBuf::from("./logship_state.json")
}

fn default_checkpoint_interval() -> f64 {
    1.0
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_shutdown_drain_timeout() -> f64 {
    10.0
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct LogshipConfigFile {
    logstash_server: String,
    #[serde(default = "default_backlog_size")]
    backlog_size: usize,
    #[serde(default = "default_sample_ratio")]
    sample_ratio: f64,
    #[serde(default)]
    sample_key: Vec<SampleKeyEntry>,
    #[serde(default = "default_state_file")]
    state_file: PathBuf,
    #[serde(default = "default_checkpoint_interval")]
    checkpoint_interval: f64,
    #[serde(default)]
    enable_metrics: bool,
    #[serde(default = "default_metrics_port")]
    metrics_port: u16,
    #[serde(default = "default_shutdown_drain_timeout")]
    shutdown_drain_timeout: f64,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SampleKeyEntry {
    pattern: String,
    label: String,
}

/// Validated settings for the whole process.
#[derive(Debug)]
pub struct LogshipConfig {
    pub logstash_server: ServerName,
    pub backlog_size: usize,
    pub sample_ratio: f64,
    pub sample_keys: Vec<SampleKey>,
    pub state_file: PathBuf,
    /// `None` when periodic checkpoints are disabled.
    pub checkpoint_interval: Option<Duration>,
    pub enable_metrics: bool,
    pub metrics_port: u16,
    pub shutdown_drain_timeout: Duration,
}

fn seconds(key: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::Invalid(format!("{key} must be a non-negative number of seconds")))
}

impl LogshipConfig {
    pub fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        let file: LogshipConfigFile = toml::from_str(val)?;

        if file.logstash_server.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "logstash_server must not be empty".to_string(),
            ));
        }
        let logstash_server: ServerName = file.logstash_server.trim().parse()?;

        if file.backlog_size == 0 {
            return Err(ConfigError::Invalid(
                "backlog_size must be at least 1".to_string(),
            ));
        }
        if !(file.sample_ratio >= 1.0 && file.sample_ratio.is_finite()) {
            return Err(ConfigError::Invalid(
                "sample_ratio must be a number no less than 1".to_string(),
            ));
        }

        let sample_keys = file
            .sample_key
            .into_iter()
            .map(|entry| {
                SampleKey::new(&entry.pattern, entry.label).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "sample_key pattern {:?} is not a valid regex: {e}",
                        entry.pattern
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let checkpoint_interval = seconds("checkpoint_interval", file.checkpoint_interval)?;

        Ok(Self {
            logstash_server,
            backlog_size: file.backlog_size,
            sample_ratio: file.sample_ratio,
            sample_keys,
            state_file: file.state_file,
            checkpoint_interval: (!checkpoint_interval.is_zero()).then_some(checkpoint_interval),
            enable_metrics: file.enable_metrics,
            metrics_port: file.metrics_port,
            shutdown_drain_timeout: seconds("shutdown_drain_timeout", file.shutdown_drain_timeout)?,
        })
    }

    pub fn try_init() -> Result<Self, ConfigError> {
        use std::io::Read;
        let mut config = String::new();
        std::fs::File::open(&crate::cli::get_cli_args().config)?.read_to_string(&mut config)?;
        Self::try_init_from_string(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = LogshipConfig::try_init_from_string(r#"logstash_server = "logstash:5151""#)
            .unwrap();
        assert_eq!(
            config.logstash_server,
            ServerName::Host {
                host: "logstash".to_string(),
                port: 5151
            }
        );
        assert_eq!(config.backlog_size, 1_000_000);
        assert_eq!(config.sample_ratio, 1.0);
        assert!(config.sample_keys.is_empty());
        assert_eq!(config.state_file, PathBuf::from("./logship_state.json"));
        assert_eq!(config.checkpoint_interval, Some(Duration::from_secs(1)));
        assert!(!config.enable_metrics);
        assert_eq!(config.metrics_port, 9367);
        assert_eq!(config.shutdown_drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_full_config() {
        let config = LogshipConfig::try_init_from_string(
            r#"
            logstash_server = "_logstash._tcp.example.com"
            backlog_size = 42
            sample_ratio = 12.5
            state_file = "/var/lib/logship/state.json"
            checkpoint_interval = 0
            enable_metrics = true
            metrics_port = 9999
            shutdown_drain_timeout = 2.5

            [[sample_key]]
            pattern = 'rc:(\d{3})'
            label = 'http_\1'

            [[sample_key]]
            pattern = '^DEBUG'
            label = 'debug'
            "#,
        )
        .unwrap();
        assert_eq!(
            config.logstash_server,
            ServerName::Srv("_logstash._tcp.example.com".to_string())
        );
        assert_eq!(config.backlog_size, 42);
        assert_eq!(config.sample_ratio, 12.5);
        assert_eq!(config.sample_keys.len(), 2);
        assert_eq!(config.sample_keys[0].pattern(), r"rc:(\d{3})");
        assert_eq!(config.sample_keys[0].label(), r"http_\1");
        assert_eq!(config.checkpoint_interval, None);
        assert!(config.enable_metrics);
        assert_eq!(config.metrics_port, 9999);
        assert_eq!(config.shutdown_drain_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_values() {
        let invalid = |toml: &str| {
            matches!(
                LogshipConfig::try_init_from_string(toml),
                Err(ConfigError::Invalid(_))
            )
        };
        assert!(invalid(r#"logstash_server = """#));
        assert!(invalid(r#"logstash_server = "host:notaport""#));
        assert!(invalid("logstash_server = \"a:1\"\nbacklog_size = 0"));
        assert!(invalid("logstash_server = \"a:1\"\nsample_ratio = 0.5"));
        assert!(invalid("logstash_server = \"a:1\"\ncheckpoint_interval = -1"));
        assert!(invalid(
            "logstash_server = \"a:1\"\n[[sample_key]]\npattern = \"(\"\nlabel = \"x\""
        ));
    }

    #[test]
    fn test_toml_errors() {
        assert!(matches!(
            LogshipConfig::try_init_from_string("backlog_size = 1"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            LogshipConfig::try_init_from_string("logstash_server = \"a:1\"\nbogus = 1"),
            Err(ConfigError::Toml(_))
        ));
    }
}
