//! Configuration management for the log shipping pipeline

use crate::event::LogLevel;
use crate::filter::parse_overrides;
use crate::index::{DEFAULT_INDEX_TEMPLATE, IndexTemplate};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSettings {
    /// Base URL of the indexing backend, e.g. `http://localhost:9200`
    pub endpoint: String,

    /// Index name template, see [`IndexTemplate`]
    pub index_template: String,

    /// Timeout for a single bulk request
    pub http_timeout: Duration,

    /// Encoded documents above this size are dropped
    pub max_event_bytes: usize,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200".to_string(),
            index_template: DEFAULT_INDEX_TEMPLATE.to_string(),
            http_timeout: Duration::from_secs(10),
            max_event_bytes: 256 * 1024,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SinkKind {
    Console,
    Debug,
    Remote(RemoteSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub retry: RetryPolicy,
}

impl SinkConfig {
    pub fn new(kind: SinkKind) -> Self {
        Self {
            kind,
            retry: RetryPolicy::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            SinkKind::Console => "console",
            SinkKind::Debug => "debug",
            SinkKind::Remote(_) => "remote",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Application name, used for the `Application` property and index names
    pub application: String,

    /// Environment used when the environment variable is not set
    pub environment: String,

    /// Variable read by the environment enricher on every event
    pub environment_variable: String,

    /// Events below this level never enter the pipeline
    pub minimum_level: LogLevel,

    /// Per-namespace minimum levels
    pub level_overrides: Vec<(String, LogLevel)>,

    /// Events per batch
    pub batch_size: usize,

    /// Longest time an open batch waits for more events
    pub batch_max_age: Duration,

    /// Events that can wait for the batcher before `emit` starts rejecting
    pub channel_capacity: usize,

    /// Batches each sink can hold while it is busy or its circuit is open
    pub queue_capacity: usize,

    /// Upper bound for delivering what is left at shutdown
    pub shutdown_grace: Duration,

    pub sinks: Vec<SinkConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: "app".to_string(),
            environment: "Production".to_string(),
            environment_variable: "APP_ENVIRONMENT".to_string(),
            minimum_level: LogLevel::Information,
            level_overrides: Vec::new(),
            batch_size: 50,
            batch_max_age: Duration::from_secs(2),
            channel_capacity: 10_000,
            queue_capacity: 100,
            shutdown_grace: Duration::from_secs(5),
            sinks: vec![
                SinkConfig::new(SinkKind::Console),
                SinkConfig::new(SinkKind::Remote(RemoteSettings::default())),
            ],
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`; unparseable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(application) = lookup("APP_NAME") {
            config.application = application;
        }

        if let Some(environment) = lookup("APP_ENVIRONMENT") {
            config.environment = environment;
        }

        if let Some(level) = lookup("MIN_LEVEL") {
            match LogLevel::parse(&level) {
                Some(level) => config.minimum_level = level,
                None => warn!("Ignoring unknown MIN_LEVEL '{}'", level),
            }
        }

        if let Some(overrides) = lookup("LEVEL_OVERRIDES") {
            match parse_overrides(&overrides) {
                Ok(parsed) => config.level_overrides = parsed,
                Err(e) => warn!("Ignoring LEVEL_OVERRIDES: {}", e),
            }
        }

        if let Some(batch_size) = lookup("BATCH_SIZE") {
            if let Ok(size) = batch_size.parse() {
                config.batch_size = size;
            }
        }

        if let Some(max_age) = lookup("BATCH_MAX_AGE_MS") {
            if let Ok(ms) = max_age.parse::<u64>() {
                config.batch_max_age = Duration::from_millis(ms);
            }
        }

        if let Some(capacity) = lookup("CHANNEL_CAPACITY") {
            if let Ok(capacity) = capacity.parse() {
                config.channel_capacity = capacity;
            }
        }

        if let Some(capacity) = lookup("QUEUE_CAPACITY") {
            if let Ok(capacity) = capacity.parse() {
                config.queue_capacity = capacity;
            }
        }

        if let Some(grace) = lookup("SHUTDOWN_GRACE_MS") {
            if let Ok(ms) = grace.parse::<u64>() {
                config.shutdown_grace = Duration::from_millis(ms);
            }
        }

        let retry = retry_from_lookup(&lookup);
        let remote = remote_from_lookup(&lookup);

        let sink_names = lookup("SINKS").unwrap_or_else(|| "console,remote".to_string());
        config.sinks = sink_names
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .filter_map(|name| {
                let kind = match name.as_str() {
                    "console" => SinkKind::Console,
                    "debug" => SinkKind::Debug,
                    "remote" | "elasticsearch" => SinkKind::Remote(remote.clone()),
                    other => {
                        warn!("Ignoring unknown sink '{}'", other);
                        return None;
                    }
                };
                Some(SinkConfig {
                    kind,
                    retry: retry.clone(),
                })
            })
            .collect();

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.validate_pipeline()?;

        if self.sinks.is_empty() {
            return Err("at least one sink must be configured".to_string());
        }

        for sink in &self.sinks {
            sink.retry
                .validate()
                .map_err(|e| format!("{} sink: {}", sink.name(), e))?;

            if let SinkKind::Remote(remote) = &sink.kind {
                if remote.endpoint.is_empty() {
                    return Err("remote endpoint cannot be empty".to_string());
                }
                if remote.max_event_bytes == 0 {
                    return Err("max_event_bytes must be greater than 0".to_string());
                }
                IndexTemplate::parse(&remote.index_template).map_err(|e| e.to_string())?;
            }
        }

        Ok(())
    }

    /// Validate everything except the sink list.
    pub fn validate_pipeline(&self) -> Result<(), String> {
        if self.application.is_empty() {
            return Err("application cannot be empty".to_string());
        }

        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }

        if self.batch_max_age.is_zero() {
            return Err("batch_max_age must be greater than 0".to_string());
        }

        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        if self.shutdown_grace.is_zero() {
            return Err("shutdown_grace must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn retry_from_lookup<F>(lookup: &F) -> RetryPolicy
where
    F: Fn(&str) -> Option<String>,
{
    let mut retry = RetryPolicy::default();

    if let Some(attempts) = lookup("RETRY_MAX_ATTEMPTS") {
        if let Ok(attempts) = attempts.parse() {
            retry.max_attempts = attempts;
        }
    }

    if let Some(backoff) = lookup("RETRY_INITIAL_BACKOFF_MS") {
        if let Ok(ms) = backoff.parse::<u64>() {
            retry.initial_backoff = Duration::from_millis(ms);
        }
    }

    if let Some(backoff) = lookup("RETRY_MAX_BACKOFF_MS") {
        if let Ok(ms) = backoff.parse::<u64>() {
            retry.max_backoff = Duration::from_millis(ms);
        }
    }

    if let Some(jitter) = lookup("RETRY_JITTER") {
        retry.jitter = jitter.to_lowercase() == "true";
    }

    if let Some(interval) = lookup("PROBE_INTERVAL_MS") {
        if let Ok(ms) = interval.parse::<u64>() {
            retry.probe_interval = Duration::from_millis(ms);
        }
    }

    retry
}

fn remote_from_lookup<F>(lookup: &F) -> RemoteSettings
where
    F: Fn(&str) -> Option<String>,
{
    let mut remote = RemoteSettings::default();

    if let Some(endpoint) = lookup("REMOTE_ENDPOINT") {
        remote.endpoint = endpoint;
    }

    if let Some(template) = lookup("INDEX_TEMPLATE") {
        remote.index_template = template;
    }

    if let Some(timeout) = lookup("HTTP_TIMEOUT_SECONDS") {
        if let Ok(seconds) = timeout.parse::<u64>() {
            remote.http_timeout = Duration::from_secs(seconds);
        }
    }

    if let Some(limit) = lookup("MAX_EVENT_BYTES") {
        if let Ok(bytes) = limit.parse() {
            remote.max_event_bytes = bytes;
        }
    }

    remote.username = lookup("REMOTE_USERNAME").filter(|s| !s.is_empty());
    remote.password = lookup("REMOTE_PASSWORD").filter(|s| !s.is_empty());

    remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sinks.len(), 2);
        assert_eq!(config.sinks[0].name(), "console");
        assert_eq!(config.sinks[1].name(), "remote");
    }

    #[test]
    fn test_from_lookup_reads_every_section() {
        let config = Config::from_lookup(lookup(&[
            ("APP_NAME", "dotnetelk"),
            ("APP_ENVIRONMENT", "Staging"),
            ("MIN_LEVEL", "Debug"),
            ("LEVEL_OVERRIDES", "Microsoft=Warning,System=Error"),
            ("SINKS", "console, debug, elasticsearch"),
            ("REMOTE_ENDPOINT", "http://elasticsearch:9200"),
            ("INDEX_TEMPLATE", "{application}-{date:%Y.%m.%d}"),
            ("BATCH_SIZE", "5"),
            ("BATCH_MAX_AGE_MS", "250"),
            ("QUEUE_CAPACITY", "3"),
            ("RETRY_MAX_ATTEMPTS", "4"),
            ("RETRY_INITIAL_BACKOFF_MS", "50"),
            ("RETRY_JITTER", "false"),
            ("SHUTDOWN_GRACE_MS", "2000"),
            ("REMOTE_USERNAME", "elastic"),
        ]));

        assert_eq!(config.application, "dotnetelk");
        assert_eq!(config.environment, "Staging");
        assert_eq!(config.minimum_level, LogLevel::Debug);
        assert_eq!(config.level_overrides.len(), 2);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_max_age, Duration::from_millis(250));
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));

        let names: Vec<_> = config.sinks.iter().map(SinkConfig::name).collect();
        assert_eq!(names, vec!["console", "debug", "remote"]);

        let remote = &config.sinks[2];
        assert_eq!(remote.retry.max_attempts, 4);
        assert_eq!(remote.retry.initial_backoff, Duration::from_millis(50));
        assert!(!remote.retry.jitter);
        match &remote.kind {
            SinkKind::Remote(settings) => {
                assert_eq!(settings.endpoint, "http://elasticsearch:9200");
                assert_eq!(settings.index_template, "{application}-{date:%Y.%m.%d}");
                assert_eq!(settings.username.as_deref(), Some("elastic"));
                assert!(settings.password.is_none());
            }
            other => panic!("expected remote sink, got {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("BATCH_SIZE", "lots"),
            ("MIN_LEVEL", "loud"),
            ("LEVEL_OVERRIDES", "Microsoft"),
            ("SINKS", "console,syslog"),
        ]));

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.minimum_level, LogLevel::Information);
        assert!(config.level_overrides.is_empty());
        assert_eq!(config.sinks.len(), 1);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sinks.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sinks = vec![SinkConfig::new(SinkKind::Remote(RemoteSettings {
            index_template: "{tenant}".to_string(),
            ..RemoteSettings::default()
        }))];
        assert!(config.validate().is_err());
    }
}
