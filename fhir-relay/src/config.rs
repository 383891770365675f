use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time;

use chrono::NaiveDate;
use envconfig::Envconfig;
use fhir_common::filter::{Comparator, DateFilterConfig, FilterTimezone};
use fhir_common::retry::RetryPolicy;
use url::Url;

use crate::error::ConfigError;

/// Env file loaded before reading the environment, unless `FHIR_RELAY_ENV_FILE` is set.
pub const DEFAULT_ENV_FILE: &str = "app.env";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "APP_NAME", default = "fhir-to-server")]
    pub app_name: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "LOG_FORMAT", default = "text")]
    pub log_format: LogFormat,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub fhir: FhirConfig,

    #[envconfig(nested = true)]
    pub filter: FilterConfig,
}

impl Config {
    /// Load the env file, then read the configuration from the environment. Variables
    /// already set in the environment win over the ones in the file.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, explicit) = match std::env::var("FHIR_RELAY_ENV_FILE") {
            Ok(path) => (path, true),
            Err(_) => (DEFAULT_ENV_FILE.to_owned(), false),
        };

        match dotenvy::from_path(&path) {
            Ok(()) => {}
            Err(dotenvy::Error::Io(error))
                if !explicit && error.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ConfigError::EnvFile { path, source }),
        }

        Ok(Self::init_from_env()?)
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_retry_count(
            self.fhir.retry_count,
            self.fhir.retry_timeout.0,
            self.fhir.retry_wait.0,
            self.fhir.retry_max_wait.0,
        )
    }

    /// How long a worker may go without reporting before it counts as stalled: one poll
    /// plus a forward going through every attempt and backoff.
    pub fn liveness_deadline(&self) -> time::Duration {
        let policy = self.retry_policy();
        let attempts = policy.max_attempts();
        let backoff = (1..attempts)
            .map(|attempt| policy.time_until_next_retry(attempt))
            .sum::<time::Duration>();

        self.kafka.kafka_poll_timeout.0
            + policy.per_attempt_timeout() * attempts
            + backoff
            + time::Duration::from_secs(30)
    }

    /// The date filter to apply, if a threshold date is configured.
    pub fn date_filter(&self) -> Option<DateFilterConfig> {
        let threshold = self.filter.date_value?;

        Some(
            DateFilterConfig::new(threshold, self.filter.date_comparator.unwrap_or_default())
                .inclusive(self.filter.date_inclusive)
                .timezone(self.filter.date_timezone),
        )
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BOOTSTRAP_SERVERS", default = "localhost:9092")]
    pub kafka_bootstrap_servers: String,

    #[envconfig(from = "KAFKA_SECURITY_PROTOCOL", default = "plaintext")]
    pub kafka_security_protocol: String,

    #[envconfig(from = "KAFKA_SSL_CA_LOCATION")]
    pub kafka_ssl_ca_location: Option<String>,

    #[envconfig(from = "KAFKA_SSL_CERTIFICATE_LOCATION")]
    pub kafka_ssl_certificate_location: Option<String>,

    #[envconfig(from = "KAFKA_SSL_KEY_LOCATION")]
    pub kafka_ssl_key_location: Option<String>,

    #[envconfig(from = "KAFKA_SSL_KEY_PASSWORD")]
    pub kafka_ssl_key_password: Option<Secret>,

    #[envconfig(from = "KAFKA_INPUT_TOPICS")]
    pub kafka_input_topics: TopicList,

    #[envconfig(from = "KAFKA_OFFSET_RESET", default = "earliest")]
    pub kafka_offset_reset: String,

    #[envconfig(from = "KAFKA_AUTO_COMMIT_INTERVAL_MS", default = "5000")]
    pub kafka_auto_commit_interval_ms: u32,

    #[envconfig(from = "KAFKA_POLL_TIMEOUT_MS", default = "1000")]
    pub kafka_poll_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone, Debug)]
pub struct FhirConfig {
    #[envconfig(from = "FHIR_SERVER_BASE_URL")]
    pub server_base_url: Url,

    #[envconfig(from = "FHIR_SERVER_AUTH_USER")]
    pub auth_user: Option<String>,

    #[envconfig(from = "FHIR_SERVER_AUTH_PASSWORD")]
    pub auth_password: Option<Secret>,

    /// Retries after the first attempt.
    #[envconfig(from = "FHIR_RETRY_COUNT", default = "3")]
    pub retry_count: u32,

    #[envconfig(from = "FHIR_RETRY_TIMEOUT_MS", default = "10000")]
    pub retry_timeout: EnvMsDuration,

    #[envconfig(from = "FHIR_RETRY_WAIT_MS", default = "5000")]
    pub retry_wait: EnvMsDuration,

    #[envconfig(from = "FHIR_RETRY_MAX_WAIT_MS", default = "20000")]
    pub retry_max_wait: EnvMsDuration,
}

impl FhirConfig {
    /// Basic auth credentials, when a user is configured. A missing password is empty.
    pub fn credentials(&self) -> Option<(String, Secret)> {
        let user = self.auth_user.as_ref().filter(|user| !user.is_empty())?;
        let password = self.auth_password.clone().unwrap_or_default();
        Some((user.clone(), password))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct FilterConfig {
    #[envconfig(from = "FHIR_FILTER_DATE_VALUE")]
    pub date_value: Option<NaiveDate>,

    #[envconfig(from = "FHIR_FILTER_DATE_COMPARATOR")]
    pub date_comparator: Option<Comparator>,

    #[envconfig(from = "FHIR_FILTER_DATE_INCLUSIVE", default = "false")]
    pub date_inclusive: bool,

    #[envconfig(from = "FHIR_FILTER_DATE_TIMEZONE", default = "Europe/Berlin")]
    pub date_timezone: FilterTimezone,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma separated list of topics, with at least one topic and no duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

impl TopicList {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseTopicListError {
    Empty,
    Duplicate(String),
}

impl FromStr for TopicList {
    type Err = ParseTopicListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut seen = HashSet::new();
        let mut topics = Vec::new();

        for topic in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if !seen.insert(topic) {
                return Err(ParseTopicListError::Duplicate(topic.to_owned()));
            }
            topics.push(topic.to_owned());
        }

        if topics.is_empty() {
            return Err(ParseTopicListError::Empty);
        }
        Ok(TopicList(topics))
    }
}

/// A value that must never end up in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            invalid => Err(ParseLogFormatError(invalid.to_owned())),
        }
    }
}
