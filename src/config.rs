//! Configuration types for resolvhook.
//!
//! The config file is YAML. A missing file is written out with [`Config::template`]
//! on first load; fields absent from an existing file fall back to the defaults
//! defined here.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::info;

use crate::error::ConfigError;

/// Environment variable prefix for config overrides (`RESOLVHOOK__SERVER__PORT=5353`).
const ENV_PREFIX: &str = "RESOLVHOOK";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log questions, trigger command lines and their output at `info`.
    #[serde(default = "default_verbose")]
    pub verbose: bool,

    /// Interval between config/rules modification checks. Zero disables reloading.
    #[serde(default = "default_reload", with = "duration")]
    pub reload: Duration,

    /// Listen address.
    #[serde(default)]
    pub server: ServerConfig,

    /// Rules file path.
    #[serde(default = "default_rules_path")]
    pub rules: PathBuf,

    /// Upstream resolvers, tried in order.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<UpstreamConfig>,

    /// Transport timeout for a single upstream exchange.
    #[serde(default = "default_upstream_timeout", with = "duration")]
    pub upstream_timeout: Duration,

    /// Trigger configuration.
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Listen address configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host or IP to bind.
    #[serde(default = "default_listen_host")]
    pub host: String,

    /// UDP port to bind.
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

/// Upstream DNS resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Host or IP of the resolver.
    pub host: String,

    /// UDP port of the resolver.
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

/// Trigger lists. Every entry is evaluated independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Shell command triggers.
    #[serde(default)]
    pub command: Vec<CommandTrigger>,

    /// JSON-over-HTTP triggers.
    #[serde(default)]
    pub json_http: Vec<WebhookTrigger>,
}

/// Shell command trigger.
///
/// Event template placeholders: `{tag}`, `{domain}`, `{type}` (`A` or `AAAA`),
/// `{ip}` when `batch` is false, `{ips}` (comma-separated) when `batch` is true.
/// Lifecycle template placeholder: `{state}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTrigger {
    /// Run detached instead of blocking the caller (`async` in YAML).
    #[serde(default, rename = "async")]
    pub detached: bool,

    /// Run once per address family with `{ips}` instead of once per address.
    #[serde(default)]
    pub batch: bool,

    /// Command run when a rule matches.
    #[serde(default)]
    pub event_template: String,

    /// Command run on every lifecycle event.
    #[serde(default)]
    pub lifecycle_template: String,

    /// Command run on `start`.
    #[serde(default)]
    pub on_start: String,

    /// Command run on `stop`.
    #[serde(default)]
    pub on_stop: String,

    /// Command run on `partial_start` (server restarted by a config reload).
    #[serde(default)]
    pub on_partial_start: String,

    /// Command run on `partial_stop` (server stopped by a config reload).
    #[serde(default)]
    pub on_partial_stop: String,
}

/// JSON-over-HTTP trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTrigger {
    /// Run detached instead of blocking the caller (`async` in YAML).
    #[serde(default, rename = "async")]
    pub detached: bool,

    /// Endpoint receiving match event payloads.
    #[serde(default)]
    pub event_endpoint: String,

    /// Endpoint receiving lifecycle payloads.
    #[serde(default)]
    pub lifecycle_endpoint: String,
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "resolvhook=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address (requires the `prometheus` feature).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: default_verbose(),
            reload: default_reload(),
            server: ServerConfig::default(),
            rules: default_rules_path(),
            upstreams: default_upstreams(),
            upstream_timeout: default_upstream_timeout(),
            trigger: TriggerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_dns_port(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` suitable for binding.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl UpstreamConfig {
    /// `host:port` suitable for sending to.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn default_verbose() -> bool {
    true
}

fn default_reload() -> Duration {
    Duration::from_secs(10)
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("resolvhook.rules")
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_dns_port() -> u16 {
    53
}

fn default_upstreams() -> Vec<UpstreamConfig> {
    vec![UpstreamConfig {
        host: "8.8.8.8".to_string(),
        port: default_dns_port(),
    }]
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults plus one example trigger of each kind. Written when no config file exists.
    pub fn template() -> Self {
        Self {
            trigger: TriggerConfig {
                command: vec![CommandTrigger {
                    detached: false,
                    batch: false,
                    event_template: "echo 'tag={tag} domain={domain} type={type} ip={ip}'"
                        .to_string(),
                    lifecycle_template: "echo '{state}'".to_string(),
                    on_start: "echo on_start".to_string(),
                    on_stop: "echo on_stop".to_string(),
                    on_partial_start: "echo on_partial_start".to_string(),
                    on_partial_stop: "echo on_partial_stop".to_string(),
                }],
                json_http: vec![WebhookTrigger {
                    detached: false,
                    event_endpoint: "https://api.example.com/v1/firewall/event".to_string(),
                    lifecycle_endpoint: "https://api.example.com/v1/firewall/lifecycle"
                        .to_string(),
                }],
            },
            ..Self::default()
        }
    }

    /// Load the config file, writing [`Config::template`] to it first if it does not exist.
    ///
    /// Values may be overridden from the environment with `RESOLVHOOK__<SECTION>__<KEY>`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::materialize(path).await?,
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(&text, ::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Write the template to `path` and return the YAML written.
    async fn materialize(path: &Path) -> Result<String, ConfigError> {
        let yaml = serde_yaml::to_string(&Self::template())?;
        tokio::fs::write(path, &yaml)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), "Wrote default config");
        Ok(yaml)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("rules path is empty".to_string()));
        }
        if let Some(upstream) = self.upstreams.iter().find(|u| u.host.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "upstream with empty host (port {})",
                upstream.port
            )));
        }
        Ok(())
    }
}

/// Modification time of a file, used by the reload loop to detect changes.
pub async fn modified_time(path: &Path) -> std::io::Result<SystemTime> {
    tokio::fs::metadata(path).await?.modified()
}

/// Durations are written as `10s`/`250ms` and read from either a bare number of
/// seconds or a number with an `ms`, `s`, `m` or `h` suffix.
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration `{}`", text))?;

        let secs = |factor: u64| {
            value
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration `{}` out of range", text))
        };

        match unit.trim() {
            "" | "s" => Ok(Duration::from_secs(value)),
            "ms" => Ok(Duration::from_millis(value)),
            "m" => secs(60),
            "h" => secs(3600),
            other => Err(format!("unknown duration unit `{}` in `{}`", other, text)),
        }
    }
}
