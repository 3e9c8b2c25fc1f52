//! Error types for resolvhook.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Errors raised while loading or materializing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error (create, read, stat)
    #[error("IO error on {path}: {source}")]
    Io {
        /// File the operation was performed on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Default config could not be serialized
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Config source could not be read or deserialized
    #[error("Config error: {0}")]
    Load(#[from] ::config::ConfigError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while reading or compiling the rules file.
#[derive(Debug, Error)]
pub enum RuleError {
    /// IO error (create, read)
    #[error("IO error on {path}: {source}")]
    Io {
        /// Rules file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A line did not tokenize into `<tag> <pattern>`
    #[error("invalid rule at line {line}")]
    Syntax {
        /// 1-based line number.
        line: usize,
    },

    /// Pattern did not compile
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        /// Pattern as written in the rules file.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// Errors raised by a single trigger invocation.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// No usable shell was found at startup
    #[error("shell not found")]
    NoShell,

    /// Shell process could not be spawned
    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] std::io::Error),

    /// Command exited unsuccessfully
    #[error("exec failed ({status}): {output}")]
    CommandFailed {
        /// Exit status of the shell.
        status: ExitStatus,
        /// Combined stdout and stderr.
        output: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("endpoint returned {status}")]
    HttpStatus {
        /// Response status.
        status: reqwest::StatusCode,
    },
}

/// Errors raised by a single exchange with an upstream resolver.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Socket, resolution or send/receive failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream host resolved to no address
    #[error("no address for upstream")]
    NoAddress,

    /// No matching response within the transport timeout
    #[error("exchange timed out")]
    Timeout,

    /// Response was not a valid DNS message
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// Errors raised by a server instance.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listen socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Start called on a running server
    #[error("server is running")]
    AlreadyRunning,

    /// Stop called on a server that is not running
    #[error("server is not running")]
    NotRunning,

    /// Listener failed while running
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal supervisor errors. Any of these ends the process with a non-zero status.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Config could not be loaded
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Server could not be started or stopped
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Running server reported a fault
    #[error("server fault: {0}")]
    Fault(ServerError),
}
