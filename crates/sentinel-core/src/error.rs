use thiserror::Error;

/// Top-level error type for shared Sentinel types and configuration.
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid engagement id {id:?}: {reason}")]
    InvalidEngagementId { id: String, reason: &'static str },
}

impl From<config::ConfigError> for SentinelError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
