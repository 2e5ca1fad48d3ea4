use thiserror::Error;

/// Fatal problems detected while turning a run descriptor into a plan.
///
/// These are the only errors that stop a run as a whole; they are raised
/// before any virtual user is spawned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("APP_URL (base_url) is required, e.g. https://your-app.example")]
    MissingBaseUrl,

    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("stage {index} is invalid: {reason}")]
    InvalidStage { index: usize, reason: String },

    #[error("run has no duration: set `duration`, `stages` or `iterations`")]
    NoDuration,

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("unknown threshold metric '{0}'")]
    UnknownMetric(String),

    #[error("invalid threshold '{expression}' on {metric}: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("unknown profile '{0}' (expected smoke or ramp)")]
    UnknownProfile(String),

    #[error("failed to read config {path}: {reason}")]
    Load { path: String, reason: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
