/// A single rejected form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

/// Input rejected before a student record is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid student input ({})", join_fields(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|err| format!("{}: {}", err.field, err.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failed: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("storage migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to encode or decode '{key}': {source}")]
    Serialization {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to prediction service failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("prediction service returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("prediction service response could not be decoded: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("prediction service rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("APP_ENV must be 'development' or 'production', got '{0}'")]
    InvalidEnvironment(String),
    #[error("APP_PLATFORM must be one of ios, android, emulator, simulator, web; got '{0}'")]
    InvalidPlatform(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level/filter '{value}': unable to build EnvFilter")]
    EnvFilter {
        value: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("telemetry error: {0}")]
    Subscriber(Box<dyn std::error::Error + Send + Sync>),
}

/// Failure of the submit-a-student flow.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
