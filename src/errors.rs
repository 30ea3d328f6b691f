use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Nothing to do: no destination root or no source address.
    #[error("Configuration missing: {message}")]
    ConfigurationMissing { message: String },

    #[error("Failed to create folder '{path}': {source}")]
    FolderCreateFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    ProcessSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process crashed: {message}")]
    ProcessCrashed { message: String },

    #[error("Process exited immediately: {message}")]
    ProcessExitedImmediately { message: String },

    #[error("Fetch timed out after {millis} ms")]
    FetchTimeout { millis: u64 },

    #[error("Fetch failed: {message}")]
    FetchFailed { message: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn configuration_missing(message: impl Into<String>) -> Self {
        Self::ConfigurationMissing { message: message.into() }
    }

    pub fn folder_create_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FolderCreateFailed { path: path.into(), source }
    }

    pub fn process_spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::ProcessSpawnFailed { program: program.into(), source }
    }

    pub fn process_crashed(message: impl Into<String>) -> Self {
        Self::ProcessCrashed { message: message.into() }
    }

    pub fn process_exited_immediately(message: impl Into<String>) -> Self {
        Self::ProcessExitedImmediately { message: message.into() }
    }

    pub fn fetch_failed(message: impl Into<String>) -> Self {
        Self::FetchFailed { message: message.into() }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// HTTP status used when the error reaches an API client.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidInput { .. } | Self::UrlParse { .. } | Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::ConfigurationMissing { .. } => StatusCode::CONFLICT,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::FetchTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::FetchFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
