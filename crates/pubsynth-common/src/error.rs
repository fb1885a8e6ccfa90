use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PubsynthError {
    /// Transport failure: timeout, refused connection, reset, or a 5xx reply.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The provider rejected the request (bad key, quota, unknown model).
    #[error("Model error{}: {message}", status.map(|s| format!(" [{s}]")).unwrap_or_default())]
    Model { status: Option<u16>, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, PubsynthError>;

impl PubsynthError {
    pub fn model(message: impl Into<String>) -> Self {
        PubsynthError::Model { status: None, message: message.into() }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, PubsynthError::Network(_))
    }

    /// Short category shown to users; the full `Display` goes to the log.
    pub fn category(&self) -> &'static str {
        match self {
            PubsynthError::Network(_)      => "network",
            PubsynthError::Parse(_)        => "parse",
            PubsynthError::Model { .. }    => "model",
            PubsynthError::Config(_)       => "config",
            PubsynthError::InvalidInput(_) => "invalid input",
        }
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 {
            PubsynthError::Network(format!("server returned {status}: {message}"))
        } else {
            PubsynthError::Model { status: Some(status), message }
        }
    }
}

impl From<reqwest::Error> for PubsynthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return PubsynthError::Parse(e.to_string());
        }
        if let Some(status) = e.status() {
            return PubsynthError::from_status(status.as_u16(), e.to_string());
        }
        PubsynthError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for PubsynthError {
    fn from(e: serde_json::Error) -> Self {
        PubsynthError::Parse(e.to_string())
    }
}
