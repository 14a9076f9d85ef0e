use http::StatusCode;

/// Trait for domain errors that can be converted to HTTP responses
///
/// Implemented by each subsystem crate's error type. The relay layer
/// converts these into actual HTTP responses, keeping domain errors
/// decoupled from any web framework.
pub trait HttpError: std::error::Error {
    /// HTTP status code for this error
    fn status_code(&self) -> StatusCode;

    /// Machine-readable error type (e.g. `insufficient_quota`)
    fn error_type(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;
}

/// Error value observed from an upstream provider call
///
/// The relay's vendor adapters produce this; the core only classifies
/// it (disable predicates, concurrency-window detection) and never
/// parses vendor payloads itself.
#[derive(Debug, Clone, Default)]
pub struct UpstreamError {
    /// HTTP status of the upstream response, when one was received
    pub status: Option<u16>,
    /// Vendor error code (e.g. `invalid_api_key`)
    pub code: Option<String>,
    /// Vendor error type (e.g. `authentication_error`)
    pub error_type: Option<String>,
    /// Raw message text
    pub message: String,
    /// Set by adapters for errors that must not trigger a retry or a
    /// channel disable (caller-side problems)
    pub skip_retry: bool,
}

impl UpstreamError {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream error (status {status}): {}", self.message),
            None => write!(f, "upstream error: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}
