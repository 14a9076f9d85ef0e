use http::StatusCode;
use meridian_core::HttpError;
use thiserror::Error;

/// Channel selection errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No enabled channel serves the requested group/model pair
    #[error("no channel available for group {group}, model {model}")]
    NoChannelAvailable {
        group: String,
        model: String,
    },

    /// Group "auto" was requested but no auto group produced a channel
    #[error("no auto group could satisfy model {model}")]
    AutoGroupsExhausted {
        model: String,
    },
}

impl HttpError for ChannelError {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    fn error_type(&self) -> &str {
        "no_channel_available"
    }

    fn client_message(&self) -> String {
        self.to_string()
    }
}
