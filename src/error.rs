use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// Error payload carried by the server's `error` event.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type")]
    pub error_type: ApiErrorType,
    pub code: Option<String>,
    pub message: String,
    pub param: Option<String>,
    pub event_id: Option<String>,
}

/// Code the server uses when a `response.create` races an already running response.
pub const ACTIVE_RESPONSE_CONFLICT: &str = "conversation_already_has_active_response";

impl ServerError {
    #[must_use]
    pub fn is_active_response_conflict(&self) -> bool {
        self.code.as_deref() == Some(ACTIVE_RESPONSE_CONFLICT)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OpenAI API error: {0:?}")]
    Api(ServerError),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("Connection closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    #[error("Connection lost after {attempts} reconnection attempts, please restart")]
    ReconnectExhausted { attempts: u32 },

    #[error("Microphone unavailable: {0}")]
    Microphone(String),

    #[error("Audio output unavailable: {0}")]
    AudioOutput(String),

    #[error("Failed to obtain session credentials: {0}")]
    Credentials(String),

    #[error("Session credentials temporarily unavailable: {0}")]
    CredentialsUnavailable(String),

    #[error("Agent network gateway error: {0}")]
    Gateway(String),

    #[error("Failed to decode audio: {0}")]
    AudioDecode(#[from] base64::DecodeError),

    #[error("Failed to create resampler: {0}")]
    ResamplerSetup(#[from] rubato::ResamplerConstructionError),

    #[error("Resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),

    #[error("Invalid client event: {0}")]
    InvalidClientEvent(String),

    #[error("The session has been stopped")]
    SessionStopped,
}

pub type Result<T> = std::result::Result<T, Error>;

/// How an error affects the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Surfaced immediately; the session does not reconnect.
    Fatal,
    /// Network-level failure handled by the reconnection policy.
    Retriable,
    /// A dispatched tool call failed; narrated back to the model as tool output.
    ExternalCall,
    /// Server reported an error event; the session stays up.
    Protocol,
    /// Caller misuse or local data error; the session stays up.
    Usage,
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Microphone(_)
            | Self::Credentials(_)
            | Self::AudioOutput(_)
            | Self::ReconnectExhausted { .. } => ErrorKind::Fatal,
            Self::WebSocket(_)
            | Self::Io(_)
            | Self::ConnectionClosed
            | Self::AbnormalClose { .. }
            | Self::CredentialsUnavailable(_) => ErrorKind::Retriable,
            Self::Gateway(_) => ErrorKind::ExternalCall,
            Self::Api(_) => ErrorKind::Protocol,
            Self::Http(_)
            | Self::Serialization(_)
            | Self::Url(_)
            | Self::Header(_)
            | Self::AudioDecode(_)
            | Self::ResamplerSetup(_)
            | Self::Resample(_)
            | Self::InvalidClientEvent(_)
            | Self::SessionStopped => ErrorKind::Usage,
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    /// Classify a token source failure. The token endpoint being unreachable
    /// is [`Error::CredentialsUnavailable`]; a rejected or malformed request
    /// is [`Error::Credentials`].
    #[must_use]
    pub fn into_credentials_error(self) -> Self {
        match self {
            Self::Credentials(_) | Self::CredentialsUnavailable(_) => self,
            Self::Http(ref err) if is_rejection(err) => Self::Credentials(self.to_string()),
            Self::Http(_)
            | Self::Io(_)
            | Self::WebSocket(_)
            | Self::ConnectionClosed
            | Self::AbnormalClose { .. } => Self::CredentialsUnavailable(self.to_string()),
            other => Self::Credentials(other.to_string()),
        }
    }
}

fn is_rejection(err: &reqwest::Error) -> bool {
    err.status().is_some_and(|status| {
        status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS
    }) || err.is_builder()
}

/// Clonable record of the most recent error, exposed through the session status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for LastError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_session_policy() {
        assert_eq!(Error::Microphone("denied".into()).kind(), ErrorKind::Fatal);
        assert_eq!(Error::Credentials("401".into()).kind(), ErrorKind::Fatal);
        assert_eq!(
            Error::AbnormalClose { code: 1006, reason: String::new() }.kind(),
            ErrorKind::Retriable
        );
        assert_eq!(Error::Gateway("timeout".into()).kind(), ErrorKind::ExternalCall);
        assert!(Error::ReconnectExhausted { attempts: 5 }.is_fatal());
    }

    #[test]
    fn unreachable_token_endpoint_is_retriable() {
        let err = Error::Io(std::io::Error::other("network unreachable")).into_credentials_error();
        assert!(matches!(err, Error::CredentialsUnavailable(_)));
        assert_eq!(err.kind(), ErrorKind::Retriable);
        assert!(err.to_string().contains("network unreachable"));

        let err = Error::Credentials("401".into()).into_credentials_error();
        assert!(err.is_fatal());
        let err = Error::Serialization(serde_json::from_str::<u8>("x").unwrap_err())
            .into_credentials_error();
        assert!(matches!(err, Error::Credentials(_)));
    }

    #[test]
    fn last_error_copies_message() {
        let err = Error::ReconnectExhausted { attempts: 3 };
        let last = LastError::from(&err);
        assert_eq!(last.kind, ErrorKind::Fatal);
        assert!(last.message.contains("please restart"));
    }
}
