use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The negotiation engine rejected a create/set description request.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Signaling relay (HTTP or socket) or host bus failure.
    #[error("signaling transport failure: {0}")]
    Transport(String),
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("connection closed")]
    Closed,
    /// Malformed or out-of-sequence negotiation payload.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Rtc(Arc<webrtc::Error>),
}

impl Error {
    pub fn channel_closed() -> Self {
        Error::ChannelClosed
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Rtc(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Protocol(value.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::Config(value.to_string())
    }
}
