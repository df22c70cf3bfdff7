use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("webrtc error: {0}")]
    Webrtc(Arc<webrtc::Error>),

    #[error("document store request failed: {0}")]
    Http(Arc<reqwest::Error>),

    /// The document store answered with a non-success status. This is never folded into an
    /// empty response.
    #[error("document store returned status {status} for {url}")]
    StoreStatus { status: u16, url: String },

    #[error("malformed document: {0}")]
    Json(Arc<serde_json::Error>),

    /// Shared container could not be resolved or created. Terminal for the connection.
    #[error("failed to initialize connection: {0}")]
    Initialization(Box<Error>),

    #[error("shared container {0} is missing, it may have been deleted while in use")]
    RoomSourceMissing(String),

    #[error("local candidates were not gathered within {0:?}")]
    GatherTimeout(Duration),

    #[error("message channel is not open")]
    ChannelNotOpen,

    #[error("event type '{0}' is reserved for connection control messages")]
    ReservedEventType(String),

    #[error("connection has been closed")]
    Closed,
}

impl Error {
    pub fn channel_closed() -> Self {
        Error::ChannelNotOpen
    }

    pub(crate) fn initialization(cause: Error) -> Self {
        Error::Initialization(Box::new(cause))
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Webrtc(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Http(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
