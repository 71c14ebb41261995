use thiserror::Error;

/// Failures of the raw transport: the HTTP API or the event stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event stream error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("event stream is not connected")]
    NotConnected,

    #[error("event stream closed by the remote end")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Errors surfaced by `RemoteState` operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote answered with `ok: false`.
    #[error("{method} failed: {error}")]
    Api { method: String, error: String },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected response to {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no more than {max} users can be invited at once")]
    TooManyUsers { max: usize },
}

impl RemoteError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
