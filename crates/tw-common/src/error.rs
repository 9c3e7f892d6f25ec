/// Convenient Result alias.
pub type ClientResult<T> = Result<T, ClientError>;

/// Socket-level failures on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to open push channel: {0}")]
    Open(String),

    #[error("Push channel closed: {0}")]
    Closed(String),

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Push channel gave up after {0} reconnect attempts")]
    Exhausted(u32),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Failures of a single REST status request.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid status body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Invalid request URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Client-level error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Protocol(#[from] tw_protocol::ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
