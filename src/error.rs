//! Error types for the measurement engine.

/// Terminal faults of a latency probe.
///
/// An unreachable host is not an error: it is reported as a failed
/// [`ProbeResult`](crate::speedtest::ping::ProbeResult).
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe target: {0}")]
    InvalidTarget(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Transport faults that abort a download or upload session.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("upload sink stalled for more than {0:?}")]
    SinkTimeout(std::time::Duration),

    #[error("upload sink closed the connection: {0}")]
    SinkClosed(String),

    #[error("upload session {0} is already running")]
    SessionInUse(String),
}
