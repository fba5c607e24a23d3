use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerfError {
    #[error("invalid transfer size {0:?}")]
    InvalidSize(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("serialize/deserialize error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("timeout occured")]
    Timeout,
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("bad service URL: {0}")]
    ServiceUnsupported(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("session cancelled")]
    Cancelled,
}

impl PerfError {
    /// Whether the error means the peer already went away, as opposed to a
    /// failure on a live connection.
    pub fn is_closed(&self) -> bool {
        use tokio_tungstenite::tungstenite::Error as WsError;
        let PerfError::WebSocket(e) = self else {
            return false;
        };
        matches!(**e, WsError::ConnectionClosed | WsError::AlreadyClosed)
    }
}

// reducing size of PerfError by putting large element in the Box
impl From<tokio_tungstenite::tungstenite::Error> for PerfError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        PerfError::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, PerfError>;

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::Error as WsError;

    use super::*;

    #[test]
    fn closed_connections_are_told_apart() {
        assert!(PerfError::from(WsError::ConnectionClosed).is_closed());
        assert!(PerfError::from(WsError::AlreadyClosed).is_closed());
        assert!(!PerfError::from(WsError::Io(std::io::Error::other("reset"))).is_closed());
        assert!(!PerfError::Timeout.is_closed());
    }
}
