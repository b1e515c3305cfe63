use fleet_proto::FrameError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur while serving the broker
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to connect to broker {url}: {source}")]
    ConnectionFailed {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broker closed the connection")]
    Closed,

    #[error("Giving up after {0} failed connection attempts")]
    AttemptsExhausted(usize),
}
