//! Broker error types

use axum::http::StatusCode;
use fleet_proto::FrameError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Missing or malformed Proxy-Id header: {0:?}")]
    InvalidProxyId(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(u64),

    #[error("Tunnel {0} did not answer within {1:?}")]
    Timeout(u64, Duration),

    #[error("Tunnel {0} disconnected")]
    Disconnected(u64),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl TunnelError {
    /// Status and body returned to the forwarding caller
    pub fn http_response(&self) -> (StatusCode, &'static str) {
        match self {
            TunnelError::InvalidProxyId(_) => (StatusCode::BAD_REQUEST, "Internal error"),
            TunnelError::TunnelNotFound(_) => (StatusCode::BAD_REQUEST, "Internal Error"),
            TunnelError::Timeout(..) => (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout"),
            TunnelError::Disconnected(_) => (StatusCode::BAD_GATEWAY, "Bad gateway"),
            TunnelError::Frame(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        }
    }
}
