//! Frames exchanged between the tunnel broker and its agents
//!
//! The broker sends one [`TunnelRequest`] per forwarded HTTP call as a JSON
//! text frame. The agent answers with one [`AgentReply`], which the broker
//! hands back to the caller verbatim.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A request the agent should perform on behalf of the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// HTTP method
    pub meth: String,
    /// Final URL to call
    pub host: String,
    /// Content-Type header, empty if absent
    pub cont: String,
    /// User-Agent header, empty if absent
    pub user: String,
    /// Base64 encoded request body
    pub data: String,
}

impl TunnelRequest {
    pub fn new(
        method: impl Into<String>,
        host: impl Into<String>,
        content_type: impl Into<String>,
        user_agent: impl Into<String>,
        body: &[u8],
    ) -> Self {
        Self {
            meth: method.into(),
            host: host.into(),
            cont: content_type.into(),
            user: user_agent.into(),
            data: STANDARD.encode(body),
        }
    }

    pub fn body(&self) -> Result<Vec<u8>, FrameError> {
        Ok(STANDARD.decode(&self.data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The agent's answer to a [`TunnelRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    pub status: u16,
    /// Base64 encoded response body
    pub response: String,
    /// Location header of redirects, empty otherwise
    #[serde(default)]
    pub location: String,
}

impl AgentReply {
    pub fn new(status: u16, body: &[u8], location: impl Into<String>) -> Self {
        Self {
            status,
            response: STANDARD.encode(body),
            location: location.into(),
        }
    }

    pub fn body(&self) -> Result<Vec<u8>, FrameError> {
        Ok(STANDARD.decode(&self.response)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
