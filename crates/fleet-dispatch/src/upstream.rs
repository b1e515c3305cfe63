//! Abstraction over the upstream game client
//!
//! The protocol client itself (login handshake, request signing, encoding)
//! lives outside this crate. The dispatcher only needs the three operations
//! below and a closed set of failure conditions to drive its retry logic.

use async_trait::async_trait;
use fleet_proto::{Account, Location, MapPayload};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Failure conditions reported by the upstream client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("proxy is dead")]
    ProxyDead,

    #[error("invalid auth token")]
    InvalidAuthToken,

    #[error("invalid platform request")]
    InvalidPlatformRequest,

    #[error("account is banned")]
    AccountBanned,

    #[error("new RPC URL")]
    NewRpcUrl,

    #[error("challenge required")]
    CheckChallenge,

    #[error("username or password is incorrect")]
    BadCredentials,

    #[error("account is not yet active")]
    AccountNotActive,

    #[error("empty response")]
    EmptyResponse,

    #[error("{0}")]
    Other(String),
}

/// What an upstream failure says about the account that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountHealth {
    Healthy,
    Banned,
    ChallengeRequired,
}

impl UpstreamError {
    pub fn account_health(&self) -> AccountHealth {
        match self {
            UpstreamError::BadCredentials
            | UpstreamError::AccountBanned
            | UpstreamError::EmptyResponse
            | UpstreamError::AccountNotActive => AccountHealth::Banned,
            UpstreamError::CheckChallenge => AccountHealth::ChallengeRequired,
            UpstreamError::ProxyDead
            | UpstreamError::InvalidAuthToken
            | UpstreamError::InvalidPlatformRequest
            | UpstreamError::NewRpcUrl
            | UpstreamError::Other(_) => AccountHealth::Healthy,
        }
    }

    /// Failures that a single repeat of the map call may clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::InvalidPlatformRequest | UpstreamError::NewRpcUrl
        )
    }
}

/// One authenticated upstream session. Owned by exactly one [`crate::Session`].
#[async_trait]
pub trait UpstreamClient: Send {
    /// Whether a valid, unexpired auth ticket is held
    fn is_logged_in(&self) -> bool;

    /// Authenticate `account` through proxy `proxy_id`.
    ///
    /// With `force` set, an existing ticket is discarded first.
    async fn login(
        &mut self,
        account: &Account,
        proxy_id: u64,
        force: bool,
    ) -> Result<(), UpstreamError>;

    /// Set the player position used by the next call. No I/O.
    fn move_to(&mut self, location: Location);

    /// Fetch the map around the current position through proxy `proxy_id`
    async fn get_player_map(&mut self, proxy_id: u64) -> Result<MapPayload, UpstreamError>;
}

/// Creates fresh upstream clients for newly provisioned sessions
pub trait UpstreamFactory: Send + Sync {
    fn create(&self, account: &Account) -> Box<dyn UpstreamClient>;
}

/// Client that is always logged in and answers every call with one canned payload
pub struct StaticUpstream {
    payload: Arc<MapPayload>,
}

#[async_trait]
impl UpstreamClient for StaticUpstream {
    fn is_logged_in(&self) -> bool {
        true
    }

    async fn login(
        &mut self,
        _account: &Account,
        _proxy_id: u64,
        _force: bool,
    ) -> Result<(), UpstreamError> {
        Ok(())
    }

    fn move_to(&mut self, _location: Location) {}

    async fn get_player_map(&mut self, _proxy_id: u64) -> Result<MapPayload, UpstreamError> {
        Ok(self.payload.as_ref().clone())
    }
}

/// Factory for [`StaticUpstream`] clients sharing one payload
#[derive(Clone, Default)]
pub struct StaticUpstreamFactory {
    payload: Arc<MapPayload>,
}

impl StaticUpstreamFactory {
    pub fn new(payload: MapPayload) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// Load the canned payload from a JSON dump
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let payload: MapPayload = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::new(payload))
    }
}

impl UpstreamFactory for StaticUpstreamFactory {
    fn create(&self, _account: &Account) -> Box<dyn UpstreamClient> {
        Box::new(StaticUpstream {
            payload: self.payload.clone(),
        })
    }
}
