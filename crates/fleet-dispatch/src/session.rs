//! A session bundles one account, one proxy and the upstream auth state

use fleet_proto::{Account, Location, MapPayload, Proxy};
use tracing::info;

use crate::upstream::{UpstreamClient, UpstreamError};

/// Unit checked in and out of the [`crate::SessionPool`].
///
/// At any moment a session is either buffered in the pool or owned by exactly
/// one caller; moving it by value enforces that.
pub struct Session {
    account: Account,
    proxy: Proxy,
    force_login: bool,
    upstream: Box<dyn UpstreamClient>,
}

impl Session {
    pub fn new(account: Account, proxy: Proxy, upstream: Box<dyn UpstreamClient>) -> Self {
        Self {
            account,
            proxy,
            force_login: false,
            upstream,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn account_mut(&mut self) -> &mut Account {
        &mut self.account
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut Proxy {
        &mut self.proxy
    }

    pub fn username(&self) -> &str {
        &self.account.username
    }

    /// Bind a different proxy; the next login and calls go through it
    pub fn set_proxy(&mut self, proxy: Proxy) {
        info!(
            account = %self.account.username,
            old_proxy_id = self.proxy.id,
            proxy_id = proxy.id,
            "Using new proxy for session"
        );
        self.proxy = proxy;
    }

    /// Discard the current auth ticket on the next login
    pub fn force_login(&mut self) {
        self.force_login = true;
    }

    pub fn is_logged_in(&self) -> bool {
        !self.force_login && self.upstream.is_logged_in()
    }

    /// True once the account or proxy can no longer be used
    pub fn is_evictable(&self) -> bool {
        self.account.is_unusable() || self.proxy.dead
    }

    pub fn move_to(&mut self, location: Location) {
        self.upstream.move_to(location);
    }

    pub async fn login(&mut self) -> Result<(), UpstreamError> {
        let force = std::mem::take(&mut self.force_login);
        self.upstream
            .login(&self.account, self.proxy.id, force)
            .await
    }

    pub async fn get_player_map(&mut self) -> Result<MapPayload, UpstreamError> {
        self.upstream.get_player_map(self.proxy.id).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account.username)
            .field("proxy_id", &self.proxy.id)
            .field("force_login", &self.force_login)
            .finish()
    }
}
