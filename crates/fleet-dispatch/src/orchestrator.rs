//! Per-request scan driver
//!
//! A scan acquires a session, logs it in when needed, performs one map call
//! and classifies the outcome. Each failure class gets at most one extra
//! attempt: a proxy swap on `ProxyDead`, a forced re-login on
//! `InvalidAuthToken` and a repeated call on `InvalidPlatformRequest`. Any
//! terminal change to the session's account or proxy evicts the session;
//! everything else goes back to the pool after the cooldown.

use fleet_proto::{Location, MapObject, MapPayload};
use fleet_store::{Inventory, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::parse::parse_map_objects;
use crate::pool::{PoolError, SessionPool};
use crate::provisioner::ResourceProvisioner;
use crate::rate_gate::RateGate;
use crate::session::Session;
use crate::status::{ScanMetrics, StatusBoard};
use crate::upstream::{AccountHealth, UpstreamError};

/// Message for callers when no session could be found or built
pub const BUSY_MESSAGE: &str = "All our minions are busy";
pub const TIMEOUT_MESSAGE: &str = "Scan timed out";
pub const FAILED_MESSAGE: &str = "Scan failed";

/// Terminal failure of one scan request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("no session available and none could be provisioned")]
    Busy,

    #[error("scan deadline exceeded")]
    Timeout,

    #[error("proxy {0} is dead")]
    ProxyDead(u64),

    #[error("auth token rejected after forced login")]
    AuthInvalid,

    #[error("upstream still failing after retry: {0}")]
    TransientUpstream(UpstreamError),

    #[error("account {0} is banned")]
    AccountBanned(String),

    #[error("account {0} requires a challenge")]
    AccountFlagged(String),

    #[error("upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("session pool is shut down")]
    PoolClosed,
}

impl ScanError {
    /// Text safe to hand to an external caller
    pub fn public_message(&self) -> &'static str {
        match self {
            ScanError::Busy => BUSY_MESSAGE,
            ScanError::Timeout => TIMEOUT_MESSAGE,
            _ => FAILED_MESSAGE,
        }
    }
}

/// Tunables for the scan path
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Minimum delay before a returned session can be checked out again
    pub cooldown: Duration,
    /// How long to wait on the pool before provisioning a new session
    pub checkout_timeout: Duration,
    /// Overall deadline of one scan request
    pub request_timeout: Duration,
    /// Spacing between logins across the whole process
    pub login_interval: Duration,
    /// Spacing between map calls across the whole process
    pub call_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(25),
            checkout_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            login_interval: Duration::from_millis(1000),
            call_interval: Duration::from_millis(1),
        }
    }
}

/// Why a single login or call attempt did not produce a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Deadline,
    Upstream(UpstreamError),
}

impl Failure {
    fn is_proxy_dead(&self) -> bool {
        matches!(self, Failure::Upstream(UpstreamError::ProxyDead))
    }
}

/// Drives scans against the shared pool, gates and inventory
pub struct CallOrchestrator {
    config: DispatchConfig,
    pool: SessionPool,
    provisioner: ResourceProvisioner,
    objects: Arc<dyn ObjectStore>,
    login_gate: RateGate,
    call_gate: RateGate,
    status: Arc<StatusBoard>,
    metrics: Arc<ScanMetrics>,
}

impl CallOrchestrator {
    /// Must be called from within a tokio runtime (the rate gates start ticking).
    pub fn new(
        config: DispatchConfig,
        pool: SessionPool,
        provisioner: ResourceProvisioner,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let login_gate = RateGate::new("login", config.login_interval);
        let call_gate = RateGate::new("call", config.call_interval);

        Self {
            config,
            pool,
            provisioner,
            objects,
            login_gate,
            call_gate,
            status: Arc::new(StatusBoard::new()),
            metrics: Arc::new(ScanMetrics::new()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn provisioner(&self) -> &ResourceProvisioner {
        &self.provisioner
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    pub fn metrics(&self) -> &Arc<ScanMetrics> {
        &self.metrics
    }

    fn inventory(&self) -> &Arc<dyn Inventory> {
        self.provisioner.inventory()
    }

    /// Scan the map around `location`
    pub async fn scan(&self, location: Location) -> Result<Vec<MapObject>, ScanError> {
        let deadline = Instant::now() + self.config.request_timeout;
        self.metrics.record_scan();

        let result = self.scan_until(location, deadline).await;

        match &result {
            Ok(objects) => debug!(objects = objects.len(), "Scan succeeded"),
            Err(ScanError::Busy) => self.metrics.record_busy(),
            Err(ScanError::Timeout) => {
                self.metrics.record_timeout();
                self.metrics.record_failure();
            }
            Err(e) => {
                debug!(error = %e, "Scan failed");
                self.metrics.record_failure();
            }
        }
        result
    }

    async fn scan_until(
        &self,
        location: Location,
        deadline: Instant,
    ) -> Result<Vec<MapObject>, ScanError> {
        let mut session = self.acquire().await?;
        session.move_to(location);

        let result = self
            .run(&mut session, deadline)
            .await
            .map(|payload| parse_map_objects(&payload));

        if let Ok(objects) = &result {
            if !objects.is_empty() {
                if let Err(e) = self.objects.add_map_objects(objects).await {
                    warn!(error = %e, "Failed to store map objects");
                }
            }
        }

        self.refresh_proxy(&mut session).await;
        if session.is_evictable() {
            self.evict(session).await;
        } else {
            self.pool.check_in(session, self.config.cooldown);
        }

        result
    }

    /// Check a session out of the pool, provisioning one if the pool stays empty
    async fn acquire(&self) -> Result<Session, ScanError> {
        match self.pool.checkout(self.config.checkout_timeout).await {
            Ok(mut session) => {
                let dead = self.refresh_proxy(&mut session).await;
                if dead && !self.swap_proxy(&mut session).await {
                    self.evict(session).await;
                    return Err(ScanError::Busy);
                }
                Ok(session)
            }
            Err(PoolError::Closed) => Err(ScanError::PoolClosed),
            Err(PoolError::Timeout(_)) => match self.provisioner.provision().await {
                Ok(session) => {
                    self.status.set(session.username(), session.proxy().id);
                    Ok(session)
                }
                Err(e) => {
                    info!(error = %e, "Cannot provision a session");
                    Err(ScanError::Busy)
                }
            },
        }
    }

    /// The retry and classification state machine around one scan
    async fn run(&self, session: &mut Session, deadline: Instant) -> Result<MapPayload, ScanError> {
        let mut result = self.attempt(session, deadline).await;

        if result.as_ref().is_err_and(Failure::is_proxy_dead) {
            if Instant::now() >= deadline {
                self.mark_proxy_dead(session).await;
                return Err(ScanError::Timeout);
            }
            if !self.swap_proxy(session).await {
                return Err(ScanError::Busy);
            }
            result = self.attempt(session, deadline).await;
            if result.as_ref().is_err_and(Failure::is_proxy_dead) {
                self.mark_proxy_dead(session).await;
            }
        }

        if let Err(Failure::Upstream(e)) = &result {
            self.classify_account(session, e).await;
        }

        if matches!(
            result,
            Err(Failure::Upstream(UpstreamError::InvalidPlatformRequest))
        ) && Instant::now() < deadline
        {
            debug!(account = %session.username(), "Retrying map call after invalid platform request");
            result = self.call(session, deadline).await;

            if let Err(Failure::Upstream(e)) = &result {
                if *e == UpstreamError::ProxyDead {
                    self.mark_proxy_dead(session).await;
                }
                self.classify_account(session, e).await;
            }
        }

        match result {
            Ok(payload) => Ok(payload),
            Err(_) if Instant::now() >= deadline => Err(ScanError::Timeout),
            Err(Failure::Deadline) => Err(ScanError::Timeout),
            Err(Failure::Upstream(e)) => Err(self.scan_error(session, e)),
        }
    }

    /// Login if needed, then one map call
    async fn attempt(&self, session: &mut Session, deadline: Instant) -> Result<MapPayload, Failure> {
        if !session.is_logged_in() {
            self.login(session, deadline).await?;
        }
        self.call(session, deadline).await
    }

    /// Log a session in through the login gate, forcing one re-login on a
    /// rejected auth token
    pub(crate) async fn login(&self, session: &mut Session, deadline: Instant) -> Result<(), Failure> {
        if !self.login_gate.acquire_until(deadline).await {
            return Err(Failure::Deadline);
        }

        let result = match timeout_at(deadline, session.login()).await {
            Err(_) => return Err(Failure::Deadline),
            Ok(Err(UpstreamError::InvalidAuthToken)) => {
                debug!(account = %session.username(), "Auth token rejected, forcing login");
                session.force_login();
                if !self.login_gate.acquire_until(deadline).await {
                    return Err(Failure::Deadline);
                }
                timeout_at(deadline, session.login())
                    .await
                    .map_err(|_| Failure::Deadline)?
            }
            Ok(result) => result,
        };

        result.map_err(|e| {
            if e != UpstreamError::ProxyDead {
                warn!(account = %session.username(), error = %e, "Login failed");
            }
            Failure::Upstream(e)
        })
    }

    async fn call(&self, session: &mut Session, deadline: Instant) -> Result<MapPayload, Failure> {
        if !self.call_gate.acquire_until(deadline).await {
            return Err(Failure::Deadline);
        }

        match timeout_at(deadline, session.get_player_map()).await {
            Err(_) => Err(Failure::Deadline),
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(UpstreamError::NewRpcUrl)) => {
                debug!(account = %session.username(), "Upstream switched RPC URL");
                Ok(MapPayload::default())
            }
            Ok(Err(e)) => {
                if e != UpstreamError::ProxyDead {
                    warn!(account = %session.username(), error = %e, "Map call failed");
                }
                Err(Failure::Upstream(e))
            }
        }
    }

    /// Mark the current proxy dead and bind a fresh one. Returns false when the
    /// inventory has no live proxy left.
    pub(crate) async fn swap_proxy(&self, session: &mut Session) -> bool {
        self.mark_proxy_dead(session).await;

        match self.inventory().get_proxy().await {
            Ok(proxy) => {
                session.set_proxy(proxy);
                self.status.set(session.username(), proxy.id);
                true
            }
            Err(e) => {
                warn!(account = %session.username(), error = %e, "No proxies available");
                false
            }
        }
    }

    /// Pick up a proxy death recorded elsewhere (the broker marks the proxy
    /// of a disconnected agent). Returns true if the session's proxy is dead.
    async fn refresh_proxy(&self, session: &mut Session) -> bool {
        if session.proxy().dead {
            return true;
        }
        let id = session.proxy().id;
        match self.inventory().is_proxy_dead(id).await {
            Ok(true) => {
                info!(account = %session.username(), proxy_id = id, "Proxy died while pooled");
                let proxy = session.proxy_mut();
                proxy.dead = true;
                proxy.in_use = false;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(proxy_id = id, error = %e, "Failed to read proxy record");
                false
            }
        }
    }

    async fn mark_proxy_dead(&self, session: &mut Session) {
        let proxy = session.proxy_mut();
        proxy.dead = true;
        proxy.in_use = false;
        let proxy = *proxy;

        warn!(account = %session.username(), proxy_id = proxy.id, "Proxy is dead");
        if let Err(e) = self.inventory().update_proxy(&proxy).await {
            warn!(proxy_id = proxy.id, error = %e, "Failed to persist dead proxy");
        }
    }

    pub(crate) async fn classify_account(&self, session: &mut Session, error: &UpstreamError) {
        match error.account_health() {
            AccountHealth::Healthy => return,
            AccountHealth::Banned => {
                warn!(account = %session.username(), error = %error, "Account banned");
                session.account_mut().banned = true;
            }
            AccountHealth::ChallengeRequired => {
                warn!(account = %session.username(), "Account flagged for challenge");
                session.account_mut().captcha_flagged = true;
            }
        }

        if let Err(e) = self.inventory().update_account(session.account()).await {
            warn!(account = %session.username(), error = %e, "Failed to persist account flags");
        }
        self.status.remove(session.username());
    }

    fn scan_error(&self, session: &mut Session, error: UpstreamError) -> ScanError {
        match error.account_health() {
            AccountHealth::Banned => return ScanError::AccountBanned(session.username().to_string()),
            AccountHealth::ChallengeRequired => {
                return ScanError::AccountFlagged(session.username().to_string())
            }
            AccountHealth::Healthy => {}
        }

        match error {
            UpstreamError::ProxyDead => ScanError::ProxyDead(session.proxy().id),
            UpstreamError::InvalidAuthToken => {
                session.force_login();
                ScanError::AuthInvalid
            }
            e if e.is_transient() => ScanError::TransientUpstream(e),
            e => ScanError::Upstream(e),
        }
    }

    /// Permanently drop a session, releasing whatever part of it is still usable
    pub async fn evict(&self, session: Session) {
        let account = session.account();
        let proxy = session.proxy();

        info!(
            account = %account.username,
            proxy_id = proxy.id,
            banned = account.banned,
            flagged = account.captcha_flagged,
            proxy_dead = proxy.dead,
            "Evicting session"
        );
        self.status.remove(&account.username);
        self.metrics.record_eviction();

        if !account.is_unusable() {
            if let Err(e) = self.inventory().return_account(account).await {
                warn!(account = %account.username, error = %e, "Failed to return account");
            }
        }
        if !proxy.dead {
            if let Err(e) = self.inventory().return_proxy(proxy).await {
                warn!(proxy_id = proxy.id, error = %e, "Failed to return proxy");
            }
        }
    }
}
