//! Grows the live session population from the backing inventory

use fleet_store::{Inventory, InventoryError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::upstream::UpstreamFactory;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("No account available: {0}")]
    NoAccount(#[source] InventoryError),

    #[error("No proxy available: {0}")]
    NoProxy(#[source] InventoryError),
}

/// Builds new sessions out of one unused account and one live proxy
#[derive(Clone)]
pub struct ResourceProvisioner {
    inventory: Arc<dyn Inventory>,
    factory: Arc<dyn UpstreamFactory>,
}

impl ResourceProvisioner {
    pub fn new(inventory: Arc<dyn Inventory>, factory: Arc<dyn UpstreamFactory>) -> Self {
        Self { inventory, factory }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    /// Claim an account, then a proxy, and bundle them into a session.
    ///
    /// The account is released again when no proxy can be claimed.
    pub async fn provision(&self) -> Result<Session, ProvisionError> {
        let account = self.inventory.get_account().await.map_err(|e| {
            debug!(error = %e, "Provisioning failed: no account");
            ProvisionError::NoAccount(e)
        })?;

        let proxy = match self.inventory.get_proxy().await {
            Ok(proxy) => proxy,
            Err(e) => {
                debug!(account = %account.username, error = %e, "Provisioning failed: no proxy");
                if let Err(release_err) = self.inventory.return_account(&account).await {
                    warn!(
                        account = %account.username,
                        error = %release_err,
                        "Failed to release account after provisioning failure"
                    );
                }
                return Err(ProvisionError::NoProxy(e));
            }
        };

        info!(
            account = %account.username,
            proxy_id = proxy.id,
            "Provisioned new session"
        );

        let upstream = self.factory.create(&account);
        Ok(Session::new(account, proxy, upstream))
    }
}
