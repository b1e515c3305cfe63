//! Startup warm-up of the session pool

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::orchestrator::{CallOrchestrator, Failure};
use crate::upstream::UpstreamError;

/// Login deadline for each preloaded session
pub const PRELOAD_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Provision up to `count` sessions, log each in and queue it in the pool.
///
/// Logins go through the shared login gate, so preloading competes fairly with
/// live scans. A session whose login fails for a reason unrelated to its
/// account is still queued and logs in again on first use. Returns the number
/// of sessions queued.
pub async fn preload_sessions(orchestrator: &CallOrchestrator, count: usize) -> usize {
    let mut queued = 0;

    for _ in 0..count {
        let mut session = match orchestrator.provisioner().provision().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, queued, "Stopping preload, inventory exhausted");
                break;
            }
        };
        orchestrator
            .status()
            .set(session.username(), session.proxy().id);

        info!(account = %session.username(), proxy_id = session.proxy().id, "Logging in");
        let mut result = orchestrator
            .login(&mut session, Instant::now() + PRELOAD_LOGIN_TIMEOUT)
            .await;

        if result == Err(Failure::Upstream(UpstreamError::ProxyDead))
            && orchestrator.swap_proxy(&mut session).await
        {
            result = orchestrator
                .login(&mut session, Instant::now() + PRELOAD_LOGIN_TIMEOUT)
                .await;
        }

        match result {
            Ok(()) => {}
            Err(Failure::Deadline) => {
                warn!(account = %session.username(), "Login timed out during preload");
            }
            Err(Failure::Upstream(e)) => {
                orchestrator.classify_account(&mut session, &e).await;
            }
        }

        if session.is_evictable() {
            orchestrator.evict(session).await;
            continue;
        }
        orchestrator.pool().add_new(session);
        queued += 1;
    }

    info!(queued, requested = count, "Preload finished");
    queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{quick_config, Harness, Op};

    #[tokio::test]
    async fn test_preload_logs_in_and_queues_sessions() {
        let h = Harness::new(quick_config(), &["a", "b", "c"], &[1, 2, 3]).await;

        let queued = preload_sessions(&h.orchestrator, 2).await;

        assert_eq!(queued, 2);
        assert_eq!(h.orchestrator.pool().usernames().await, vec!["a", "b"]);
        let logins = h
            .calls()
            .iter()
            .filter(|c| matches!(c.op, Op::Login { .. }))
            .count();
        assert_eq!(logins, 2);
        assert_eq!(h.orchestrator.status().len(), 2);
        assert!(!h.inventory.account("c").await.unwrap().used);
    }

    #[tokio::test]
    async fn test_preload_stops_when_inventory_runs_out() {
        let h = Harness::new(quick_config(), &["a", "b"], &[1]).await;

        let queued = preload_sessions(&h.orchestrator, 5).await;

        assert_eq!(queued, 1);
        assert!(!h.inventory.account("b").await.unwrap().used);
    }
}
