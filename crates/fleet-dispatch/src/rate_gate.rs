//! Process-wide throttle for one class of upstream operation
//!
//! A gate hands out one token per interval, in arrival order, no matter how
//! many sessions are competing for it. Login and map calls each get their own
//! gate so a burst of logins never eats into the call budget.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Interval ticker shared by every caller of one operation class
#[derive(Clone)]
pub struct RateGate {
    name: &'static str,
    period: Duration,
    ticker: Option<Arc<Mutex<Interval>>>,
}

impl RateGate {
    /// Create a gate granting one token per `period`.
    ///
    /// A zero period disables throttling.
    pub fn new(name: &'static str, period: Duration) -> Self {
        let ticker = if period.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval(period);
            // After an idle stretch grant one token right away, then resume spacing
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(Arc::new(Mutex::new(interval)))
        };

        Self {
            name,
            period,
            ticker,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next token.
    ///
    /// Cancel safe: dropping the future before it resolves consumes nothing.
    pub async fn acquire(&self) {
        if let Some(ticker) = &self.ticker {
            // tokio's Mutex queues waiters fairly, which gives arrival order
            ticker.lock().await.tick().await;
        }
    }

    /// Wait for the next token, giving up at `deadline`
    pub async fn acquire_until(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.acquire()).await.is_ok()
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish()
    }
}
