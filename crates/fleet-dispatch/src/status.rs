//! Live view of which account uses which proxy, plus scan counters

use dashmap::DashMap;
use fleet_proto::StatusEntry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Account username -> proxy binding for every live session
#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: DashMap<String, StatusEntry>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or update) the proxy an account is bound to
    pub fn set(&self, account_name: &str, proxy_id: u64) {
        self.entries.insert(
            account_name.to_string(),
            StatusEntry {
                account_name: account_name.to_string(),
                proxy_id,
            },
        );
    }

    pub fn remove(&self, account_name: &str) -> Option<StatusEntry> {
        self.entries.remove(account_name).map(|(_, entry)| entry)
    }

    pub fn get(&self, account_name: &str) -> Option<StatusEntry> {
        self.entries.get(account_name).map(|e| e.value().clone())
    }

    /// Snapshot sorted by account name
    pub fn entries(&self) -> Vec<StatusEntry> {
        let mut entries: Vec<StatusEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.account_name.cmp(&b.account_name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ScanMetrics {
    scans: AtomicU64,
    failures: AtomicU64,
    busy: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub scans: u64,
    pub failures: u64,
    pub busy: u64,
    pub timeouts: u64,
    pub evictions: u64,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
