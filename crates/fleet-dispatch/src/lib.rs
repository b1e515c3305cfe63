//! Session dispatch for the scanner
//!
//! Sessions (one account, one proxy, one upstream login) live in a
//! [`SessionPool`]. A scan checks one out, or has the [`ResourceProvisioner`]
//! build a new one when the pool stays empty, and the [`CallOrchestrator`]
//! drives login and map calls through the process-wide [`RateGate`]s before
//! returning or evicting the session.

pub mod http;
pub mod orchestrator;
pub mod parse;
pub mod pool;
pub mod preload;
pub mod provisioner;
pub mod rate_gate;
pub mod session;
pub mod status;
pub mod upstream;

pub use http::{ScannerConfig, ScannerServer, StatusResponse};
pub use orchestrator::{CallOrchestrator, DispatchConfig, ScanError};
pub use parse::parse_map_objects;
pub use pool::{PoolError, SessionPool};
pub use preload::preload_sessions;
pub use provisioner::{ProvisionError, ResourceProvisioner};
pub use rate_gate::RateGate;
pub use session::Session;
pub use status::{MetricsSnapshot, ScanMetrics, StatusBoard};
pub use upstream::{
    AccountHealth, StaticUpstream, StaticUpstreamFactory, UpstreamClient, UpstreamError,
    UpstreamFactory,
};
