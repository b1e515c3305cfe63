//! Reverse tunnel broker
//!
//! Remote agents hold outbound network paths and connect in over WebSocket.
//! Each becomes a proxy in the inventory; HTTP requests addressed to an agent
//! id are forwarded through that agent and its answer is returned verbatim.

pub mod broker;
pub mod connection;
pub mod error;
pub mod registry;

pub use broker::{BrokerConfig, TunnelBroker};
pub use connection::AgentConnection;
pub use error::TunnelError;
pub use registry::TunnelRegistry;
