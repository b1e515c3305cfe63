//! Tunnel agent
//!
//! Runs on a host with its own network path. The agent dials the broker over
//! WebSocket, performs every forwarded request it receives and sends back the
//! upstream's answer.

pub mod agent;
pub mod error;
pub mod executor;

pub use agent::{next_delay, Agent, AgentConfig};
pub use error::AgentError;
pub use executor::RequestExecutor;
