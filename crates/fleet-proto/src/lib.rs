//! Fleet protocol definitions
//!
//! Plain data shared by the dispatcher, the tunnel broker and the agents:
//! inventory records, map objects, the scanner response envelope and the
//! JSON frames exchanged with tunnel agents.

pub mod inventory;
pub mod map;
pub mod messages;

pub use inventory::{Account, Proxy, StatusEntry};
pub use map::{
    Fort, FortKind, Location, LureInfo, MapCell, MapObject, MapPayload, ObjectKind, ScanResponse,
    WildPokemon,
};
pub use messages::{AgentReply, FrameError, TunnelRequest};

/// Header carrying the numeric id of the agent a request must leave through
pub const PROXY_ID_HEADER: &str = "Proxy-Id";

/// Header carrying the final upstream URL the agent should call
pub const FINAL_HOST_HEADER: &str = "Final-Host";
