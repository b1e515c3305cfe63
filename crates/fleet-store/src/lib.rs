//! Backing inventory for accounts, proxies and observed map objects
//!
//! The dispatcher and the tunnel broker only ever talk to the [`Inventory`]
//! and [`ObjectStore`] traits. Each call is a single round trip; callers treat
//! any failure as "resource unavailable" and never retry inside the store.
//!
//! The in-memory implementations keep everything in process and are lost on
//! restart.

pub mod inventory;
pub mod objects;

pub use inventory::{InMemoryInventory, Inventory, InventoryError, SweepReport};
pub use objects::{InMemoryObjectStore, ObjectStore};
