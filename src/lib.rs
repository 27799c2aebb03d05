//! snx-connect - Session manager for the Checkpoint SNX VPN client
//!
//! This crate drives the interactive SNX command-line client through its
//! authentication dialogue, tracks the tunnel-local (office-mode) IP it
//! reports, and keeps per-destination routing table entries consistent with
//! the persisted state across connect/disconnect cycles and crashes.
//!
//! # Architecture
//!
//! - `store`: persisted JSON state (credentials, office-mode IP, route table)
//! - `resolver`: domain -> IPv4 resolution via the system lookup tool
//! - `elevate`: batched privileged command execution (pkexec)
//! - `session`: expect-style driver for the SNX authentication dialogue
//! - `routes`: reconciliation between saved routes and the routing table
//! - `deps`: dependency checks and client installation
//! - `manager`: the facade tying the lifecycle together
//! - `service`: background worker with a command/event channel for embedders

pub mod deps;
pub mod elevate;
pub mod error;
pub mod manager;
pub mod resolver;
pub mod routes;
pub mod service;
pub mod session;
pub mod store;

pub use error::VpnError;
pub use manager::VpnManager;
pub use service::{VpnCommand, VpnEvent, VpnService};
pub use store::{PersistedState, RouteEntry, SessionStore};
