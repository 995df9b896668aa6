#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod mesh;
pub mod nat_traversal;
pub mod tunnel;

pub use config::MeshConfig;
pub use mesh::{MeshSession, NetworkKey, SessionConfig};
pub use nat_traversal::{Connection, ConnectError, NatTraversal, NatTraversalConfig};
pub use tunnel::{TunnelBridge, TunnelConfig};
