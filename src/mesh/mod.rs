/**
 * mesh/mod.rs
 *
 * Encrypted mesh link between two peers
 */

pub mod crypto;
pub mod frame;
pub mod link;
pub mod replay;
pub mod session;

pub use crypto::{FrameCipher, KdfParams, KeyError, NetworkKey};
pub use frame::{FrameError, FrameType, Hello, FRAME_OVERHEAD};
pub use link::{Datagram, PunchedSocket};
pub use replay::{ReplayError, ReplayWindow};
pub use session::{
    CloseReason, MeshSession, SessionConfig, SessionCore, SessionError, SessionState, SessionStats,
    SessionStatus,
};
