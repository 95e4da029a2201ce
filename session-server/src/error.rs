//! Error kinds of the server core. Decode failures bubble up from the
//! protocol crate; everything else is classified here so the policy layer
//! (drop, record, disconnect, destroy) can match on the kind.

use protocol::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// A peer sent bytes the codec rejects. Logged and counted; repeated
    /// offenses disconnect the peer.
    #[error("malformed packet: {0}")]
    Malformed(#[from] DecodeError),

    /// An RPC failed ownership or role checks.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// A stale net id or unknown player. Legitimate race with despawn,
    /// never a disconnect on its own.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// The anti-cheat suppressed an action.
    #[error("policy violation: {0}")]
    PolicyViolation(&'static str),

    /// Transport gave up on a peer.
    #[error("peer timed out")]
    Timeout,

    /// Invariant breach. The room is destroyed, the worker survives.
    #[error("fatal room error: {0}")]
    Fatal(String),
}
