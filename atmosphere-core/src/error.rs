//! Error kinds per the core's propagation policy.
//!
//! Transient link, protocol, and auth errors never reach the host directly —
//! they are folded into peer/link state and observed through `health`/`peers`.
//! Only `Local` and `Fatal` are returned from the public surface's fallible
//! entry points.

use thiserror::Error;

/// Errors that can be returned to the host through `init`/`insert`/etc.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("local store failure: {0}")]
    Local(#[from] StoreError),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("unknown handle")]
    UnknownHandle,

    #[error("mesh not started")]
    NotStarted,
}

/// Internal classification used by link/peer bookkeeping (§7). Not returned
/// to the host; recorded on the link/peer descriptor and surfaced only
/// through `health` diagnostics.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("auth failure: {0}")]
    Auth(String),
}

impl LinkError {
    /// Whether this class of failure earns the 30s redial penalty (§7).
    pub fn penalises_redial(&self) -> bool {
        matches!(self, LinkError::Protocol(_))
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length ({0} > 16 MiB)")]
    OversizeFrame(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("bad beacon magic")]
    BadMagic,

    #[error("unknown keepalive kind")]
    UnknownKeepalive,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log append failed: {0}")]
    LogWrite(String),

    #[error("projection index failure: {0}")]
    Index(String),

    #[error("log corrupted: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("wrong app_id")]
    WrongApp,

    #[error("mesh_id mismatch")]
    WrongMesh,

    #[error("hmac verification failed")]
    AuthFail,

    #[error("handshake timed out")]
    Timeout,
}
