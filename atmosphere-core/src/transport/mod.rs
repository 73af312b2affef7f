//! Transport drivers (§4.C).
//!
//! Each driver exposes the same shape to the multiplexer: `discover`,
//! `dial`, `listen`, `send`, `close`. There is no inheritance tree, only a
//! small closed set of variants keyed by [`crate::peer::LinkClass`] (§9
//! "dynamic dispatch across transports").

pub mod ble;
pub mod lan;
pub mod relay;
pub mod wifi_aware;

use crate::peer::LinkClass;

/// A hint that a peer may be reachable, prior to handshake (§4.C).
#[derive(Debug, Clone)]
pub struct PeerHint {
    pub class: LinkClass,
    pub address: String,
    pub advertised_peer_id: Option<String>,
}
