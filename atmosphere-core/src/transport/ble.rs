//! BLE transport driver (§4.C "BLE").
//!
//! BLE GATT access itself lives on the host side — no portable Rust BLE
//! stack is assumed — so this module only carries the constants and the
//! datagram-oriented framing policy the host adapter must follow (§9
//! "host/platform split"). The adapter calls `poll_outbound`/`feed_inbound`
//! on the multiplexer directly; everything here informs how it should chunk
//! and interpret bytes.

/// Fixed service UUID the driver advertises (§4.C). A 128-bit UUID, chosen
/// once and compiled in; hosts must not vary it per mesh.
pub const SERVICE_UUID: &str = "b7e1a6b0-0001-4000-8000-00a7a7a7a7a7";

/// `MTU - FragmentHeader::LEN` payload slice size is the driver's
/// responsibility per link; this is the default assumed when a host reports
/// no explicit MTU.
pub const DEFAULT_MTU: usize = 185;
pub const FRAGMENT_HEADER_OVERHEAD: usize = crate::codec::FragmentHeader::LEN;

pub fn max_slice_payload(mtu: usize) -> usize {
    mtu.saturating_sub(FRAGMENT_HEADER_OVERHEAD).max(1)
}

/// Keepalive cadence (§4.C, §5): ping every 20s, drop after 3 missed (60s).
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);
pub const KEEPALIVE_MISSES_BEFORE_DROP: u32 = 3;

/// Characteristic roles exposed by the GATT service (§4.C, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    /// Written by the central, read by the peripheral.
    Tx,
    /// Notified by the peripheral, observed by the central.
    Rx,
    /// Read by the central to learn the remote `peer_id` before the link is
    /// considered identified (§4.C: "discovery that yields only a device
    /// address MUST be resolved to a peer_id via the peer-info read").
    PeerInfo,
}
