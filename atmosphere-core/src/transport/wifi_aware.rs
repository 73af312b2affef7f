//! Wi-Fi Aware transport driver (§4.C "Wi-Fi Aware").
//!
//! Like BLE, the native publish/subscribe/`sendMessage` surface is
//! host-platform-only; this module is the shared constant/framing policy
//! the host adapter follows when bridging into `poll_outbound`/
//! `feed_inbound` (§9).

/// Fixed service name advertised via publish/subscribe (§6).
pub const SERVICE_NAME: &str = "atmosphere-mesh";

/// `sendMessage` hard cap (§4.C): 255 bytes, so every message is carried as
/// datagram fragments.
pub const MAX_MESSAGE_LEN: usize = 255;
pub const FRAGMENT_HEADER_OVERHEAD: usize = crate::codec::FragmentHeader::LEN;

pub fn max_slice_payload() -> usize {
    MAX_MESSAGE_LEN.saturating_sub(FRAGMENT_HEADER_OVERHEAD)
}

/// Target adapter poll backoff when `poll_outbound` returns `None` (§4.D).
pub const POLL_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);
