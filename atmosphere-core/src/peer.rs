//! Peer and link descriptors (§3).

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::handshake::LinkState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkClass {
    Lan,
    Ble,
    WifiAware,
    Relay,
}

impl LinkClass {
    /// Fixed preference order (§4.D): LAN > Wi-Fi Aware > BLE > Relay.
    pub fn preference_rank(self) -> u8 {
        match self {
            LinkClass::Lan => 0,
            LinkClass::WifiAware => 1,
            LinkClass::Ble => 2,
            LinkClass::Relay => 3,
        }
    }
}

/// Rolling counters per link (§3, SPEC_FULL.md ambient metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkMetrics {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub frames_sent: u64,
    pub frames_recv: u64,
    pub rtt_ewma_ms: f64,
}

impl LinkMetrics {
    const RTT_ALPHA: f64 = 0.2;

    pub fn observe_rtt(&mut self, sample_ms: f64) {
        if self.rtt_ewma_ms == 0.0 {
            self.rtt_ewma_ms = sample_ms;
        } else {
            self.rtt_ewma_ms = Self::RTT_ALPHA * sample_ms + (1.0 - Self::RTT_ALPHA) * self.rtt_ewma_ms;
        }
    }
}

/// `{class, address, state, mtu, last_rx, last_tx, rtt_ewma, auth_state}`
/// (§3). `state`/`auth_state` are collapsed into the handshake's
/// [`LinkState`] here; the descriptor is the read side the multiplexer and
/// host surface consult.
#[derive(Debug, Clone)]
pub struct LinkDescriptor {
    pub link_id: u64,
    pub class: LinkClass,
    pub address: String,
    pub state: LinkState,
    pub mtu: usize,
    pub last_rx: Option<Instant>,
    pub last_tx: Option<Instant>,
    pub metrics: LinkMetrics,
    pub conn_generation: u64,
}

impl LinkDescriptor {
    pub fn touch_rx(&mut self, bytes: usize) {
        self.last_rx = Some(Instant::now());
        self.metrics.bytes_recv += bytes as u64;
        self.metrics.frames_recv += 1;
    }

    pub fn touch_tx(&mut self, bytes: usize) {
        self.last_tx = Some(Instant::now());
        self.metrics.bytes_sent += bytes as u64;
        self.metrics.frames_sent += 1;
    }
}

/// One per known remote peer (§3).
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub name: Option<String>,
    pub app_id: String,
    pub links: HashMap<u64, LinkDescriptor>,
    /// Per-source sequence numbers the remote has acknowledged (§4.F).
    pub acknowledged_vector: HashMap<String, u64>,
    pub first_seen: Instant,
    pub last_activity: Instant,
}

impl PeerDescriptor {
    pub fn new(peer_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            peer_id: peer_id.into(),
            name: None,
            app_id: app_id.into(),
            links: HashMap::new(),
            acknowledged_vector: HashMap::new(),
            first_seen: now,
            last_activity: now,
        }
    }

    /// The currently selected link per §4.D: highest-preference `READY`
    /// link, ties broken by lowest `rtt_ewma`.
    pub fn selected_link(&self) -> Option<&LinkDescriptor> {
        self.links
            .values()
            .filter(|l| l.state == LinkState::Ready)
            .min_by(|a, b| {
                a.class
                    .preference_rank()
                    .cmp(&b.class.preference_rank())
                    .then(
                        a.metrics
                            .rtt_ewma_ms
                            .partial_cmp(&b.metrics.rtt_ewma_ms)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            })
    }

    pub fn has_any_ready_link(&self) -> bool {
        self.links.values().any(|l| l.state == LinkState::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_link(id: u64, class: LinkClass, rtt: f64) -> LinkDescriptor {
        LinkDescriptor {
            link_id: id,
            class,
            address: "addr".into(),
            state: LinkState::Ready,
            mtu: 1024,
            last_rx: None,
            last_tx: None,
            metrics: LinkMetrics { rtt_ewma_ms: rtt, ..Default::default() },
            conn_generation: 0,
        }
    }

    #[test]
    fn selects_lan_over_relay() {
        let mut peer = PeerDescriptor::new("bb", "atmosphere");
        peer.links.insert(1, ready_link(1, LinkClass::Relay, 5.0));
        peer.links.insert(2, ready_link(2, LinkClass::Lan, 50.0));
        assert_eq!(peer.selected_link().unwrap().class, LinkClass::Lan);
    }

    #[test]
    fn ties_within_class_broken_by_rtt() {
        let mut peer = PeerDescriptor::new("bb", "atmosphere");
        peer.links.insert(1, ready_link(1, LinkClass::Lan, 50.0));
        peer.links.insert(2, ready_link(2, LinkClass::Lan, 10.0));
        assert_eq!(peer.selected_link().unwrap().link_id, 2);
    }

    #[test]
    fn non_ready_links_never_selected() {
        let mut peer = PeerDescriptor::new("bb", "atmosphere");
        let mut link = ready_link(1, LinkClass::Lan, 1.0);
        link.state = LinkState::AuthPending;
        peer.links.insert(1, link);
        assert!(peer.selected_link().is_none());
        assert!(!peer.has_any_ready_link());
    }
}
