//! Transport multiplexer (§4.D).
//!
//! Holds at most one active link per `(peer_id, class)` and exactly one
//! *selected* link per peer — the highest-preference `READY` link, ties
//! broken by lowest `rtt_ewma` (§4.D, (I5)). Exposes a per-peer outbound
//! queue for host-driven adapters (BLE, Wi-Fi Aware) via
//! `poll_outbound`/`feed_inbound` (§4.H). Grounded on the teacher's
//! `s2s.rs::S2sManager` — its `conn_gen` generation counter is the direct
//! model for this module's tie-break-safe link removal, and
//! `handle_s2s_connection`'s deterministic peer-id comparison is the model
//! for `resolve_tie_break` below.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::handshake::{CloseReason, Handshake, LinkState};
use crate::peer::{LinkClass, LinkDescriptor, LinkMetrics, PeerDescriptor};

/// Bound on the per-peer outbound queue handed to host adapters (§5:
/// "bounded MPSC channel... overflow causes the sender to yield").
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Keepalive misses before a link is declared dead (§5, §4.C: "drop after 3
/// missed").
const KEEPALIVE_MISSES_BEFORE_TIMEOUT: u32 = 3;

/// Redial penalty window after a protocol-violation close (§7).
pub const REDIAL_PENALTY: Duration = Duration::from_secs(30);

/// Which side initiated this link, needed by the (I5) tie-break to decide
/// whose outgoing link a peer_id comparison keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

pub struct ActiveLink {
    pub handshake: Handshake,
    pub peer_id: Option<String>,
    pub class: LinkClass,
    pub conn_generation: u64,
    pub address: String,
    pub direction: LinkDirection,
    /// Sender side used to push bytes out over this specific link, when the
    /// link is driven by a core-owned task (LAN, relay) rather than a host
    /// adapter poll loop.
    pub sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Set when a keepalive ping has been sent and no pong has answered it
    /// yet; cleared on pong receipt, used both to measure RTT and to count
    /// consecutive misses.
    last_ping_sent: Option<Instant>,
    ping_misses: u32,
}

/// Outcome of a keepalive tick for one peer's selected link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveTick {
    /// Send a ping now.
    Send,
    /// The link missed 3 consecutive pongs and has been closed.
    TimedOut,
    /// No selected link for this peer.
    NoLink,
}

pub struct Multiplexer {
    local_peer_id: String,
    local_app_id: String,
    peers: DashMap<String, Mutex<PeerDescriptor>>,
    links: DashMap<u64, Mutex<ActiveLink>>,
    next_link_id: AtomicU64,
    conn_generation: AtomicU64,
    /// Host-adapter outbound queues, keyed by peer_id, for link classes
    /// that cannot be driven from a portable transport task (§4.D).
    adapter_outbound: DashMap<String, Mutex<VecDeque<Vec<u8>>>>,
    /// Addresses currently serving a post-protocol-violation redial penalty
    /// (§7), keyed by the dial address.
    redial_penalty: DashMap<String, Instant>,
}

impl Multiplexer {
    pub fn new(local_peer_id: impl Into<String>, local_app_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            local_app_id: local_app_id.into(),
            peers: DashMap::new(),
            links: DashMap::new(),
            next_link_id: AtomicU64::new(1),
            conn_generation: AtomicU64::new(0),
            adapter_outbound: DashMap::new(),
            redial_penalty: DashMap::new(),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn local_app_id(&self) -> &str {
        &self.local_app_id
    }

    fn ensure_peer(&self, peer_id: &str, app_id: &str) {
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Mutex::new(PeerDescriptor::new(peer_id, app_id)));
    }

    /// Register a newly dialed or accepted transport-level connection. The
    /// handshake begins at `DIALING`; the caller drives it forward as hello
    /// messages arrive. Returns the new link's id.
    pub fn open_link(&self, class: LinkClass, address: String, mtu: usize, direction: LinkDirection) -> u64 {
        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.conn_generation.fetch_add(1, Ordering::SeqCst);
        self.links.insert(
            link_id,
            Mutex::new(ActiveLink {
                handshake: Handshake::new(),
                peer_id: None,
                class,
                conn_generation: generation,
                address,
                direction,
                sender: None,
                last_ping_sent: None,
                ping_misses: 0,
            }),
        );
        let _ = mtu; // recorded on the peer's LinkDescriptor once identified
        link_id
    }

    /// The transport class of an open (possibly not-yet-identified) link.
    pub fn link_class(&self, link_id: u64) -> Option<LinkClass> {
        self.links.get(&link_id).map(|l| l.lock().class)
    }

    pub fn attach_sender(&self, link_id: u64, sender: mpsc::UnboundedSender<Vec<u8>>) {
        if let Some(link) = self.links.get(&link_id) {
            link.lock().sender = Some(sender);
        }
    }

    pub fn with_handshake<R>(&self, link_id: u64, f: impl FnOnce(&mut Handshake) -> R) -> Option<R> {
        self.links.get(&link_id).map(|link| f(&mut link.lock().handshake))
    }

    /// Called once a link's handshake has identified the remote peer (§4.E
    /// transition 1). Installs the peer/link descriptors and runs the
    /// (I5) tie-break against any existing link of the same class.
    pub fn identify_link(
        &self,
        link_id: u64,
        address: String,
        mtu: usize,
        remote_peer_id: &str,
        remote_app_id: &str,
    ) -> TieBreakOutcome {
        let class = match self.links.get(&link_id) {
            Some(link) => link.lock().class,
            None => return TieBreakOutcome::Keep,
        };
        if let Some(link) = self.links.get(&link_id) {
            link.lock().peer_id = Some(remote_peer_id.to_string());
        }
        self.ensure_peer(remote_peer_id, remote_app_id);

        let outcome = self.resolve_tie_break(remote_peer_id, class, link_id);
        if outcome == TieBreakOutcome::Keep {
            if let Some(peer) = self.peers.get(remote_peer_id) {
                let generation = self
                    .links
                    .get(&link_id)
                    .map(|l| l.lock().conn_generation)
                    .unwrap_or(0);
                peer.lock().links.insert(
                    link_id,
                    LinkDescriptor {
                        link_id,
                        class,
                        address,
                        state: LinkState::Identified,
                        mtu,
                        last_rx: None,
                        last_tx: None,
                        metrics: LinkMetrics::default(),
                        conn_generation: generation,
                    },
                );
            }
        }
        outcome
    }

    /// (I5): at most one active link per `(peer_id, class)`; the loser of a
    /// tie-break MUST close. Deterministic rule mirrored from
    /// `s2s.rs::handle_s2s_connection`: the lexicographically lower peer id
    /// keeps its outgoing (dialed) link, so both ends of a simultaneous dial
    /// compute the same survivor from `remote_peer_id`/`local_peer_id` alone,
    /// with no dependency on which link happened to identify first locally.
    fn resolve_tie_break(&self, remote_peer_id: &str, class: LinkClass, new_link_id: u64) -> TieBreakOutcome {
        let Some(peer) = self.peers.get(remote_peer_id) else {
            return TieBreakOutcome::Keep;
        };
        let existing: Vec<u64> = peer
            .lock()
            .links
            .values()
            .filter(|l| l.class == class && l.link_id != new_link_id)
            .map(|l| l.link_id)
            .collect();
        if existing.is_empty() {
            return TieBreakOutcome::Keep;
        }

        let new_is_outbound = self
            .links
            .get(&new_link_id)
            .map(|l| l.lock().direction == LinkDirection::Outbound)
            .unwrap_or(false);
        // The lexicographically lower peer id's outgoing link survives.
        let outbound_survives = self.local_peer_id.as_str() < remote_peer_id;
        let new_link_survives = new_is_outbound == outbound_survives;

        if new_link_survives {
            for old_link_id in existing {
                if let Some(old) = self.links.get(&old_link_id) {
                    old.lock().handshake.close(CloseReason::TieBreakLoss);
                }
                if let Some(mut p) = self.peers.get_mut(remote_peer_id) {
                    p.links.remove(&old_link_id);
                }
            }
            TieBreakOutcome::Keep
        } else {
            if let Some(new_link) = self.links.get(&new_link_id) {
                new_link.lock().handshake.close(CloseReason::TieBreakLoss);
            }
            TieBreakOutcome::Lose
        }
    }

    pub fn mark_ready(&self, link_id: u64) {
        let Some(peer_id) = self.links.get(&link_id).and_then(|l| l.lock().peer_id.clone()) else {
            return;
        };
        if let Some(peer) = self.peers.get(&peer_id) {
            if let Some(desc) = peer.lock().links.get_mut(&link_id) {
                desc.state = LinkState::Ready;
            }
        }
    }

    pub fn close_link(&self, link_id: u64, reason: CloseReason) {
        let peer_id = self.links.get(&link_id).and_then(|l| {
            let mut guard = l.lock();
            guard.handshake.close(reason);
            guard.peer_id.clone()
        });
        if let Some(peer_id) = peer_id {
            if let Some(peer) = self.peers.get(&peer_id) {
                peer.lock().links.remove(&link_id);
            }
        }
        self.links.remove(&link_id);
    }

    /// The currently selected link for `peer_id`, per §4.D preference order.
    pub fn selected_link(&self, peer_id: &str) -> Option<u64> {
        self.peers
            .get(peer_id)
            .and_then(|peer| peer.lock().selected_link().map(|l| l.link_id))
    }

    /// `(class, mtu)` of the currently selected link for `peer_id`, so a
    /// caller can decide whether outbound bytes need fragmenting before
    /// queueing (§4.A, §4.C).
    pub fn selected_link_info(&self, peer_id: &str) -> Option<(LinkClass, usize)> {
        self.peers.get(peer_id).and_then(|peer| {
            peer.lock()
                .selected_link()
                .map(|l| (l.class, l.mtu))
        })
    }

    /// `(I1)`: record that a frame was accepted on `link_id`, keeping
    /// `last_rx` and the byte/frame counters current.
    pub fn touch_rx(&self, link_id: u64, bytes: usize) {
        self.with_link_descriptor(link_id, |desc| desc.touch_rx(bytes));
    }

    /// Companion to [`Self::touch_rx`] for the send side.
    pub fn touch_tx(&self, link_id: u64, bytes: usize) {
        self.with_link_descriptor(link_id, |desc| desc.touch_tx(bytes));
    }

    fn with_link_descriptor(&self, link_id: u64, f: impl FnOnce(&mut LinkDescriptor)) {
        let Some(peer_id) = self.links.get(&link_id).and_then(|l| l.lock().peer_id.clone()) else {
            return;
        };
        if let Some(peer) = self.peers.get(&peer_id) {
            if let Some(desc) = peer.lock().links.get_mut(&link_id) {
                f(desc);
            }
        }
    }

    /// Current RTT EWMA of `peer_id`'s selected link, once at least one
    /// keepalive round trip has completed (§4.D tie-break, SPEC_FULL.md
    /// metrics counters).
    pub fn selected_link_rtt(&self, peer_id: &str) -> Option<f64> {
        self.peers.get(peer_id).and_then(|peer| {
            peer.lock().selected_link().and_then(|l| {
                if l.metrics.rtt_ewma_ms > 0.0 {
                    Some(l.metrics.rtt_ewma_ms)
                } else {
                    None
                }
            })
        })
    }

    /// Drive one keepalive tick for `peer_id`'s selected link (§4.C, §5):
    /// a missed pong increments the miss counter, 3 consecutive misses close
    /// the link with [`CloseReason::KeepaliveTimeout`], otherwise a new ping
    /// should be sent and its send time recorded for RTT measurement.
    pub fn keepalive_tick(&self, peer_id: &str) -> KeepaliveTick {
        let Some(link_id) = self.selected_link(peer_id) else {
            return KeepaliveTick::NoLink;
        };
        let timed_out = match self.links.get(&link_id) {
            Some(link) => {
                let mut guard = link.lock();
                if guard.last_ping_sent.is_some() {
                    guard.ping_misses += 1;
                } else {
                    guard.ping_misses = 0;
                }
                if guard.ping_misses >= KEEPALIVE_MISSES_BEFORE_TIMEOUT {
                    true
                } else {
                    guard.last_ping_sent = Some(Instant::now());
                    false
                }
            }
            None => return KeepaliveTick::NoLink,
        };
        if timed_out {
            self.close_link(link_id, CloseReason::KeepaliveTimeout);
            KeepaliveTick::TimedOut
        } else {
            KeepaliveTick::Send
        }
    }

    /// Record a pong received on `link_id`: clears the miss counter and
    /// folds the round trip into the link's `rtt_ewma`.
    pub fn record_pong_received(&self, link_id: u64) {
        let elapsed_ms = self.links.get(&link_id).and_then(|l| {
            let mut guard = l.lock();
            guard.ping_misses = 0;
            guard.last_ping_sent.take().map(|t| t.elapsed().as_secs_f64() * 1000.0)
        });
        if let Some(elapsed_ms) = elapsed_ms {
            self.with_link_descriptor(link_id, |desc| desc.metrics.observe_rtt(elapsed_ms));
        }
    }

    /// Classify a link-level failure (§7). Protocol violations earn the
    /// address a redial penalty; other failures do not.
    pub fn note_link_error(&self, link_id: u64, err: LinkError) {
        if !err.penalises_redial() {
            return;
        }
        if let Some(link) = self.links.get(&link_id) {
            let address = link.lock().address.clone();
            self.redial_penalty.insert(address, Instant::now());
        }
    }

    /// Whether `address` is still serving a redial penalty (§7).
    pub fn redial_penalized(&self, address: &str) -> bool {
        self.redial_penalty
            .get(address)
            .map(|t| t.elapsed() < REDIAL_PENALTY)
            .unwrap_or(false)
    }

    /// Any link id currently attached to `peer_id`, ready or not — used by
    /// host-adapter classes to dispatch handshake traffic before the link
    /// has reached `READY` (§4.H: `feed_inbound` is keyed by `peer_id`, not
    /// `link_id`, for BLE/Wi-Fi Aware).
    pub fn any_link_for(&self, peer_id: &str) -> Option<u64> {
        self.peers
            .get(peer_id)
            .and_then(|p| p.lock().links.keys().next().copied())
    }

    pub fn has_ready_link(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.lock().has_any_ready_link())
            .unwrap_or(false)
    }

    /// Send bytes to `peer_id` over whichever link is currently selected.
    /// Switches are transparent: no state is held here across sends beyond
    /// "which link is selected right now" (§4.D).
    pub fn send(&self, peer_id: &str, bytes: Vec<u8>) -> bool {
        let Some(link_id) = self.selected_link(peer_id) else {
            return false;
        };
        let class_uses_adapter = self
            .links
            .get(&link_id)
            .map(|l| matches!(l.lock().class, LinkClass::Ble | LinkClass::WifiAware))
            .unwrap_or(false);
        self.touch_tx(link_id, bytes.len());
        if class_uses_adapter {
            self.enqueue_adapter_outbound(peer_id, bytes);
            return true;
        }
        if let Some(link) = self.links.get(&link_id) {
            if let Some(sender) = &link.lock().sender {
                return sender.send(bytes).is_ok();
            }
        }
        false
    }

    fn enqueue_adapter_outbound(&self, peer_id: &str, bytes: Vec<u8>) {
        let queue = self
            .adapter_outbound
            .entry(peer_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut q = queue.lock();
        if q.len() >= OUTBOUND_QUEUE_CAPACITY {
            // §5: overflow yields the sender, never drops. Callers of
            // `send` are expected to retry; here we simply do not enqueue
            // past capacity so the channel cannot grow unbounded.
            return;
        }
        q.push_back(bytes);
    }

    /// §4.H `poll_outbound(handle, peer_id) → bytes?`.
    pub fn poll_outbound(&self, peer_id: &str) -> Option<Vec<u8>> {
        self.adapter_outbound
            .get(peer_id)
            .and_then(|q| q.lock().pop_front())
    }

    /// §4.H `feed_inbound(handle, peer_id, bytes)`.
    pub fn feed_inbound(&self, peer_id: &str, bytes: Vec<u8>, inbound_tx: &mpsc::UnboundedSender<(String, Vec<u8>)>) {
        let _ = inbound_tx.send((peer_id.to_string(), bytes));
    }

    pub fn peers_snapshot(&self) -> Vec<PeerDescriptor> {
        self.peers.iter().map(|e| e.value().lock().clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreakOutcome {
    Keep,
    Lose,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_link_reaches_selectable_after_identify_and_ready() {
        let mux = Multiplexer::new("local", "atmosphere");
        let link_id = mux.open_link(LinkClass::Lan, "10.0.0.2:1234".into(), 1500, LinkDirection::Outbound);
        mux.identify_link(link_id, "10.0.0.2:1234".into(), 1500, "remote", "atmosphere");
        assert!(mux.selected_link("remote").is_none(), "not ready yet");
        mux.mark_ready(link_id);
        assert_eq!(mux.selected_link("remote"), Some(link_id));
    }

    #[test]
    fn tie_break_keeps_existing_outbound_link_over_new_inbound() {
        // local_peer_id "aaa" < remote_peer_id "zzz": the lower id's outgoing
        // link must survive regardless of which link identified last.
        let mux = Multiplexer::new("aaa", "atmosphere");
        let first = mux.open_link(LinkClass::Lan, "a".into(), 1500, LinkDirection::Outbound);
        mux.identify_link(first, "a".into(), 1500, "zzz", "atmosphere");
        mux.mark_ready(first);

        let second = mux.open_link(LinkClass::Lan, "b".into(), 1500, LinkDirection::Inbound);
        let outcome = mux.identify_link(second, "b".into(), 1500, "zzz", "atmosphere");
        assert_eq!(outcome, TieBreakOutcome::Lose);

        let peer = mux.peers.get("zzz").unwrap();
        let lan_links: Vec<_> = peer.lock().links.values().filter(|l| l.class == LinkClass::Lan).map(|l| l.link_id).collect();
        assert_eq!(lan_links, vec![first], "(I5): the lower peer id's outbound link wins");
    }

    #[test]
    fn tie_break_closes_existing_inbound_link_for_new_outbound() {
        // Same pairing as above but the new link is the lower id's outbound
        // link, arriving after an inbound link already reached READY.
        let mux = Multiplexer::new("aaa", "atmosphere");
        let first = mux.open_link(LinkClass::Lan, "a".into(), 1500, LinkDirection::Inbound);
        mux.identify_link(first, "a".into(), 1500, "zzz", "atmosphere");
        mux.mark_ready(first);

        let second = mux.open_link(LinkClass::Lan, "b".into(), 1500, LinkDirection::Outbound);
        let outcome = mux.identify_link(second, "b".into(), 1500, "zzz", "atmosphere");
        assert_eq!(outcome, TieBreakOutcome::Keep);

        let peer = mux.peers.get("zzz").unwrap();
        let lan_links: Vec<_> = peer.lock().links.values().filter(|l| l.class == LinkClass::Lan).map(|l| l.link_id).collect();
        assert_eq!(lan_links, vec![second], "(I5): at most one active link per (peer_id, class)");
    }

    #[test]
    fn tie_break_outcome_is_symmetric_regardless_of_which_side_identifies_first() {
        // Mirror of the above with local_peer_id on the *higher* side of the
        // comparison: "zzz" identifying "aaa" keeps aaa's inbound link here,
        // the same physical link that "aaa"'s own mux would keep as outbound.
        let mux = Multiplexer::new("zzz", "atmosphere");
        let inbound = mux.open_link(LinkClass::Lan, "a".into(), 1500, LinkDirection::Inbound);
        let outcome = mux.identify_link(inbound, "a".into(), 1500, "aaa", "atmosphere");
        assert_eq!(outcome, TieBreakOutcome::Keep);
        mux.mark_ready(inbound);

        let outbound = mux.open_link(LinkClass::Lan, "b".into(), 1500, LinkDirection::Outbound);
        let outcome = mux.identify_link(outbound, "b".into(), 1500, "aaa", "atmosphere");
        assert_eq!(outcome, TieBreakOutcome::Lose);
    }

    #[test]
    fn adapter_outbound_queue_round_trip() {
        let mux = Multiplexer::new("local", "atmosphere");
        let link_id = mux.open_link(LinkClass::Ble, "dev".into(), 185, LinkDirection::Outbound);
        mux.identify_link(link_id, "dev".into(), 185, "remote", "atmosphere");
        mux.mark_ready(link_id);
        assert!(mux.send("remote", b"payload".to_vec()));
        assert_eq!(mux.poll_outbound("remote"), Some(b"payload".to_vec()));
        assert_eq!(mux.poll_outbound("remote"), None);
    }

    #[test]
    fn keepalive_tick_closes_link_after_three_missed_pongs() {
        let mux = Multiplexer::new("local", "atmosphere");
        let link_id = mux.open_link(LinkClass::Lan, "a".into(), 1500, LinkDirection::Outbound);
        mux.identify_link(link_id, "a".into(), 1500, "remote", "atmosphere");
        mux.mark_ready(link_id);

        assert_eq!(mux.keepalive_tick("remote"), KeepaliveTick::Send);
        assert_eq!(mux.keepalive_tick("remote"), KeepaliveTick::Send);
        assert_eq!(mux.keepalive_tick("remote"), KeepaliveTick::Send);
        assert_eq!(mux.keepalive_tick("remote"), KeepaliveTick::TimedOut);
        assert!(mux.selected_link("remote").is_none(), "link closed after 3 misses");
    }

    #[test]
    fn pong_receipt_resets_miss_counter_and_measures_rtt() {
        let mux = Multiplexer::new("local", "atmosphere");
        let link_id = mux.open_link(LinkClass::Lan, "a".into(), 1500, LinkDirection::Outbound);
        mux.identify_link(link_id, "a".into(), 1500, "remote", "atmosphere");
        mux.mark_ready(link_id);

        assert_eq!(mux.keepalive_tick("remote"), KeepaliveTick::Send);
        mux.record_pong_received(link_id);
        assert!(mux.selected_link_rtt("remote").is_some());

        // A fresh ping/pong cycle after the reset should not count toward a
        // timeout.
        assert_eq!(mux.keepalive_tick("remote"), KeepaliveTick::Send);
        mux.record_pong_received(link_id);
        assert!(mux.selected_link("remote").is_some());
    }

    #[test]
    fn protocol_violation_applies_redial_penalty_to_the_address() {
        let mux = Multiplexer::new("local", "atmosphere");
        let link_id = mux.open_link(LinkClass::Lan, "10.0.0.9:1234".into(), 1500, LinkDirection::Outbound);
        assert!(!mux.redial_penalized("10.0.0.9:1234"));
        mux.note_link_error(link_id, LinkError::Protocol("oversize frame".into()));
        assert!(mux.redial_penalized("10.0.0.9:1234"));
    }

    #[test]
    fn transient_error_does_not_apply_redial_penalty() {
        let mux = Multiplexer::new("local", "atmosphere");
        let link_id = mux.open_link(LinkClass::Lan, "10.0.0.9:1234".into(), 1500, LinkDirection::Outbound);
        mux.note_link_error(link_id, LinkError::Transient("reset".into()));
        assert!(!mux.redial_penalized("10.0.0.9:1234"));
    }
}
