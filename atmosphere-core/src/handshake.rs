//! Handshake state machine (§4.E).
//!
//! `DIALING → IDENTIFIED → AUTH_PENDING → READY → CLOSED`. Grounded on the
//! teacher's `s2s.rs` hello/auth exchange, generalized from its fixed S2S
//! link pairing to the multi-transport, multi-class model of §3/§4.D.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::HandshakeError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Identified,
    AuthPending,
    Ready,
    Closed,
}

/// Close reasons recorded on the link descriptor (§4.E, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    WrongApp,
    AuthFail,
    AuthTimeout,
    TransportError,
    KeepaliveTimeout,
    TieBreakLoss,
    LocalStop,
}

/// Wire message exchanged during the handshake (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    #[serde(rename = "hello")]
    Hello {
        peer_id: String,
        app_id: String,
        mesh_id: String,
        nonce: String,
    },
    #[serde(rename = "hello_ack")]
    HelloAck {
        peer_id: String,
        hmac: String,
    },
    #[serde(rename = "bye")]
    Bye { reason: String },
}

/// HMAC over `nonce_remote ‖ peer_id_local` keyed by the shared secret (§6),
/// hex-encoded.
pub fn compute_hmac(shared_secret: &[u8; 32], nonce_remote: &str, peer_id_local: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(shared_secret).expect("hmac accepts any key length");
    mac.update(nonce_remote.as_bytes());
    mac.update(peer_id_local.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_hmac(
    shared_secret: &[u8; 32],
    nonce_remote: &str,
    peer_id_local: &str,
    candidate_hex: &str,
) -> bool {
    let expected = compute_hmac(shared_secret, nonce_remote, peer_id_local);
    // constant-time-ish compare is unnecessary here: the mesh secret is
    // shared, not a remote credential protecting against a local attacker.
    expected == candidate_hex
}

pub fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Per-link handshake state tracked by the multiplexer (§4.D, §4.E).
pub struct Handshake {
    pub state: LinkState,
    pub close_reason: Option<CloseReason>,
    local_nonce: String,
    remote_peer_id: Option<String>,
    remote_app_id: Option<String>,
    remote_mesh_id: Option<String>,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: LinkState::Dialing,
            close_reason: None,
            local_nonce: random_nonce(),
            remote_peer_id: None,
            remote_app_id: None,
            remote_mesh_id: None,
        }
    }

    pub fn local_nonce(&self) -> &str {
        &self.local_nonce
    }

    /// `DIALING → IDENTIFIED` (transition 1, §4.E). Called once the remote
    /// `peer_id`/`app_id` are known, from hello, peer-info read, or beacon.
    pub fn identify(&mut self, remote_peer_id: &str, remote_app_id: &str, local_app_id: &str) {
        if self.state != LinkState::Dialing {
            return;
        }
        if remote_app_id != local_app_id {
            self.close(CloseReason::WrongApp);
            return;
        }
        self.remote_peer_id = Some(remote_peer_id.to_string());
        self.remote_app_id = Some(remote_app_id.to_string());
        self.state = LinkState::Identified;
    }

    /// `IDENTIFIED → AUTH_PENDING` (transition 2): both sides have sent
    /// `hello{mesh_id, nonce, hmac}`. If mesh ids disagree, close.
    pub fn begin_auth(&mut self, remote_mesh_id: &str, local_mesh_id: &str) {
        if self.state != LinkState::Identified {
            return;
        }
        if remote_mesh_id != local_mesh_id {
            self.close(CloseReason::AuthFail);
            return;
        }
        self.remote_mesh_id = Some(remote_mesh_id.to_string());
        self.state = LinkState::AuthPending;
    }

    /// Verify an inbound `hello_ack` hmac, claiming to be `HMAC(secret,
    /// our_nonce ‖ remote_peer_id)`. The sender could only have produced
    /// this after receiving our `hello` (to learn our nonce), so a single
    /// successful verification already authenticates the remote end-to-end
    /// — there is no third wire message to additionally confirm our own
    /// `hello_ack` was accepted, so `AUTH_PENDING → READY` (transition 3)
    /// fires directly here.
    pub fn verify_remote(&mut self, shared_secret: &[u8; 32], remote_hmac_hex: &str) {
        if self.state != LinkState::AuthPending {
            return;
        }
        let Some(remote_peer_id) = self.remote_peer_id.clone() else {
            self.close(CloseReason::AuthFail);
            return;
        };
        if verify_hmac(shared_secret, &self.local_nonce, &remote_peer_id, remote_hmac_hex) {
            self.state = LinkState::Ready;
        } else {
            self.close(CloseReason::AuthFail);
        }
    }

    /// `READY → CLOSED` (transition 4): transport error, keepalive timeout,
    /// or tie-break loss.
    pub fn close(&mut self, reason: CloseReason) {
        self.state = LinkState::Closed;
        self.close_reason = Some(reason);
    }

    pub fn remote_peer_id(&self) -> Option<&str> {
        self.remote_peer_id.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl From<CloseReason> for HandshakeError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::WrongApp => HandshakeError::WrongApp,
            CloseReason::AuthFail => HandshakeError::AuthFail,
            CloseReason::AuthTimeout => HandshakeError::Timeout,
            _ => HandshakeError::AuthFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];

    #[test]
    fn happy_path_reaches_ready() {
        let mut hs = Handshake::new();
        hs.identify("peer-b", "atmosphere", "atmosphere");
        assert_eq!(hs.state, LinkState::Identified);
        hs.begin_auth("mesh-1", "mesh-1");
        assert_eq!(hs.state, LinkState::AuthPending);

        // peer-b computes hmac over *our* nonce and *its own* peer id.
        let hmac = compute_hmac(&SECRET, hs.local_nonce(), "peer-b");
        hs.verify_remote(&SECRET, &hmac);
        assert_eq!(hs.state, LinkState::Ready);
        assert!(hs.is_ready());
    }

    #[test]
    fn wrong_app_closes_at_identify() {
        let mut hs = Handshake::new();
        hs.identify("peer-b", "other-app", "atmosphere");
        assert_eq!(hs.state, LinkState::Closed);
        assert_eq!(hs.close_reason, Some(CloseReason::WrongApp));
    }

    #[test]
    fn wrong_mesh_closes_at_auth() {
        let mut hs = Handshake::new();
        hs.identify("peer-b", "atmosphere", "atmosphere");
        hs.begin_auth("mesh-2", "mesh-1");
        assert_eq!(hs.state, LinkState::Closed);
        assert_eq!(hs.close_reason, Some(CloseReason::AuthFail));
    }

    #[test]
    fn bad_hmac_closes_at_verify() {
        let mut hs = Handshake::new();
        hs.identify("peer-b", "atmosphere", "atmosphere");
        hs.begin_auth("mesh-1", "mesh-1");
        hs.verify_remote(&SECRET, "not-a-real-hmac");
        assert_eq!(hs.state, LinkState::Closed);
        assert_eq!(hs.close_reason, Some(CloseReason::AuthFail));
    }

    #[test]
    fn no_sync_eligible_before_ready() {
        let hs = Handshake::new();
        assert!(!hs.is_ready());
    }
}
