//! The core mesh node: ties identity, store, multiplexer, handshake, and
//! sync engine together and exposes the §4.H public surface. This is the
//! object a handle in [`crate::handle`] or the FFI bridge ultimately points
//! at.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use crate::codec::{
    self, decode_keepalive, encode_keepalive, looks_like_keepalive, read_next_item,
    KeepaliveKind, Reassembler, WireItem,
};
use crate::config::MeshConfig;
use crate::error::{CodecError, CoreError, LinkError, StoreError};
use crate::gradient::{self, CapabilityEntry};
use crate::handshake::{compute_hmac, CloseReason, HandshakeMessage, LinkState};
use crate::identity::{Identity, MeshIdentity};
use crate::mux::{KeepaliveTick, LinkDirection, Multiplexer};
use crate::peer::LinkClass;
use crate::store::{Document, Store, Version};
use crate::sync::{self, PeerSyncState, SyncMessage};
use crate::transport::lan::{self, LanDriver};
use crate::transport::{ble, relay, wifi_aware};

/// Keepalive cadence (§5): 20s interval, drop after 3 misses (60s).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// Handshake timeout (§5): 10s per link.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound message shapes accepted on a link: the handshake pair plus
/// everything the sync engine understands (§6). Unknown `type` values are
/// ignored rather than rejected.
#[derive(serde::Deserialize)]
#[serde(tag = "type")]
enum InboundMessage {
    #[serde(rename = "hello")]
    Hello {
        peer_id: String,
        app_id: String,
        mesh_id: String,
        nonce: String,
    },
    #[serde(rename = "hello_ack")]
    HelloAck {
        #[allow(dead_code)]
        peer_id: String,
        hmac: String,
    },
    #[serde(rename = "bye")]
    Bye {
        #[serde(default)]
        #[allow(dead_code)]
        reason: String,
    },
    #[serde(rename = "sync_diff")]
    SyncDiff {
        collection: String,
        from_vector: HashMap<String, u64>,
    },
    #[serde(rename = "change")]
    Change(Box<ChangeFields>),
    #[serde(rename = "sync_done")]
    SyncDone {
        collection: String,
        at_vector: HashMap<String, u64>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(serde::Deserialize)]
struct ChangeFields {
    collection: String,
    doc_id: String,
    version: Version,
    #[serde(with = "b64")]
    payload: Vec<u8>,
    tombstone: bool,
    source: String,
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

pub struct Node {
    pub identity: Identity,
    pub mesh: MeshIdentity,
    pub config: MeshConfig,
    pub store: Arc<Store>,
    pub mux: Arc<Multiplexer>,
    sync_states: DashMap<String, Mutex<PeerSyncState>>,
    reassemblers: DashMap<String, Mutex<Reassembler>>,
    /// Per-peer next fragment sequence number, for adapter-driven classes
    /// whose outbound bytes need splitting (§4.A).
    frag_seq: DashMap<String, std::sync::atomic::AtomicU32>,
    shutdown_tx: broadcast::Sender<()>,
    insert_suspended: AtomicBool,
    started: AtomicBool,
}

impl Node {
    /// `init(app_id, data_dir, name) → handle` (§4.H). Identity is
    /// loaded-or-created from `config.data_dir`.
    pub fn open(config: MeshConfig, name: &str) -> Result<Arc<Self>, CoreError> {
        let identity = Identity::load_or_create(&config.data_dir, name)
            .map_err(|e| CoreError::Fatal(format!("identity: {e}")))?;
        let mesh = MeshIdentity::derive(config.mesh_id.clone(), &config.mesh_id_seed);
        let store_path: PathBuf = config.data_dir.join("store.sqlite3");
        let store = Store::open(&store_path, identity.peer_id.clone()).map_err(CoreError::Local)?;
        let mux = Multiplexer::new(identity.peer_id.clone(), config.app_id.clone());
        let (shutdown_tx, _) = broadcast::channel(16);
        Ok(Arc::new(Self {
            identity,
            mesh,
            config,
            store: Arc::new(store),
            mux: Arc::new(mux),
            sync_states: DashMap::new(),
            reassemblers: DashMap::new(),
            frag_seq: DashMap::new(),
            shutdown_tx,
            insert_suspended: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }))
    }

    /// `start_mesh(handle) → listener_port` (§4.H).
    pub async fn start_mesh(self: &Arc<Self>) -> anyhow::Result<u16> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let mut tcp_port = 0;
        let transports = self.config.enabled_transports();

        if transports.lan {
            let driver = LanDriver::start(
                self.mux.local_peer_id().to_string(),
                self.config.app_id.clone(),
                self.config.beacon_port,
                Some(self.identity.name.clone()),
            )
            .await?;
            tcp_port = driver.tcp_port;

            let node = self.clone();
            let mut hints = driver.hints;
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        hint = hints.recv() => {
                            let Some(hint) = hint else { break };
                            let node = node.clone();
                            tokio::spawn(async move {
                                if node.mux.redial_penalized(&hint.address) {
                                    return;
                                }
                                if let Ok(stream) = lan::dial(&hint.address).await {
                                    node.run_tcp_link(stream, LinkClass::Lan, hint.address, LinkDirection::Outbound).await;
                                }
                            });
                        }
                    }
                }
            });

            let node = self.clone();
            let mut inbound = driver.inbound;
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        stream = inbound.recv() => {
                            let Some(stream) = stream else { break };
                            let address = stream
                                .peer_addr()
                                .map(|a| a.to_string())
                                .unwrap_or_default();
                            let node = node.clone();
                            tokio::spawn(async move {
                                node.run_tcp_link(stream, LinkClass::Lan, address, LinkDirection::Inbound).await;
                            });
                        }
                    }
                }
            });
        }

        if transports.relay {
            if let Some(url) = self.config.relay_url.clone() {
                let node = self.clone();
                tokio::spawn(async move {
                    node.run_relay_link(url).await;
                });
            }
        }

        self.spawn_keepalive_driver();
        Ok(tcp_port)
    }

    /// `stop(handle)` (§4.H, §5): sockets closed, final log flush already
    /// durable (every `put`/`merge` commits synchronously), within 2s.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // ---- TCP (LAN, and the relay bridge below) link lifecycle ----

    fn hello_message(&self, local_nonce: String) -> HandshakeMessage {
        HandshakeMessage::Hello {
            peer_id: self.mux.local_peer_id().to_string(),
            app_id: self.config.app_id.clone(),
            mesh_id: self.mesh.mesh_id.clone(),
            nonce: local_nonce,
        }
    }

    async fn run_tcp_link(
        self: &Arc<Self>,
        stream: TcpStream,
        class: LinkClass,
        address: String,
        direction: LinkDirection,
    ) {
        stream.set_nodelay(true).ok();
        let link_id = self.mux.open_link(class, address.clone(), 65536, direction);
        let (mut rd, mut wr) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.mux.attach_sender(link_id, out_tx.clone());

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if wr.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let local_nonce = self
            .mux
            .with_handshake(link_id, |hs| hs.local_nonce().to_string())
            .unwrap_or_default();
        self.send_frame(link_id, &out_tx, &self.hello_message(local_nonce));

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let state = self
                .mux
                .with_handshake(link_id, |hs| hs.state)
                .unwrap_or(LinkState::Closed);
            if state == LinkState::Closed {
                break;
            }
            let item = tokio::select! {
                item = read_next_item::<_, serde_json::Value>(&mut rd) => item,
                _ = tokio::time::sleep_until(deadline), if state != LinkState::Ready => {
                    self.mux.close_link(link_id, CloseReason::AuthTimeout);
                    break;
                }
            };
            match item {
                Ok(Some(WireItem::Keepalive(KeepaliveKind::Ping))) => {
                    self.mux.touch_rx(link_id, codec::KEEPALIVE_FRAME_LEN);
                    let pong = encode_keepalive(KeepaliveKind::Pong).to_vec();
                    self.mux.touch_tx(link_id, pong.len());
                    let _ = out_tx.send(pong);
                }
                Ok(Some(WireItem::Keepalive(KeepaliveKind::Pong))) => {
                    self.mux.touch_rx(link_id, codec::KEEPALIVE_FRAME_LEN);
                    self.mux.record_pong_received(link_id);
                }
                Ok(Some(WireItem::Frame(value))) => {
                    let frame_len = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
                    self.mux.touch_rx(link_id, frame_len);
                    self.dispatch(link_id, class, &address, value, &out_tx).await;
                }
                Ok(None) => {
                    self.mux.close_link(link_id, CloseReason::TransportError);
                    break;
                }
                Err(e) => {
                    if is_protocol_violation(&e) {
                        self.mux.note_link_error(link_id, LinkError::Protocol(e.to_string()));
                    }
                    self.mux.close_link(link_id, CloseReason::TransportError);
                    break;
                }
            }
        }
    }

    /// Encode and send a wire value on `link_id`, recording the outbound
    /// byte count (§3 rolling byte counters).
    fn send_frame<T: serde::Serialize>(&self, link_id: u64, out_tx: &mpsc::UnboundedSender<Vec<u8>>, value: &T) {
        if let Ok(bytes) = codec::encode_stream_frame(value) {
            self.mux.touch_tx(link_id, bytes.len());
            let _ = out_tx.send(bytes);
        }
    }

    async fn run_relay_link(self: &Arc<Self>, url: String) {
        let link = match relay::dial(&url).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "relay dial failed");
                return;
            }
        };
        let link_id = self.mux.open_link(LinkClass::Relay, url, 1024 * 1024, LinkDirection::Outbound);
        self.mux.attach_sender(link_id, link.outbound_tx.clone());

        let local_nonce = self
            .mux
            .with_handshake(link_id, |hs| hs.local_nonce().to_string())
            .unwrap_or_default();
        self.send_frame(link_id, &link.outbound_tx, &self.hello_message(local_nonce));

        let mut inbound = link.inbound_rx;
        while let Some(frame) = inbound.recv().await {
            self.mux.touch_rx(link_id, frame.len());
            match codec::try_decode_stream_frame::<serde_json::Value>(&frame) {
                Ok(Some((value, _))) => {
                    self.dispatch(link_id, LinkClass::Relay, "relay", value, &link.outbound_tx)
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    if is_protocol_violation(&e) {
                        self.mux.note_link_error(link_id, LinkError::Protocol(e.to_string()));
                    }
                    break;
                }
            }
        }
        self.mux.close_link(link_id, CloseReason::TransportError);
    }

    /// Route a decoded wire message for `link_id` through the handshake or
    /// sync engine as appropriate (P7: nothing but `hello`/`hello_ack`
    /// crosses a non-`READY` link).
    async fn dispatch(
        self: &Arc<Self>,
        link_id: u64,
        class: LinkClass,
        address: &str,
        value: serde_json::Value,
        out_tx: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let msg: InboundMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(_) => return, // unknown/malformed payloads are ignored (§6)
        };
        match msg {
            InboundMessage::Hello {
                peer_id,
                app_id,
                mesh_id,
                nonce,
            } => {
                self.mux.with_handshake(link_id, |hs| {
                    hs.identify(&peer_id, &app_id, &self.config.app_id)
                });
                let state = self.mux.with_handshake(link_id, |hs| hs.state);
                if state == Some(LinkState::Closed) {
                    self.mux.close_link(link_id, CloseReason::WrongApp);
                    return;
                }
                self.mux
                    .identify_link(link_id, address.to_string(), 65536, &peer_id, &app_id);
                self.mux
                    .with_handshake(link_id, |hs| hs.begin_auth(&mesh_id, &self.mesh.mesh_id));
                let state = self.mux.with_handshake(link_id, |hs| hs.state);
                if state == Some(LinkState::Closed) {
                    self.mux.close_link(link_id, CloseReason::AuthFail);
                    return;
                }
                let reply_hmac =
                    compute_hmac(&self.mesh.shared_secret, &nonce, self.mux.local_peer_id());
                let ack = HandshakeMessage::HelloAck {
                    peer_id: self.mux.local_peer_id().to_string(),
                    hmac: reply_hmac,
                };
                self.send_frame(link_id, out_tx, &ack);
            }
            InboundMessage::HelloAck { hmac, .. } => {
                self.mux
                    .with_handshake(link_id, |hs| hs.verify_remote(&self.mesh.shared_secret, &hmac));
                if self.mux.with_handshake(link_id, |hs| hs.is_ready()) == Some(true) {
                    self.mux.mark_ready(link_id);
                    self.on_link_ready(link_id, class).await;
                } else if self.mux.with_handshake(link_id, |hs| hs.state) == Some(LinkState::Closed) {
                    self.mux.close_link(link_id, CloseReason::AuthFail);
                }
            }
            InboundMessage::Bye { .. } => {
                self.mux.close_link(link_id, CloseReason::TransportError);
            }
            InboundMessage::SyncDiff {
                collection,
                from_vector,
            } => {
                if !self.link_is_ready(link_id) {
                    return; // (P7)
                }
                if let Ok(changes) = sync::changes_for_diff(&self.store, &collection, &from_vector) {
                    for change in changes {
                        self.send_frame(link_id, out_tx, &change);
                    }
                    let done = SyncMessage::SyncDone {
                        collection,
                        at_vector: HashMap::new(),
                    };
                    self.send_frame(link_id, out_tx, &done);
                }
            }
            InboundMessage::Change(fields) => {
                if !self.link_is_ready(link_id) {
                    return;
                }
                let _ = self.store.merge(
                    &fields.collection,
                    &fields.doc_id,
                    fields.version,
                    fields.payload,
                    fields.tombstone,
                    &fields.source,
                );
            }
            InboundMessage::SyncDone {
                collection,
                at_vector,
            } => {
                if !self.link_is_ready(link_id) {
                    return;
                }
                if let Some(peer_id) = self
                    .mux
                    .with_handshake(link_id, |hs| hs.remote_peer_id().map(str::to_string))
                    .flatten()
                {
                    let state = self.sync_states.entry(peer_id).or_default();
                    sync::complete_round(&mut state.lock(), &collection, at_vector);
                }
            }
            InboundMessage::Unknown => {}
        }
    }

    fn link_is_ready(&self, link_id: u64) -> bool {
        self.mux.with_handshake(link_id, |hs| hs.is_ready()).unwrap_or(false)
    }

    async fn on_link_ready(self: &Arc<Self>, link_id: u64, _class: LinkClass) {
        let Some(peer_id) = self
            .mux
            .with_handshake(link_id, |hs| hs.remote_peer_id().map(str::to_string))
            .flatten()
        else {
            return;
        };
        // "On entering READY for the first link to a peer, initiate sync;
        // on subsequent links, no action" (§4.F).
        let already_started = {
            let state = self.sync_states.entry(peer_id.clone()).or_default();
            let mut guard = state.lock();
            let was = guard.started;
            guard.started = true;
            was
        };
        if already_started {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            node.kick_off_sync(peer_id).await;
        });
    }

    async fn kick_off_sync(self: Arc<Self>, peer_id: String) {
        let Ok(collections) = self.store.known_collections() else {
            return;
        };
        let diffs = {
            let state = self.sync_states.entry(peer_id.clone()).or_default();
            sync::build_sync_diffs(&state.lock(), &collections)
        };
        for diff in diffs {
            if let Ok(bytes) = codec::encode_stream_frame(&diff) {
                self.send_to_peer(&peer_id, bytes);
            }
        }
    }

    fn spawn_keepalive_driver(self: &Arc<Self>) {
        let node = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                        node.tick_keepalive().await;
                    }
                }
            }
        });
    }

    async fn tick_keepalive(self: &Arc<Self>) {
        for peer in self.mux.peers_snapshot() {
            if !peer.has_any_ready_link() {
                continue;
            }
            match self.mux.keepalive_tick(&peer.peer_id) {
                KeepaliveTick::Send => {
                    self.mux
                        .send(&peer.peer_id, encode_keepalive(KeepaliveKind::Ping).to_vec());
                }
                KeepaliveTick::TimedOut => {
                    tracing::info!(peer_id = %peer.peer_id, "keepalive timeout, link closed (§5)");
                }
                KeepaliveTick::NoLink => {}
            }
        }
    }

    // ---- §4.H operations ----

    pub fn insert(
        &self,
        collection: &str,
        doc_id: &str,
        payload_json: &serde_json::Value,
    ) -> Result<Version, CoreError> {
        if self.insert_suspended.load(Ordering::SeqCst) {
            return Err(CoreError::Fatal(
                "insert suspended: local store unavailable".into(),
            ));
        }
        let bytes = serde_json::to_vec(payload_json).unwrap_or_default();
        match self.store.put(collection, doc_id, bytes) {
            Ok(v) => Ok(v),
            Err(e) => {
                if matches!(e, StoreError::LogWrite(_) | StoreError::Index(_)) {
                    self.insert_suspended.store(true, Ordering::SeqCst);
                }
                Err(CoreError::Local(e))
            }
        }
    }

    pub fn query(&self, collection: &str) -> Result<serde_json::Value, CoreError> {
        let docs = self.store.list(collection).map_err(CoreError::Local)?;
        Ok(serde_json::Value::Array(docs.iter().map(doc_to_json).collect()))
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Result<serde_json::Value, CoreError> {
        let doc = self.store.get(collection, doc_id).map_err(CoreError::Local)?;
        Ok(doc.as_ref().map(doc_to_json).unwrap_or(serde_json::Value::Null))
    }

    pub fn peers(&self) -> serde_json::Value {
        let peers = self.mux.peers_snapshot();
        serde_json::Value::Array(
            peers
                .iter()
                .map(|p| {
                    json!({
                        "peer_id": p.peer_id,
                        "name": p.name,
                        "app_id": p.app_id,
                        "ready": p.has_any_ready_link(),
                        "links": p.links.values().map(|l| json!({
                            "class": format!("{:?}", l.class),
                            "state": format!("{:?}", l.state),
                            "rtt_ewma_ms": l.metrics.rtt_ewma_ms,
                            "bytes_sent": l.metrics.bytes_sent,
                            "bytes_recv": l.metrics.bytes_recv,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect(),
        )
    }

    pub fn capabilities(&self) -> Result<Vec<CapabilityEntry>, CoreError> {
        gradient::project(&self.store, &self.mux, self.mux.local_peer_id())
            .map_err(|e| CoreError::Fatal(e.to_string()))
    }

    pub fn health(&self) -> serde_json::Value {
        let metrics = self.store.metrics();
        json!({
            "peer_id": self.mux.local_peer_id(),
            "peer_count": self.mux.peers_snapshot().len(),
            "capability_count": self.capabilities().map(|c| c.len()).unwrap_or(0),
            "insert_suspended": self.insert_suspended.load(Ordering::SeqCst),
            "store_puts": metrics.puts,
            "store_merges_accepted": metrics.merges_accepted,
            "store_merges_rejected": metrics.merges_rejected,
            "doc_count": metrics.doc_count,
        })
    }

    // ---- Transport adapter hooks (§4.H) for host-driven classes ----

    pub fn poll_outbound(&self, peer_id: &str) -> Option<Vec<u8>> {
        self.mux.poll_outbound(peer_id)
    }

    /// `feed_inbound(handle, peer_id, bytes)` (§4.H). `bytes` is one
    /// datagram fragment or keepalive frame from a host-driven adapter
    /// (BLE, Wi-Fi Aware); reassembled stream frames are dispatched the same
    /// way as a TCP link's decoded frames.
    pub fn feed_inbound(self: &Arc<Self>, peer_id: &str, bytes: &[u8]) {
        if looks_like_keepalive(bytes) {
            let link_id = self.mux.selected_link(peer_id).or_else(|| self.pending_link_for(peer_id));
            if let Some(link_id) = link_id {
                self.mux.touch_rx(link_id, bytes.len());
            }
            match decode_keepalive(bytes) {
                Ok(KeepaliveKind::Ping) => {
                    self.mux.send(peer_id, encode_keepalive(KeepaliveKind::Pong).to_vec());
                }
                Ok(KeepaliveKind::Pong) => {
                    if let Some(link_id) = link_id {
                        self.mux.record_pong_received(link_id);
                    }
                }
                Err(_) => {}
            }
            return;
        }
        let reassembled = {
            let entry = self.reassemblers.entry(peer_id.to_string()).or_default();
            entry.lock().feed(peer_id, bytes)
        };
        if let Ok(Some(frame)) = reassembled {
            if let Ok(Some((value, _))) = codec::try_decode_stream_frame::<serde_json::Value>(&frame) {
                let node = self.clone();
                let peer_id = peer_id.to_string();
                tokio::spawn(async move {
                    node.dispatch_adapter_message(&peer_id, value).await;
                });
            }
        }
    }

    /// Dispatch a reassembled message from a host-adapter-driven link,
    /// keyed by `peer_id` rather than a link id since the core holds no
    /// socket of its own for these classes; the handshake/sync state still
    /// lives on the multiplexer's link entry for whichever link is selected.
    async fn dispatch_adapter_message(self: Arc<Self>, peer_id: &str, value: serde_json::Value) {
        let Some(link_id) = self.mux.selected_link(peer_id).or_else(|| self.pending_link_for(peer_id)) else {
            return;
        };
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.dispatch(link_id, LinkClass::Ble, peer_id, value, &out_tx).await;
        drop(out_tx);
        while let Some(bytes) = out_rx.recv().await {
            self.send_to_peer(peer_id, bytes);
        }
    }

    /// Send an already-encoded stream frame to `peer_id` over whichever
    /// link is selected, fragmenting first if that link's class caps
    /// per-message size (BLE, Wi-Fi Aware — §4.A, §4.C). Each class's own
    /// transport driver module owns its slice-size policy: BLE derives it
    /// from the link's reported MTU, Wi-Fi Aware has a fixed 255-byte
    /// `sendMessage` cap regardless of MTU.
    fn send_to_peer(&self, peer_id: &str, bytes: Vec<u8>) {
        let Some((class, mtu)) = self.mux.selected_link_info(peer_id) else {
            self.mux.send(peer_id, bytes);
            return;
        };
        let max_slice_payload = match class {
            LinkClass::Ble => ble::max_slice_payload(mtu),
            LinkClass::WifiAware => wifi_aware::max_slice_payload(),
            LinkClass::Lan | LinkClass::Relay => {
                self.mux.send(peer_id, bytes);
                return;
            }
        };
        let sequence = {
            let counter = self
                .frag_seq
                .entry(peer_id.to_string())
                .or_insert_with(|| std::sync::atomic::AtomicU32::new(0));
            counter.fetch_add(1, Ordering::SeqCst)
        };
        for fragment in codec::fragment(&bytes, sequence, max_slice_payload) {
            self.mux.send(peer_id, fragment);
        }
    }

    fn pending_link_for(&self, peer_id: &str) -> Option<u64> {
        self.mux.any_link_for(peer_id)
    }

    /// `peer_discovered(handle, device_id, class)` (§4.H): a host adapter
    /// reports a newly discovered BLE/Wi-Fi Aware peer and gets back a link
    /// id to send its subsequent `peer_accepted` call with.
    pub fn peer_discovered(&self, device_id: &str, class: LinkClass) -> u64 {
        let mtu = default_mtu_for(class);
        self.mux
            .open_link(class, device_id.to_string(), mtu, LinkDirection::Outbound)
    }

    /// `peer_accepted(handle, link_id, peer_id, device_id)` (§4.H): the host
    /// adapter has resolved `device_id` to a mesh `peer_id` (e.g. via the
    /// BLE peer-info characteristic read, §4.C). The handshake itself still
    /// proceeds over `feed_inbound`/`poll_outbound` exactly as for any other
    /// link once identified.
    pub fn peer_accepted(&self, link_id: u64, peer_id: &str, device_id: &str) {
        let class = self.mux.link_class(link_id).unwrap_or(LinkClass::Ble);
        let mtu = default_mtu_for(class);
        self.mux.identify_link(
            link_id,
            device_id.to_string(),
            mtu,
            peer_id,
            self.config.app_id.as_str(),
        );
    }
}

/// Default MTU recorded for a host-adapter-driven link, per class (§4.C):
/// BLE's GATT-write MTU and Wi-Fi Aware's fixed `sendMessage` cap.
fn default_mtu_for(class: LinkClass) -> usize {
    match class {
        LinkClass::Ble => ble::DEFAULT_MTU,
        LinkClass::WifiAware => wifi_aware::MAX_MESSAGE_LEN,
        LinkClass::Lan | LinkClass::Relay => 1500,
    }
}

/// Whether a codec failure reflects malformed/oversize wire data rather
/// than an ordinary transport-level error (§7: only the former earns a
/// redial penalty).
fn is_protocol_violation(err: &CodecError) -> bool {
    matches!(
        err,
        CodecError::OversizeFrame(_) | CodecError::Malformed(_) | CodecError::BadMagic | CodecError::Json(_)
    )
}

fn doc_to_json(doc: &Document) -> serde_json::Value {
    json!({
        "doc_id": doc.doc_id,
        "version": {"logical_clock": doc.version.logical_clock, "peer_id": doc.version.peer_id},
        "payload": serde_json::from_slice::<serde_json::Value>(&doc.payload).unwrap_or(serde_json::Value::Null),
    })
}
