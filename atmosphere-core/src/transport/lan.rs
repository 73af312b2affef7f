//! LAN transport driver (§4.C "LAN", §6 "UDP beacon"/"LAN TCP stream").
//!
//! Periodically broadcasts a beacon on the configured UDP port (default
//! 11452) and listens for peers' beacons; a TCP listener on an ephemeral
//! port accepts inbound streams framed per §4.A. Grounded on
//! `other_examples/.../tiddlydesktop-rs__.../lan_sync-discovery.rs.rs`'s
//! broadcast-socket setup and beacon loop shape, generalized off its
//! room-code domain onto `peer_id`/`app_id`.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::codec::{decode_beacon, encode_beacon, Beacon};
use crate::transport::PeerHint;
use crate::peer::LinkClass;

/// Default beacon port (§6).
pub const DEFAULT_BEACON_PORT: u16 = 11452;

/// Beacon interval before jitter (§5): 2s ± 25%.
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const BEACON_JITTER_FRACTION: f64 = 0.25;

fn jittered_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(-BEACON_JITTER_FRACTION..=BEACON_JITTER_FRACTION);
    let secs = BEACON_INTERVAL.as_secs_f64() * (1.0 + jitter);
    Duration::from_secs_f64(secs.max(0.1))
}

fn make_broadcast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port);
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Spawns the beacon broadcast/receive loop and the TCP accept loop.
/// Returns the bound TCP port (to advertise in the beacon) and a channel of
/// discovered peer hints for the multiplexer to dial.
pub struct LanDriver {
    pub tcp_port: u16,
    pub hints: mpsc::UnboundedReceiver<PeerHint>,
    pub inbound: mpsc::UnboundedReceiver<TcpStream>,
}

impl LanDriver {
    pub async fn start(
        peer_id: String,
        app_id: String,
        beacon_port: u16,
        name: Option<String>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await?;
        let tcp_port = listener.local_addr()?.port();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "lan: inbound tcp connection");
                        if inbound_tx.send(stream).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lan: accept failed");
                    }
                }
            }
        });

        let beacon_socket = make_broadcast_socket(beacon_port)?;
        let (hints_tx, hints_rx) = mpsc::unbounded_channel();

        let broadcast_peer_id = peer_id.clone();
        let broadcast_app_id = app_id.clone();
        tokio::spawn(async move {
            let broadcast_addr: SocketAddr =
                SocketAddr::new(std::net::Ipv4Addr::BROADCAST.into(), beacon_port);
            loop {
                let beacon = Beacon {
                    peer_id: broadcast_peer_id.clone(),
                    app_id: broadcast_app_id.clone(),
                    tcp_port,
                    name: name.clone(),
                };
                let payload = encode_beacon(&beacon);
                if let Err(e) = beacon_socket.send_to(&payload, broadcast_addr).await {
                    tracing::warn!(error = %e, "lan: beacon send failed");
                }
                tokio::time::sleep(jittered_interval()).await;
            }
        });

        let recv_socket = make_broadcast_socket(beacon_port)?;
        let recv_peer_id = peer_id;
        let recv_app_id = app_id;
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        match decode_beacon(&buf[..len]) {
                            Ok(beacon) => {
                                if beacon.peer_id == recv_peer_id {
                                    continue; // ignore our own beacon
                                }
                                if beacon.app_id != recv_app_id {
                                    continue; // §4.C: peers MUST ignore mismatched app_id
                                }
                                let ip = match src {
                                    SocketAddr::V4(v4) => v4.ip().to_string(),
                                    SocketAddr::V6(v6) => v6.ip().to_string(),
                                };
                                let hint = PeerHint {
                                    class: LinkClass::Lan,
                                    address: format!("{ip}:{}", beacon.tcp_port),
                                    advertised_peer_id: Some(beacon.peer_id),
                                };
                                if hints_tx.send(hint).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "lan: bad beacon, ignoring");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lan: beacon recv failed");
                    }
                }
            }
        });

        Ok(Self {
            tcp_port,
            hints: hints_rx,
            inbound: inbound_rx,
        })
    }
}

/// Dial a LAN peer hint's TCP address. Both sides MAY dial; the winner is
/// decided by the (I5) tie-break in the multiplexer, not here.
pub async fn dial(address: &str) -> std::io::Result<TcpStream> {
    TcpStream::connect(address).await
}
