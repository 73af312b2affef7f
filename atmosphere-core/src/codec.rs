//! Wire codec (§4.A): stream frames, datagram fragments, the UDP beacon, and
//! the fixed keepalive frame.
//!
//! Two framings coexist because not every link class supports arbitrarily
//! large messages: reliable byte streams (LAN TCP, relay WebSocket binary)
//! get a length-prefixed JSON stream frame; links with a hard per-message
//! cap (BLE writes, Wi-Fi Aware `sendMessage`) fragment that same stream
//! frame into datagram slices, keyed by `(remote, sequence)` for reassembly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::CodecError;

/// Hard cap on a single stream frame (§4.A).
pub const MAX_STREAM_FRAME_LEN: usize = 16 * 1024 * 1024;

/// UDP beacon magic (§4.A, §6).
pub const BEACON_MAGIC: &[u8; 4] = b"ATMO";

/// Keepalive ping magic (§4.A).
pub const KEEPALIVE_PING: &[u8; 4] = b"APIN";
/// Keepalive pong magic (§4.A).
pub const KEEPALIVE_PONG: &[u8; 4] = b"APON";
/// Fixed size of a keepalive frame (§4.A).
pub const KEEPALIVE_FRAME_LEN: usize = 32;

/// Reassembly caps (§4.A).
pub const MAX_SEQUENCES_PER_REMOTE: usize = 500;
pub const FRAGMENT_EXPIRY: Duration = Duration::from_secs(10);

/// Encode `value` as a length-prefixed JSON stream frame.
///
/// Returns `CodecError::OversizeFrame` if the encoded JSON would exceed
/// [`MAX_STREAM_FRAME_LEN`] — the caller MUST reset the link on this error,
/// never retry on the same link (§4.A).
pub fn encode_stream_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_STREAM_FRAME_LEN {
        return Err(CodecError::OversizeFrame(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a single length-prefixed JSON stream frame from the front of
/// `buf`. Returns `Some((value, consumed_bytes))` if a whole frame is
/// present, `None` if more bytes are needed.
pub fn try_decode_stream_frame<T: DeserializeOwned>(
    buf: &[u8],
) -> Result<Option<(T, usize)>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_STREAM_FRAME_LEN {
        return Err(CodecError::OversizeFrame(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let value = serde_json::from_slice(&buf[4..4 + len])?;
    Ok(Some((value, 4 + len)))
}

/// 8-byte datagram fragment header (§4.A): `{sequence:u32-BE, index:u16-BE,
/// total:u16-BE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sequence: u32,
    pub index: u16,
    pub total: u16,
}

impl FragmentHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..6].copy_from_slice(&self.index.to_be_bytes());
        out[6..8].copy_from_slice(&self.total.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::LEN {
            return Err(CodecError::Malformed("fragment header too short".into()));
        }
        Ok(Self {
            sequence: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            index: u16::from_be_bytes([bytes[4], bytes[5]]),
            total: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Split `payload` (a fully-encoded stream frame) into datagram fragments
/// whose total size, header included, never exceeds `max_slice_payload +
/// FragmentHeader::LEN`.
pub fn fragment(payload: &[u8], sequence: u32, max_slice_payload: usize) -> Vec<Vec<u8>> {
    if max_slice_payload == 0 {
        return Vec::new();
    }
    let total = payload.chunks(max_slice_payload).count().max(1) as u16;
    payload
        .chunks(max_slice_payload)
        .enumerate()
        .map(|(i, slice)| {
            let header = FragmentHeader {
                sequence,
                index: i as u16,
                total,
            };
            let mut out = Vec::with_capacity(FragmentHeader::LEN + slice.len());
            out.extend_from_slice(&header.encode());
            out.extend_from_slice(slice);
            out
        })
        .collect()
}

struct PartialReassembly {
    total: u16,
    parts: HashMap<u16, Vec<u8>>,
    last_seen: Instant,
}

/// Reassembly buffers keyed by `(remote, sequence)`, capped and expired per
/// §4.A.
pub struct Reassembler {
    per_remote: HashMap<String, HashMap<u32, PartialReassembly>>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            per_remote: HashMap::new(),
        }
    }

    /// Feed one datagram fragment in from `remote`. Returns the reassembled
    /// payload once all fragments for its sequence have arrived.
    pub fn feed(&mut self, remote: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        let header = FragmentHeader::decode(bytes)?;
        let slice = &bytes[FragmentHeader::LEN..];

        self.expire_stale(remote);
        let remote_map = self.per_remote.entry(remote.to_string()).or_default();

        if !remote_map.contains_key(&header.sequence) && remote_map.len() >= MAX_SEQUENCES_PER_REMOTE {
            // Drop the oldest in-flight sequence to make room, matching the
            // "capped at 500 active sequences per remote" rule (§4.A).
            if let Some(oldest) = remote_map
                .iter()
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(seq, _)| *seq)
            {
                remote_map.remove(&oldest);
            }
        }

        let partial = remote_map.entry(header.sequence).or_insert_with(|| PartialReassembly {
            total: header.total,
            parts: HashMap::new(),
            last_seen: Instant::now(),
        });
        partial.last_seen = Instant::now();
        partial.parts.insert(header.index, slice.to_vec());

        if partial.parts.len() as u16 >= partial.total {
            let total = partial.total;
            let mut assembled = Vec::new();
            for i in 0..total {
                match partial.parts.get(&i) {
                    Some(part) => assembled.extend_from_slice(part),
                    None => return Ok(None), // shouldn't happen, but don't panic on gaps
                }
            }
            remote_map.remove(&header.sequence);
            return Ok(Some(assembled));
        }
        Ok(None)
    }

    fn expire_stale(&mut self, remote: &str) {
        if let Some(map) = self.per_remote.get_mut(remote) {
            map.retain(|_, p| p.last_seen.elapsed() < FRAGMENT_EXPIRY);
        }
    }
}

/// UDP beacon payload (§4.A, §6): `ATMO` magic followed by JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Beacon {
    pub peer_id: String,
    pub app_id: String,
    pub tcp_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub fn encode_beacon(beacon: &Beacon) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 128);
    out.extend_from_slice(BEACON_MAGIC);
    out.extend_from_slice(&serde_json::to_vec(beacon).expect("beacon serializes"));
    out
}

pub fn decode_beacon(bytes: &[u8]) -> Result<Beacon, CodecError> {
    if bytes.len() < 4 || &bytes[0..4] != BEACON_MAGIC {
        return Err(CodecError::BadMagic);
    }
    Ok(serde_json::from_slice(&bytes[4..])?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveKind {
    Ping,
    Pong,
}

/// Encode a fixed 32-byte keepalive frame. Intercepted below the sync layer
/// on receipt (§4.A) — never routed through the handshake or CRDT engines.
pub fn encode_keepalive(kind: KeepaliveKind) -> [u8; KEEPALIVE_FRAME_LEN] {
    let mut out = [0u8; KEEPALIVE_FRAME_LEN];
    let magic = match kind {
        KeepaliveKind::Ping => KEEPALIVE_PING,
        KeepaliveKind::Pong => KEEPALIVE_PONG,
    };
    out[0..4].copy_from_slice(magic);
    out
}

pub fn decode_keepalive(bytes: &[u8]) -> Result<KeepaliveKind, CodecError> {
    if bytes.len() != KEEPALIVE_FRAME_LEN {
        return Err(CodecError::Malformed("keepalive frame wrong length".into()));
    }
    match &bytes[0..4] {
        b if b == KEEPALIVE_PING => Ok(KeepaliveKind::Ping),
        b if b == KEEPALIVE_PONG => Ok(KeepaliveKind::Pong),
        _ => Err(CodecError::UnknownKeepalive),
    }
}

/// Whether a raw inbound buffer is a keepalive frame, cheaply, without a
/// full decode — used by link readers to intercept keepalives before
/// dispatching to the handshake/sync layer.
pub fn looks_like_keepalive(bytes: &[u8]) -> bool {
    bytes.len() == KEEPALIVE_FRAME_LEN
        && (&bytes[0..4] == KEEPALIVE_PING || &bytes[0..4] == KEEPALIVE_PONG)
}

/// Write one stream frame to an async byte sink (LAN TCP, relay WS binary).
pub async fn write_stream_frame<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_stream_frame(value)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one length-prefixed stream frame from an async byte source. Returns
/// `Ok(None)` on clean EOF before any bytes of a new frame arrived.
pub async fn read_stream_frame<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_STREAM_FRAME_LEN {
        return Err(CodecError::OversizeFrame(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// One item read off a multiplexed TCP/WebSocket byte stream that may carry
/// either framing (§4.A): a keepalive, intercepted below the sync layer, or
/// a decoded stream frame value.
pub enum WireItem<T> {
    Keepalive(KeepaliveKind),
    Frame(T),
}

/// Read the next item from `reader`, distinguishing a keepalive frame from
/// a length-prefixed stream frame by peeking the first 4 bytes: `APIN`/
/// `APON` is never a valid big-endian length under [`MAX_STREAM_FRAME_LEN`],
/// so the two framings never collide on the same stream.
pub async fn read_next_item<R, T>(reader: &mut R) -> Result<Option<WireItem<T>>, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if &prefix == KEEPALIVE_PING {
        let mut rest = [0u8; KEEPALIVE_FRAME_LEN - 4];
        reader.read_exact(&mut rest).await?;
        return Ok(Some(WireItem::Keepalive(KeepaliveKind::Ping)));
    }
    if &prefix == KEEPALIVE_PONG {
        let mut rest = [0u8; KEEPALIVE_FRAME_LEN - 4];
        reader.read_exact(&mut rest).await?;
        return Ok(Some(WireItem::Keepalive(KeepaliveKind::Pong)));
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_STREAM_FRAME_LEN {
        return Err(CodecError::OversizeFrame(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(WireItem::Frame(serde_json::from_slice(&body)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_frame_round_trip() {
        let value = json!({"type": "hello", "peer_id": "aa"});
        let encoded = encode_stream_frame(&value).unwrap();
        let (decoded, consumed): (serde_json::Value, usize) =
            try_decode_stream_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn stream_frame_partial_buffer_needs_more() {
        let value = json!({"a": 1});
        let encoded = encode_stream_frame(&value).unwrap();
        let partial = &encoded[..encoded.len() - 1];
        let result: Option<(serde_json::Value, usize)> =
            try_decode_stream_frame(partial).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn oversize_frame_rejected() {
        #[derive(serde::Serialize)]
        struct Big {
            data: Vec<u8>,
        }
        let big = Big {
            data: vec![0u8; MAX_STREAM_FRAME_LEN + 1],
        };
        assert!(matches!(
            encode_stream_frame(&big),
            Err(CodecError::OversizeFrame(_))
        ));
    }

    #[test]
    fn fragment_and_reassemble_round_trip() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        let fragments = fragment(&payload, 7, 64);
        assert!(fragments.len() > 1);
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for frag in &fragments {
            result = reassembler.feed("peer-a", frag).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn reassembly_tolerates_out_of_order_fragments() {
        let payload = b"hello atmosphere mesh".to_vec();
        let mut fragments = fragment(&payload, 1, 6);
        fragments.reverse();
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for frag in &fragments {
            result = reassembler.feed("peer-b", frag).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn beacon_round_trip() {
        let beacon = Beacon {
            peer_id: "aa".into(),
            app_id: "atmosphere".into(),
            tcp_port: 5555,
            name: Some("node-a".into()),
        };
        let encoded = encode_beacon(&beacon);
        assert_eq!(&encoded[0..4], BEACON_MAGIC);
        let decoded = decode_beacon(&encoded).unwrap();
        assert_eq!(decoded.peer_id, beacon.peer_id);
        assert_eq!(decoded.tcp_port, beacon.tcp_port);
    }

    #[test]
    fn beacon_rejects_bad_magic() {
        let bytes = b"XXXX{}".to_vec();
        assert!(matches!(decode_beacon(&bytes), Err(CodecError::BadMagic)));
    }

    #[test]
    fn keepalive_round_trip() {
        let ping = encode_keepalive(KeepaliveKind::Ping);
        assert_eq!(ping.len(), KEEPALIVE_FRAME_LEN);
        assert_eq!(decode_keepalive(&ping).unwrap(), KeepaliveKind::Ping);
        assert!(looks_like_keepalive(&ping));
    }

    #[tokio::test]
    async fn read_next_item_distinguishes_keepalive_from_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_keepalive(KeepaliveKind::Ping));
        buf.extend_from_slice(&encode_stream_frame(&json!({"type": "hello"})).unwrap());

        let mut cursor = std::io::Cursor::new(buf);
        match read_next_item::<_, serde_json::Value>(&mut cursor).await.unwrap() {
            Some(WireItem::Keepalive(KeepaliveKind::Ping)) => {}
            _ => panic!("expected keepalive first"),
        }
        match read_next_item::<_, serde_json::Value>(&mut cursor).await.unwrap() {
            Some(WireItem::Frame(v)) => assert_eq!(v["type"], "hello"),
            _ => panic!("expected frame second"),
        }
    }
}
