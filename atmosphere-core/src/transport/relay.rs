//! Relay transport driver (§4.C "Relay").
//!
//! Outbound WebSocket to a configured URL; frames are stream-framed (§4.A)
//! directly over binary WS messages. The relay is otherwise a single peer
//! hint source proxying to whichever remote peers it knows. Grounded on the
//! client-side WebSocket sync usage pattern in `Dr1mH4X-RustSyncCV-Client`;
//! the teacher repo has no WebSocket *client* of its own to draw from.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::{encode_stream_frame, try_decode_stream_frame};
use crate::error::CodecError;

/// A connected relay link: bytes in, stream frames out, matching the shape
/// every other transport hands the multiplexer.
pub struct RelayLink {
    pub outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Connect to `url` and run the binary WS <-> stream-frame bridge as two
/// background tasks. Returns immediately with channels; the caller treats
/// this exactly like a TCP link for framing purposes.
pub async fn dial(url: &str) -> Result<RelayLink, CodecError> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| CodecError::Malformed(format!("relay connect failed: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut buf: Vec<u8> = Vec::new();
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Binary(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    // Stream frames may span multiple WS messages or one WS
                    // message may carry several; drain what's complete.
                    loop {
                        match try_decode_stream_frame::<serde_json::Value>(&buf) {
                            Ok(Some((_, consumed))) => {
                                let frame = buf[..consumed].to_vec();
                                buf.drain(..consumed);
                                if inbound_tx.send(frame).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(_) => {
                                buf.clear();
                                break;
                            }
                        }
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    Ok(RelayLink {
        outbound_tx,
        inbound_rx,
    })
}

/// Encode a value as a relay-bound binary WS frame payload.
pub fn encode_for_relay<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    encode_stream_frame(value)
}
