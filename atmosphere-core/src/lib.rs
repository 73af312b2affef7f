//! Core mesh node: CRDT document store, peer discovery/handshake, the
//! per-link sync protocol, and the transport multiplexer across LAN, BLE,
//! Wi-Fi Aware and WebSocket relay links.
//!
//! Hosts reach the mesh only through [`handle`]'s opaque integer handles —
//! [`node::Node`] itself is public for `atmosphere-cli`'s convenience, but
//! `atmosphere-ffi` and any other embedder should go through `handle`.

pub mod codec;
pub mod config;
pub mod error;
pub mod gradient;
pub mod handle;
pub mod handshake;
pub mod identity;
pub mod mux;
pub mod node;
pub mod peer;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::MeshConfig;
pub use error::CoreError;
pub use node::Node;
