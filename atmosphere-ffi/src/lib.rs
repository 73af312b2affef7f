//! C ABI bridge around `atmosphere-core` for native host embedders (mobile
//! shells that own the platform BLE/Wi-Fi Aware stack, desktop shells that
//! want the mesh node without linking Rust directly).
//!
//! Exposes a C ABI (`extern "C"`) surface. Handles are the same opaque `u64`
//! ids `atmosphere_core::handle` already hands out — the FFI layer adds only
//! C-string marshalling and a shared tokio runtime, never a second handle
//! table.

pub mod bridge;
pub mod error;

use once_cell::sync::Lazy;

/// Shared tokio runtime for all FFI operations. Two worker threads — mesh
/// I/O is not CPU heavy, and host processes embedding this bridge are
/// typically thread-budget constrained themselves.
pub(crate) static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .build()
        .expect("failed to create tokio runtime")
});
