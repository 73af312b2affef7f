//! C ABI exports — the public surface consumed by a native host shell.
//!
//! All functions are `extern "C"` and `#[no_mangle]`. Handles are the same
//! opaque `u64` ids `atmosphere_core::handle` hands out; this module adds
//! only C-string marshalling and blocks the calling thread on `RUNTIME` for
//! the handful of operations that are genuinely async (`start_mesh`, `stop`).

use std::ffi::{c_char, CStr, CString};

use atmosphere_core::peer::LinkClass;
use atmosphere_core::handle;

use crate::error::FfiResult;
use crate::RUNTIME;

/// Read a C string pointer into a Rust `String`, returning `None` on null or
/// invalid UTF-8.
unsafe fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(String::from)
}

fn json_out(value: &serde_json::Value) -> *mut c_char {
    match CString::new(value.to_string()) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn parse_link_class(s: &str) -> Option<LinkClass> {
    match s {
        "lan" => Some(LinkClass::Lan),
        "ble" => Some(LinkClass::Ble),
        "wifi-aware" => Some(LinkClass::WifiAware),
        "relay" => Some(LinkClass::Relay),
        _ => None,
    }
}

// ─── Lifecycle ───────────────────────────────────────────────────────

/// Open a mesh node from a JSON-encoded `MeshConfig` and a default display
/// name for the identity file. Returns a non-zero handle on success, or 0 on
/// failure (invalid JSON, or the local store could not be opened).
///
/// # Safety
///
/// `config_json` and `name` must each be valid, NUL-terminated UTF-8 C
/// strings, or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_init(config_json: *const c_char, name: *const c_char) -> u64 {
    let Some(json_str) = (unsafe { read_c_str(config_json) }) else {
        tracing::error!("atmo_init: null or invalid config_json");
        return 0;
    };
    let Some(name_str) = (unsafe { read_c_str(name) }) else {
        tracing::error!("atmo_init: null or invalid name");
        return 0;
    };
    let config = match serde_json::from_str(&json_str) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("atmo_init: invalid config JSON: {e}");
            return 0;
        }
    };
    match handle::init(config, &name_str) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("atmo_init: {e}");
            0
        }
    }
}

/// Start the mesh on a handle previously returned by `atmo_init`. Blocks the
/// calling thread until the transport listeners are up; returns the LAN TCP
/// listener port, or 0 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn atmo_start_mesh(h: u64) -> u16 {
    match RUNTIME.block_on(handle::start_mesh(h)) {
        Ok(port) => port,
        Err(e) => {
            tracing::error!("atmo_start_mesh: {e}");
            0
        }
    }
}

/// Stop the mesh and invalidate the handle. Safe to call once; a second call
/// returns `InvalidHandle` rather than double-stopping anything.
#[unsafe(no_mangle)]
pub extern "C" fn atmo_stop(h: u64) -> i32 {
    match RUNTIME.block_on(handle::stop(h)) {
        Ok(()) => FfiResult::Ok as i32,
        Err(ref e) => FfiResult::from(e) as i32,
    }
}

// ─── Document store ──────────────────────────────────────────────────

/// Insert or update a document. `payload_json` must be a JSON value (object,
/// array, or scalar — the core does not interpret it). Returns `Ok` on
/// success.
///
/// # Safety
///
/// `collection`, `doc_id`, and `payload_json` must be valid, NUL-terminated
/// UTF-8 C strings, or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_insert(
    h: u64,
    collection: *const c_char,
    doc_id: *const c_char,
    payload_json: *const c_char,
) -> i32 {
    let Some(collection) = (unsafe { read_c_str(collection) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    let Some(doc_id) = (unsafe { read_c_str(doc_id) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    let Some(payload_str) = (unsafe { read_c_str(payload_json) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    let payload: serde_json::Value = match serde_json::from_str(&payload_str) {
        Ok(v) => v,
        Err(_) => return FfiResult::InvalidArgument as i32,
    };
    match handle::insert(h, &collection, &doc_id, &payload) {
        Ok(_) => FfiResult::Ok as i32,
        Err(ref e) => FfiResult::from(e) as i32,
    }
}

/// Query every live document in `collection`. Returns a heap-allocated JSON
/// array string that must be freed with `atmo_free_string`, or null on
/// error.
///
/// # Safety
///
/// `collection` must be a valid, NUL-terminated UTF-8 C string, or null. The
/// returned pointer must be freed with `atmo_free_string`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_query(h: u64, collection: *const c_char) -> *mut c_char {
    let Some(collection) = (unsafe { read_c_str(collection) }) else {
        return std::ptr::null_mut();
    };
    match handle::query(h, &collection) {
        Ok(v) => json_out(&v),
        Err(e) => {
            tracing::error!("atmo_query: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Fetch one document by id. Returns `null` (the JSON literal) serialized as
/// the string `"null"` if the document does not exist, distinct from a null
/// pointer which signals a handle/argument error.
///
/// # Safety
///
/// `collection` and `doc_id` must be valid, NUL-terminated UTF-8 C strings,
/// or null. The returned pointer must be freed with `atmo_free_string`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_get(
    h: u64,
    collection: *const c_char,
    doc_id: *const c_char,
) -> *mut c_char {
    let Some(collection) = (unsafe { read_c_str(collection) }) else {
        return std::ptr::null_mut();
    };
    let Some(doc_id) = (unsafe { read_c_str(doc_id) }) else {
        return std::ptr::null_mut();
    };
    match handle::get(h, &collection, &doc_id) {
        Ok(v) => json_out(&v),
        Err(e) => {
            tracing::error!("atmo_get: {e}");
            std::ptr::null_mut()
        }
    }
}

// ─── Mesh introspection ───────────────────────────────────────────────

/// JSON snapshot of known peers and their links (§4.H). Returned pointer
/// must be freed with `atmo_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn atmo_peers(h: u64) -> *mut c_char {
    match handle::peers(h) {
        Ok(v) => json_out(&v),
        Err(e) => {
            tracing::error!("atmo_peers: {e}");
            std::ptr::null_mut()
        }
    }
}

/// JSON array of the ranked gradient table (§4.G). Returned pointer must be
/// freed with `atmo_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn atmo_capabilities(h: u64) -> *mut c_char {
    match handle::capabilities(h) {
        Ok(entries) => match serde_json::to_value(entries) {
            Ok(v) => json_out(&v),
            Err(_) => std::ptr::null_mut(),
        },
        Err(e) => {
            tracing::error!("atmo_capabilities: {e}");
            std::ptr::null_mut()
        }
    }
}

/// JSON health snapshot (§4.H). Returned pointer must be freed with
/// `atmo_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn atmo_health(h: u64) -> *mut c_char {
    match handle::health(h) {
        Ok(v) => json_out(&v),
        Err(e) => {
            tracing::error!("atmo_health: {e}");
            std::ptr::null_mut()
        }
    }
}

// ─── Host-adapter transport hooks (§4.A, §4.C) ───────────────────────
//
// BLE and Wi-Fi Aware have no native Rust stack here — the host owns the
// platform adapter and drains/feeds bytes through these two functions.

/// Pop the next outbound frame queued for `peer_id` on an adapter-driven
/// link, if any. Returns a heap-allocated byte buffer via `out_ptr`/`out_len`
/// and `Ok`, or `Ok` with `out_len = 0` if nothing is queued.
///
/// # Safety
///
/// `peer_id` must be a valid, NUL-terminated UTF-8 C string. `out_ptr` and
/// `out_len` must be valid for writes. A non-null `*out_ptr` on return must
/// be freed with `atmo_free_bytes` using the paired `*out_len`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_poll_outbound(
    h: u64,
    peer_id: *const c_char,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let Some(peer_id) = (unsafe { read_c_str(peer_id) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    match handle::poll_outbound(h, &peer_id) {
        Ok(Some(mut bytes)) => {
            bytes.shrink_to_fit();
            let len = bytes.len();
            let ptr = bytes.as_mut_ptr();
            std::mem::forget(bytes);
            unsafe {
                *out_ptr = ptr;
                *out_len = len;
            }
            FfiResult::Ok as i32
        }
        Ok(None) => {
            unsafe {
                *out_ptr = std::ptr::null_mut();
                *out_len = 0;
            }
            FfiResult::Ok as i32
        }
        Err(ref e) => FfiResult::from(e) as i32,
    }
}

/// Feed inbound bytes received over an adapter-driven link for `peer_id`.
///
/// # Safety
///
/// `peer_id` must be a valid, NUL-terminated UTF-8 C string. `bytes` must
/// point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_feed_inbound(
    h: u64,
    peer_id: *const c_char,
    bytes: *const u8,
    len: usize,
) -> i32 {
    let Some(peer_id) = (unsafe { read_c_str(peer_id) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    if bytes.is_null() {
        return FfiResult::InvalidArgument as i32;
    }
    let slice = unsafe { std::slice::from_raw_parts(bytes, len) };
    match handle::feed_inbound(h, &peer_id, slice) {
        Ok(()) => FfiResult::Ok as i32,
        Err(ref e) => FfiResult::from(e) as i32,
    }
}

/// Tell the core a new adapter-driven peer device was discovered (scan
/// result, NAN publish/subscribe match). Returns the new link id, or 0 on
/// error.
///
/// # Safety
///
/// `device_id` and `class` must be valid, NUL-terminated UTF-8 C strings.
/// `class` must be one of `"ble"`, `"wifi-aware"`, `"lan"`, `"relay"`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_peer_discovered(
    h: u64,
    device_id: *const c_char,
    class: *const c_char,
) -> u64 {
    let Some(device_id) = (unsafe { read_c_str(device_id) }) else {
        return 0;
    };
    let Some(class_str) = (unsafe { read_c_str(class) }) else {
        return 0;
    };
    let Some(class) = parse_link_class(&class_str) else {
        return 0;
    };
    match handle::peer_discovered(h, &device_id, class) {
        Ok(link_id) => link_id,
        Err(e) => {
            tracing::error!("atmo_peer_discovered: {e}");
            0
        }
    }
}

/// Tell the core an adapter-driven link finished its transport-level
/// connection and identified as `peer_id` (e.g. after a BLE GATT
/// subscribe/ack exchange the host layer performed itself).
///
/// # Safety
///
/// `peer_id` and `device_id` must be valid, NUL-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_peer_accepted(
    h: u64,
    link_id: u64,
    peer_id: *const c_char,
    device_id: *const c_char,
) -> i32 {
    let Some(peer_id) = (unsafe { read_c_str(peer_id) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    let Some(device_id) = (unsafe { read_c_str(device_id) }) else {
        return FfiResult::InvalidArgument as i32;
    };
    match handle::peer_accepted(h, link_id, &peer_id, &device_id) {
        Ok(()) => FfiResult::Ok as i32,
        Err(ref e) => FfiResult::from(e) as i32,
    }
}

// ─── Memory ────────────────────────────────────────────────────────────

/// Free a string previously returned by one of this module's functions.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by one of this
/// module's `*_json`-returning functions. Must not be called more than once
/// for the same pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// Free a byte buffer previously returned by `atmo_poll_outbound`.
///
/// # Safety
///
/// `ptr`/`len` must be exactly the pair returned by `atmo_poll_outbound`, or
/// `ptr` null (in which case this is a no-op regardless of `len`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atmo_free_bytes(ptr: *mut u8, len: usize) {
    if !ptr.is_null() {
        drop(unsafe { Vec::from_raw_parts(ptr, len, len) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn test_config_json(dir: &std::path::Path) -> String {
        serde_json::json!({
            "mesh_id": "mesh-1",
            "mesh_id_seed": "seed",
            "app_id": "atmosphere",
            "beacon_port": 0,
            "transport_lan": false,
            "transport_ble": false,
            "transport_wifi_aware": false,
            "transport_relay": false,
            "data_dir": dir.to_string_lossy(),
        })
        .to_string()
    }

    #[test]
    fn init_returns_nonzero_handle_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = CString::new(test_config_json(dir.path())).unwrap();
        let name = CString::new("node-a").unwrap();
        let h = unsafe { atmo_init(config.as_ptr(), name.as_ptr()) };
        assert_ne!(h, 0);

        let collection = CString::new("notes").unwrap();
        let doc_id = CString::new("d1").unwrap();
        let payload = CString::new(r#"{"text":"hi"}"#).unwrap();
        let rc =
            unsafe { atmo_insert(h, collection.as_ptr(), doc_id.as_ptr(), payload.as_ptr()) };
        assert_eq!(rc, FfiResult::Ok as i32);

        let ptr = unsafe { atmo_get(h, collection.as_ptr(), doc_id.as_ptr()) };
        assert!(!ptr.is_null());
        let json_str = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        let parsed: serde_json::Value = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed["payload"]["text"], "hi");
        unsafe { atmo_free_string(ptr) };
    }

    #[test]
    fn init_with_invalid_json_returns_zero() {
        let config = CString::new("not json").unwrap();
        let name = CString::new("node-a").unwrap();
        let h = unsafe { atmo_init(config.as_ptr(), name.as_ptr()) };
        assert_eq!(h, 0);
    }

    #[test]
    fn invalid_handle_is_reported_distinctly() {
        let collection = CString::new("x").unwrap();
        let doc_id = CString::new("d1").unwrap();
        let payload = CString::new("{}").unwrap();
        let rc = unsafe {
            atmo_insert(999_999, collection.as_ptr(), doc_id.as_ptr(), payload.as_ptr())
        };
        assert_eq!(rc, FfiResult::InvalidHandle as i32);

        let ptr = unsafe { atmo_get(999_999, collection.as_ptr(), doc_id.as_ptr()) };
        assert!(ptr.is_null());
    }

    #[test]
    fn null_args_return_invalid_argument() {
        let rc = unsafe { atmo_insert(1, std::ptr::null(), std::ptr::null(), std::ptr::null()) };
        assert_eq!(rc, FfiResult::InvalidArgument as i32);
    }

    #[test]
    fn unknown_link_class_string_is_rejected() {
        let device_id = CString::new("dev-1").unwrap();
        let class = CString::new("carrier-pigeon").unwrap();
        let link_id = unsafe { atmo_peer_discovered(1, device_id.as_ptr(), class.as_ptr()) };
        assert_eq!(link_id, 0);
    }

    #[test]
    fn free_null_pointers_are_no_ops() {
        unsafe { atmo_free_string(std::ptr::null_mut()) };
        unsafe { atmo_free_bytes(std::ptr::null_mut(), 0) };
    }
}
