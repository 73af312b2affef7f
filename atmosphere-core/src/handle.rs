//! Process-wide handle table (§4.H, §9: "the core is reached only through
//! an opaque integer handle; no pointer or lifetime crosses the FFI
//! boundary"). `atmosphere-cli` and `atmosphere-ffi` both go through this
//! module rather than holding an `Arc<Node>` directly.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::config::MeshConfig;
use crate::error::CoreError;
use crate::gradient::CapabilityEntry;
use crate::node::Node;
use crate::peer::LinkClass;
use crate::store::Version;

static HANDLES: Lazy<DashMap<u64, std::sync::Arc<Node>>> = Lazy::new(DashMap::new);
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn lookup(handle: u64) -> Result<std::sync::Arc<Node>, CoreError> {
    HANDLES.get(&handle).map(|n| n.clone()).ok_or(CoreError::UnknownHandle)
}

/// `init(app_id, name, config) → handle` (§4.H).
pub fn init(config: MeshConfig, name: &str) -> Result<u64, CoreError> {
    let node = Node::open(config, name)?;
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    HANDLES.insert(handle, node);
    Ok(handle)
}

/// `start_mesh(handle) → listener_port` (§4.H).
pub async fn start_mesh(handle: u64) -> Result<u16, CoreError> {
    let node = lookup(handle)?;
    node.start_mesh()
        .await
        .map_err(|e| CoreError::Fatal(e.to_string()))
}

/// `stop(handle)` (§4.H). Removes the handle from the table; a stale handle
/// used afterward returns `UnknownHandle`, matching §7's "no handle is ever
/// silently reused".
pub async fn stop(handle: u64) -> Result<(), CoreError> {
    let node = lookup(handle)?;
    node.stop().await;
    HANDLES.remove(&handle);
    Ok(())
}

pub fn insert(
    handle: u64,
    collection: &str,
    doc_id: &str,
    payload: &serde_json::Value,
) -> Result<Version, CoreError> {
    lookup(handle)?.insert(collection, doc_id, payload)
}

pub fn query(handle: u64, collection: &str) -> Result<serde_json::Value, CoreError> {
    lookup(handle)?.query(collection)
}

pub fn get(handle: u64, collection: &str, doc_id: &str) -> Result<serde_json::Value, CoreError> {
    lookup(handle)?.get(collection, doc_id)
}

pub fn peers(handle: u64) -> Result<serde_json::Value, CoreError> {
    Ok(lookup(handle)?.peers())
}

pub fn capabilities(handle: u64) -> Result<Vec<CapabilityEntry>, CoreError> {
    lookup(handle)?.capabilities()
}

pub fn health(handle: u64) -> Result<serde_json::Value, CoreError> {
    Ok(lookup(handle)?.health())
}

// ---- Transport adapter hooks (§4.H), re-exposed through the handle table
// so a host process never needs to hold a Node directly. ----

pub fn poll_outbound(handle: u64, peer_id: &str) -> Result<Option<Vec<u8>>, CoreError> {
    Ok(lookup(handle)?.poll_outbound(peer_id))
}

pub fn feed_inbound(handle: u64, peer_id: &str, bytes: &[u8]) -> Result<(), CoreError> {
    lookup(handle)?.feed_inbound(peer_id, bytes);
    Ok(())
}

pub fn peer_discovered(handle: u64, device_id: &str, class: LinkClass) -> Result<u64, CoreError> {
    Ok(lookup(handle)?.peer_discovered(device_id, class))
}

pub fn peer_accepted(
    handle: u64,
    link_id: u64,
    peer_id: &str,
    device_id: &str,
) -> Result<(), CoreError> {
    lookup(handle)?.peer_accepted(link_id, peer_id, device_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> MeshConfig {
        MeshConfig {
            mesh_id: "mesh-1".into(),
            mesh_id_seed: "seed".into(),
            app_id: "atmosphere".into(),
            beacon_port: 0,
            relay_url: None,
            transport_lan: false,
            transport_ble: false,
            transport_wifi_aware: false,
            transport_relay: false,
            data_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn unknown_handle_is_reported_distinctly() {
        let err = insert(999_999, "x", "d1", &serde_json::json!({}));
        assert!(matches!(err, Err(CoreError::UnknownHandle)));
    }

    #[test]
    fn init_then_insert_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let handle = init(test_config(dir.path()), "node-a").unwrap();
        insert(handle, "x", "d1", &serde_json::json!({"v": 1})).unwrap();
        let doc = get(handle, "x", "d1").unwrap();
        assert_eq!(doc["payload"]["v"], 1);
    }

    #[tokio::test]
    async fn stop_invalidates_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = init(test_config(dir.path()), "node-a").unwrap();
        stop(handle).await.unwrap();
        assert!(matches!(get(handle, "x", "d1"), Err(CoreError::UnknownHandle)));
    }
}
